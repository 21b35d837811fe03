use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError, RwLock};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::codec::{TokenCodec, UserClaims};
use super::SessionError;

/// Session file name in cache directory
const SESSION_FILE: &str = "session.json";

/// An access/refresh token pair. Never stored half-filled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialPair {
    pub access_token: String,
    pub refresh_token: String,
}

/// The persisted session record: access credential, refresh credential and
/// the user snapshot derived from the access credential, always written as one unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredSession {
    pub access_token: String,
    pub refresh_token: String,
    pub user: UserClaims,
    pub saved_at: DateTime<Utc>,
}

impl StoredSession {
    /// Build a record from a freshly issued pair, deriving the user snapshot.
    pub fn new(pair: CredentialPair) -> Result<Self, SessionError> {
        let claims = TokenCodec::decode(&pair.access_token)?;
        Ok(Self {
            access_token: pair.access_token,
            refresh_token: pair.refresh_token,
            user: claims.user(),
            saved_at: Utc::now(),
        })
    }
}

/// Persistence for the session record.
///
/// Implementations must make `save` atomic with respect to `load`: a reader
/// sees either the previous record or the new one, never a mix. `clear` must
/// succeed when there is nothing (or only part of a record) to remove.
pub trait TokenStore: Send + Sync {
    fn save(&self, session: &StoredSession) -> Result<()>;

    fn load(&self) -> Result<Option<StoredSession>>;

    fn clear(&self) -> Result<()>;
}

/// Process-local store. Sessions die with the process.
#[derive(Default)]
pub struct MemoryTokenStore {
    session: RwLock<Option<StoredSession>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TokenStore for MemoryTokenStore {
    fn save(&self, session: &StoredSession) -> Result<()> {
        *self.session.write().unwrap_or_else(PoisonError::into_inner) = Some(session.clone());
        Ok(())
    }

    fn load(&self) -> Result<Option<StoredSession>> {
        Ok(self
            .session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    fn clear(&self) -> Result<()> {
        *self.session.write().unwrap_or_else(PoisonError::into_inner) = None;
        Ok(())
    }
}

/// JSON file store in the cache directory.
pub struct FileTokenStore {
    path: PathBuf,
    io_lock: Mutex<()>,
}

impl FileTokenStore {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            path: cache_dir.into().join(SESSION_FILE),
            io_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TokenStore for FileTokenStore {
    fn save(&self, session: &StoredSession) -> Result<()> {
        let _guard = self.io_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let contents = serde_json::to_string_pretty(session)?;
        write_atomic(&self.path, contents.as_bytes())
    }

    fn load(&self) -> Result<Option<StoredSession>> {
        let _guard = self.io_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if !self.path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(&self.path)
            .context("Failed to read session file")?;
        let session: StoredSession = serde_json::from_str(&contents)
            .context("Failed to parse session file")?;
        Ok(Some(session))
    }

    fn clear(&self) -> Result<()> {
        let _guard = self.io_lock.lock().unwrap_or_else(PoisonError::into_inner);
        remove_if_exists(&self.path)?;
        // A crash mid-save can leave the temp file behind
        remove_if_exists(&temp_path(&self.path))
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Write to a sibling temp file and rename it over the target, so readers
/// never observe a half-written record.
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {}", parent.display()))?;
    }
    let tmp = temp_path(path);
    std::fs::write(&tmp, contents)
        .with_context(|| format!("Failed to write {}", tmp.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))
            .context("Failed to restrict session file permissions")?;
    }

    std::fs::rename(&tmp, path)
        .with_context(|| format!("Failed to move session file into {}", path.display()))?;
    Ok(())
}

pub(crate) fn remove_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Failed to remove {}", path.display())),
    }
}
