//! Passphrase-protected session file.
//!
//! File layout: `salt (16) || nonce (12) || ciphertext`. The key is derived
//! from the passphrase with Argon2 once per store; each save seals the record
//! under a fresh random nonce.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use anyhow::{anyhow, Context, Result};
use argon2::Argon2;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::RngCore;

use super::store::{remove_if_exists, write_atomic, StoredSession, TokenStore};

const SESSION_FILE: &str = "session.enc";
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

pub struct EncryptedFileTokenStore {
    path: PathBuf,
    salt: [u8; SALT_LEN],
    cipher: ChaCha20Poly1305,
    io_lock: Mutex<()>,
}

impl EncryptedFileTokenStore {
    /// Open (or prepare) the encrypted session file in `cache_dir`.
    ///
    /// An existing file's salt is reused so its record stays readable; otherwise
    /// a new salt is generated and written with the first save.
    pub fn open(cache_dir: impl Into<PathBuf>, passphrase: &str) -> Result<Self> {
        let path = cache_dir.into().join(SESSION_FILE);

        let mut salt = [0u8; SALT_LEN];
        match std::fs::read(&path) {
            Ok(bytes) if bytes.len() >= SALT_LEN => salt.copy_from_slice(&bytes[..SALT_LEN]),
            Ok(_) => return Err(anyhow!("Encrypted session file is truncated")),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                rand::thread_rng().fill_bytes(&mut salt);
            }
            Err(e) => return Err(e).context("Failed to read encrypted session file"),
        }

        let cipher = Self::derive_cipher(passphrase, &salt)?;

        Ok(Self {
            path,
            salt,
            cipher,
            io_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn derive_cipher(passphrase: &str, salt: &[u8]) -> Result<ChaCha20Poly1305> {
        let mut key = [0u8; KEY_LEN];
        Argon2::default()
            .hash_password_into(passphrase.as_bytes(), salt, &mut key)
            .map_err(|e| anyhow!("Failed to derive session key: {}", e))?;
        Ok(ChaCha20Poly1305::new(Key::from_slice(&key)))
    }
}

impl TokenStore for EncryptedFileTokenStore {
    fn save(&self, session: &StoredSession) -> Result<()> {
        let _guard = self.io_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let plaintext = serde_json::to_vec(session)?;

        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_slice())
            .map_err(|_| anyhow!("Failed to encrypt session"))?;

        let mut contents = Vec::with_capacity(SALT_LEN + NONCE_LEN + ciphertext.len());
        contents.extend_from_slice(&self.salt);
        contents.extend_from_slice(&nonce);
        contents.extend_from_slice(&ciphertext);
        write_atomic(&self.path, &contents)
    }

    fn load(&self) -> Result<Option<StoredSession>> {
        let _guard = self.io_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let contents = match std::fs::read(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).context("Failed to read encrypted session file"),
        };
        if contents.len() < SALT_LEN + NONCE_LEN {
            return Err(anyhow!("Encrypted session file is truncated"));
        }
        if contents[..SALT_LEN] != self.salt {
            return Err(anyhow!("Encrypted session file was replaced by another store"));
        }

        let (nonce, ciphertext) = contents[SALT_LEN..].split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| anyhow!("Failed to decrypt session (wrong passphrase or corrupted file)"))?;

        let session = serde_json::from_slice(&plaintext).context("Failed to parse decrypted session")?;
        Ok(Some(session))
    }

    fn clear(&self) -> Result<()> {
        let _guard = self.io_lock.lock().unwrap_or_else(PoisonError::into_inner);
        remove_if_exists(&self.path)
    }
}
