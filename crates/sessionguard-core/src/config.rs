//! Session configuration management.
//!
//! This module handles loading and saving the configuration: identity
//! endpoints, API base URL, token timing, HTTP policy and the store backend.
//!
//! Configuration is stored at `~/.config/sessionguard/config.json` and every
//! field can be overridden with a `SESSIONGUARD_*` environment variable.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use crate::auth::{
    EncryptedFileTokenStore, FileTokenStore, KeychainTokenStore, MemoryTokenStore, TokenStore,
};

/// Application name used for config/cache directory paths
const APP_NAME: &str = "sessionguard";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Environment variable holding the passphrase for the encrypted store
pub const PASSPHRASE_ENV: &str = "SESSIONGUARD_PASSPHRASE";

/// Refresh this many seconds before the access token actually expires.
const DEFAULT_SKEW_SECONDS: i64 = 10;

/// HTTP request timeout in seconds, shared by API and identity calls.
/// 30s allows for slow API responses while failing fast enough for good UX.
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Maximum number of retries for rate-limited (429) requests.
const DEFAULT_MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
const DEFAULT_INITIAL_BACKOFF_MS: u64 = 1000;

/// Where the session record is persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    #[default]
    File,
    Keychain,
    Encrypted,
}

impl FromStr for StoreBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "memory" => Ok(StoreBackend::Memory),
            "file" => Ok(StoreBackend::File),
            "keychain" | "keyring" => Ok(StoreBackend::Keychain),
            "encrypted" => Ok(StoreBackend::Encrypted),
            other => Err(anyhow!("Unknown store backend: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub token_url: String,
    pub refresh_url: String,
    pub api_base_url: String,
    pub skew_seconds: i64,
    /// Adopt the refresh token returned by a refresh call (when there is one).
    /// When false the original refresh token is kept for the whole session.
    pub rotate_refresh_tokens: bool,
    pub request_timeout_secs: u64,
    pub max_rate_limit_retries: u32,
    pub initial_backoff_ms: u64,
    pub store: StoreBackend,
    pub store_dir: Option<PathBuf>,
    pub keychain_account: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            token_url: "http://localhost:8080/auth/token".to_string(),
            refresh_url: "http://localhost:8080/auth/refresh".to_string(),
            api_base_url: "http://localhost:8080/api".to_string(),
            skew_seconds: DEFAULT_SKEW_SECONDS,
            rotate_refresh_tokens: true,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            max_rate_limit_retries: DEFAULT_MAX_RATE_LIMIT_RETRIES,
            initial_backoff_ms: DEFAULT_INITIAL_BACKOFF_MS,
            store: StoreBackend::default(),
            store_dir: None,
            keychain_account: "default".to_string(),
        }
    }
}

impl SessionConfig {
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse config file {}", path.display()))
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<PathBuf> {
        let path = Self::config_path()?;
        self.save_to(&path)?;
        Ok(path)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)
            .with_context(|| format!("Failed to write config file {}", path.display()))?;
        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn cache_dir(&self) -> Result<PathBuf> {
        if let Some(ref dir) = self.store_dir {
            return Ok(dir.clone());
        }
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }

    /// Apply `SESSIONGUARD_*` overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from any key lookup (the environment in production).
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("SESSIONGUARD_TOKEN_URL") {
            self.token_url = v;
        }
        if let Some(v) = lookup("SESSIONGUARD_REFRESH_URL") {
            self.refresh_url = v;
        }
        if let Some(v) = lookup("SESSIONGUARD_API_BASE_URL") {
            self.api_base_url = v;
        }
        if let Some(v) = lookup("SESSIONGUARD_SKEW_SECONDS") {
            self.skew_seconds = v.parse().context("SESSIONGUARD_SKEW_SECONDS must be an integer")?;
        }
        if let Some(v) = lookup("SESSIONGUARD_ROTATE_REFRESH_TOKENS") {
            self.rotate_refresh_tokens = parse_bool(&v)
                .context("SESSIONGUARD_ROTATE_REFRESH_TOKENS must be true or false")?;
        }
        if let Some(v) = lookup("SESSIONGUARD_REQUEST_TIMEOUT_SECS") {
            self.request_timeout_secs = v
                .parse()
                .context("SESSIONGUARD_REQUEST_TIMEOUT_SECS must be a number")?;
        }
        if let Some(v) = lookup("SESSIONGUARD_MAX_RATE_LIMIT_RETRIES") {
            self.max_rate_limit_retries = v
                .parse()
                .context("SESSIONGUARD_MAX_RATE_LIMIT_RETRIES must be a number")?;
        }
        if let Some(v) = lookup("SESSIONGUARD_INITIAL_BACKOFF_MS") {
            self.initial_backoff_ms = v
                .parse()
                .context("SESSIONGUARD_INITIAL_BACKOFF_MS must be a number")?;
        }
        if let Some(v) = lookup("SESSIONGUARD_STORE") {
            self.store = v.parse()?;
        }
        if let Some(v) = lookup("SESSIONGUARD_STORE_DIR") {
            self.store_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("SESSIONGUARD_KEYCHAIN_ACCOUNT") {
            self.keychain_account = v;
        }
        Ok(())
    }

    /// Open the configured session store backend.
    pub fn open_store(&self) -> Result<Arc<dyn TokenStore>> {
        let store: Arc<dyn TokenStore> = match self.store {
            StoreBackend::Memory => Arc::new(MemoryTokenStore::new()),
            StoreBackend::File => Arc::new(FileTokenStore::new(self.cache_dir()?)),
            StoreBackend::Keychain => Arc::new(KeychainTokenStore::new(&self.keychain_account)?),
            StoreBackend::Encrypted => {
                let passphrase = std::env::var(PASSPHRASE_ENV)
                    .with_context(|| format!("{} must be set for the encrypted store", PASSPHRASE_ENV))?;
                Arc::new(EncryptedFileTokenStore::open(self.cache_dir()?, &passphrase)?)
            }
        };
        Ok(store)
    }
}

fn parse_bool(value: &str) -> Result<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(anyhow!("not a boolean: {}", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_partial_config_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"skew_seconds": 30, "store": "memory"}"#).unwrap();

        let config = SessionConfig::load_from(&path).unwrap();
        assert_eq!(config.skew_seconds, 30);
        assert_eq!(config.store, StoreBackend::Memory);
        assert!(config.rotate_refresh_tokens);
        assert_eq!(config.request_timeout_secs, DEFAULT_REQUEST_TIMEOUT_SECS);
    }

    #[test]
    fn test_missing_config_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = SessionConfig::load_from(&dir.path().join("nope.json")).unwrap();
        assert_eq!(config.skew_seconds, DEFAULT_SKEW_SECONDS);
        assert_eq!(config.store, StoreBackend::File);
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = [
            ("SESSIONGUARD_API_BASE_URL", "https://api.example.com"),
            ("SESSIONGUARD_SKEW_SECONDS", "5"),
            ("SESSIONGUARD_ROTATE_REFRESH_TOKENS", "off"),
            ("SESSIONGUARD_STORE", "Keyring"),
            ("SESSIONGUARD_STORE_DIR", "/tmp/sg"),
            ("SESSIONGUARD_MAX_RATE_LIMIT_RETRIES", "7"),
            ("SESSIONGUARD_INITIAL_BACKOFF_MS", "250"),
        ]
        .into_iter()
        .collect();

        let mut config = SessionConfig::default();
        config
            .apply_overrides(|key| vars.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.api_base_url, "https://api.example.com");
        assert_eq!(config.skew_seconds, 5);
        assert!(!config.rotate_refresh_tokens);
        assert_eq!(config.store, StoreBackend::Keychain);
        assert_eq!(config.cache_dir().unwrap(), PathBuf::from("/tmp/sg"));
        assert_eq!(config.max_rate_limit_retries, 7);
        assert_eq!(config.initial_backoff_ms, 250);
    }

    #[test]
    fn test_saved_config_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let config = SessionConfig {
            api_base_url: "https://api.example.com".to_string(),
            store: StoreBackend::Encrypted,
            initial_backoff_ms: 250,
            ..SessionConfig::default()
        };

        config.save_to(&path).unwrap();
        let loaded = SessionConfig::load_from(&path).unwrap();

        assert_eq!(loaded.api_base_url, "https://api.example.com");
        assert_eq!(loaded.store, StoreBackend::Encrypted);
        assert_eq!(loaded.initial_backoff_ms, 250);
    }

    #[test]
    fn test_bad_override_is_an_error() {
        let mut config = SessionConfig::default();
        let result = config.apply_overrides(|key| {
            (key == "SESSIONGUARD_SKEW_SECONDS").then(|| "soon".to_string())
        });
        assert!(result.is_err());
        assert!("floppy".parse::<StoreBackend>().is_err());
    }
}
