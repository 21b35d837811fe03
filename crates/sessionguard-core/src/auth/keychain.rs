use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Result};
use keyring::Entry;

use super::store::{StoredSession, TokenStore};

const SERVICE_NAME: &str = "sessionguard";

/// Session record kept in the OS keychain.
///
/// The whole record lives in a single entry so a save replaces access token,
/// refresh token and user snapshot in one write.
pub struct KeychainTokenStore {
    entry: Entry,
    io_lock: Mutex<()>,
}

impl KeychainTokenStore {
    pub fn new(account: &str) -> Result<Self> {
        Self::with_service(SERVICE_NAME, account)
    }

    pub fn with_service(service: &str, account: &str) -> Result<Self> {
        let entry = Entry::new(service, account).context("Failed to create keyring entry")?;
        Ok(Self::from_entry(entry))
    }

    /// Use an already built entry (a specific keychain target, or a mock backend).
    pub fn from_entry(entry: Entry) -> Self {
        Self {
            entry,
            io_lock: Mutex::new(()),
        }
    }
}

impl TokenStore for KeychainTokenStore {
    fn save(&self, session: &StoredSession) -> Result<()> {
        let _guard = self.io_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let contents = serde_json::to_string(session)?;
        self.entry
            .set_password(&contents)
            .context("Failed to store session in keychain")?;
        Ok(())
    }

    fn load(&self) -> Result<Option<StoredSession>> {
        let _guard = self.io_lock.lock().unwrap_or_else(PoisonError::into_inner);
        match self.entry.get_password() {
            Ok(contents) => {
                let session = serde_json::from_str(&contents)
                    .context("Failed to parse session from keychain")?;
                Ok(Some(session))
            }
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e).context("Failed to retrieve session from keychain"),
        }
    }

    fn clear(&self) -> Result<()> {
        let _guard = self.io_lock.lock().unwrap_or_else(PoisonError::into_inner);
        match self.entry.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e).context("Failed to delete session from keychain"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keyring::mock::MockCredential;

    use crate::testing::session_for;

    // Mock credentials keep their secret inside the entry, so each test gets its own
    fn mock_entry() -> Entry {
        Entry::new_with_credential(Box::new(MockCredential::default()))
    }

    #[test]
    fn test_save_and_load() {
        let store = KeychainTokenStore::from_entry(mock_entry());
        let session = session_for("alice", "refresh-1", 3600);

        assert!(store.load().unwrap().is_none());
        store.save(&session).unwrap();

        assert_eq!(store.load().unwrap(), Some(session));
    }

    #[test]
    fn test_save_replaces_whole_record() {
        let store = KeychainTokenStore::from_entry(mock_entry());
        store.save(&session_for("alice", "refresh-1", 3600)).unwrap();
        let replacement = session_for("bob", "refresh-2", 3600);

        store.save(&replacement).unwrap();

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.user.subject, "bob");
        assert_eq!(loaded.refresh_token, "refresh-2");
    }

    #[test]
    fn test_clear_twice_and_when_empty() {
        let store = KeychainTokenStore::from_entry(mock_entry());
        store.clear().unwrap();

        store.save(&session_for("alice", "refresh-1", 3600)).unwrap();
        store.clear().unwrap();
        store.clear().unwrap();

        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn test_corrupt_entry_is_an_error() {
        let entry = mock_entry();
        entry.set_password("{not json").unwrap();
        let store = KeychainTokenStore::from_entry(entry);

        let err = store.load().unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to parse session from keychain"));
    }

    #[test]
    fn test_backend_failure_is_reported() {
        let entry = mock_entry();
        let mock: &MockCredential = entry.get_credential().downcast_ref().unwrap();
        mock.set_error(keyring::Error::PlatformFailure("locked".into()));
        let store = KeychainTokenStore::from_entry(entry);

        assert!(store.load().is_err());
        // The injected error is consumed by the first call
        assert!(store.load().unwrap().is_none());
    }
}
