use keyring::Entry;

use super::{StorageBackend, StoreError};

/// Default keychain service name
pub const DEFAULT_SERVICE: &str = "bountyhall";

/// Storage in the OS keychain, one entry per key under a service name.
pub struct KeychainStorage {
    service: String,
}

impl KeychainStorage {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self, key: &str) -> Result<Entry, StoreError> {
        Ok(Entry::new(&self.service, key)?)
    }
}

impl Default for KeychainStorage {
    fn default() -> Self {
        Self::new(DEFAULT_SERVICE)
    }
}

impl StorageBackend for KeychainStorage {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        match self.entry(key)?.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.entry(key)?.set_password(value)?;
        Ok(())
    }

    /// Delete the entry. A missing entry is not an error.
    fn remove(&self, key: &str) -> Result<(), StoreError> {
        match self.entry(key)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
