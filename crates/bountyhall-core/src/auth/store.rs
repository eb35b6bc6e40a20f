use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::debug;

use super::StoreError;

/// Synchronous string-keyed storage medium.
///
/// Implementations must make a successful `set` visible to every later
/// `get` through the same backend.
pub trait StorageBackend: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
    fn remove(&self, key: &str) -> Result<(), StoreError>;
}

/// The fields making up a credential record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CredentialField {
    Token,
    Phone,
    Username,
}

impl CredentialField {
    pub const ALL: [CredentialField; 3] = [
        CredentialField::Token,
        CredentialField::Phone,
        CredentialField::Username,
    ];

    /// Key under which the field is persisted
    pub fn storage_key(self) -> &'static str {
        match self {
            CredentialField::Token => "token",
            CredentialField::Phone => "user_phone",
            CredentialField::Username => "user_username",
        }
    }
}

/// Point-in-time copy of every credential field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CredentialRecord {
    pub token: Option<String>,
    pub phone: Option<String>,
    pub username: Option<String>,
}

impl CredentialRecord {
    pub fn is_authenticated(&self) -> bool {
        self.token.is_some()
    }
}

/// Accessors for the session credentials.
/// Clone is cheap - all clones share the same backend.
#[derive(Clone)]
pub struct CredentialStore {
    backend: Arc<dyn StorageBackend>,
}

impl CredentialStore {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    /// A store backed by process-local memory
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStorage::new()))
    }

    /// Read a field. Empty values read back as absent.
    pub fn get(&self, field: CredentialField) -> Result<Option<String>, StoreError> {
        let value = self.backend.get(field.storage_key())?;
        Ok(value.filter(|v| !v.is_empty()))
    }

    pub fn set(&self, field: CredentialField, value: &str) -> Result<(), StoreError> {
        self.backend.set(field.storage_key(), value)
    }

    pub fn clear(&self, field: CredentialField) -> Result<(), StoreError> {
        self.backend.remove(field.storage_key())
    }

    /// Remove every credential field.
    ///
    /// All fields are attempted even if one fails; the first failure is
    /// returned.
    pub fn clear_all(&self) -> Result<(), StoreError> {
        let mut first_error = None;
        for field in CredentialField::ALL {
            if let Err(e) = self.clear(field) {
                first_error.get_or_insert(e);
            }
        }
        debug!("Cleared all credential fields");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn token(&self) -> Result<Option<String>, StoreError> {
        self.get(CredentialField::Token)
    }

    pub fn set_token(&self, token: &str) -> Result<(), StoreError> {
        self.set(CredentialField::Token, token)
    }

    pub fn phone(&self) -> Result<Option<String>, StoreError> {
        self.get(CredentialField::Phone)
    }

    pub fn set_phone(&self, phone: &str) -> Result<(), StoreError> {
        self.set(CredentialField::Phone, phone)
    }

    pub fn username(&self) -> Result<Option<String>, StoreError> {
        self.get(CredentialField::Username)
    }

    pub fn set_username(&self, username: &str) -> Result<(), StoreError> {
        self.set(CredentialField::Username, username)
    }

    pub fn is_authenticated(&self) -> Result<bool, StoreError> {
        Ok(self.token()?.is_some())
    }

    pub fn snapshot(&self) -> Result<CredentialRecord, StoreError> {
        Ok(CredentialRecord {
            token: self.token()?,
            phone: self.phone()?,
            username: self.username()?,
        })
    }
}

/// Process-local storage. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn values(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, String>>, StoreError> {
        self.values
            .lock()
            .map_err(|_| StoreError::Unavailable("memory storage lock poisoned".to_string()))
    }
}

impl StorageBackend for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.values()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.values()?.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.values()?.remove(key);
        Ok(())
    }
}
