use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::debug;

use super::{StorageBackend, StoreError};

/// Credentials file name in the storage directory
const CREDENTIALS_FILE: &str = "credentials.json";

/// Lock file guarding read-modify-write cycles across processes
const LOCK_FILE: &str = "credentials.lock";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoredValues {
    #[serde(default)]
    values: BTreeMap<String, String>,
    updated_at: Option<DateTime<Utc>>,
}

/// Storage persisted as a JSON file.
///
/// The file is re-read on every access so that other processes sharing
/// the directory observe writes. Updates hold an exclusive lock on
/// `credentials.lock` and replace the file atomically. On unix the file is
/// readable by its owner only.
pub struct FileStorage {
    dir: PathBuf,
    // Serializes read-modify-write cycles within this process
    write_lock: Mutex<()>,
}

impl FileStorage {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(CREDENTIALS_FILE)
    }

    /// When the file was last written, if it exists
    pub fn updated_at(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self.load()?.updated_at)
    }

    fn load(&self) -> Result<StoredValues, StoreError> {
        let path = self.path();
        if !path.exists() {
            return Ok(StoredValues::default());
        }
        let contents = std::fs::read_to_string(&path)?;
        if contents.trim().is_empty() {
            return Ok(StoredValues::default());
        }
        Ok(serde_json::from_str(&contents)?)
    }

    fn save(&self, stored: &StoredValues) -> Result<(), StoreError> {
        let contents = serde_json::to_string_pretty(stored)?;
        // A uniquely named sibling (created 0600) is renamed over the file,
        // so readers never see a half-written file
        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(contents.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(self.path()).map_err(|e| e.error)?;
        Ok(())
    }

    fn lock_dir(&self) -> Result<File, StoreError> {
        std::fs::create_dir_all(&self.dir)?;
        let mut opts = OpenOptions::new();
        opts.create(true).truncate(false).read(true).write(true);

        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            opts.mode(0o600);
        }

        let lock = opts.open(self.dir.join(LOCK_FILE))?;
        lock.lock_exclusive()?;
        Ok(lock)
    }

    fn update<F>(&self, f: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut BTreeMap<String, String>),
    {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| StoreError::Unavailable("file storage lock poisoned".to_string()))?;
        // Released when the handle is closed
        let _lock = self.lock_dir()?;
        let mut stored = self.load()?;
        f(&mut stored.values);
        stored.updated_at = Some(Utc::now());
        self.save(&stored)
    }
}

impl StorageBackend for FileStorage {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.load()?.values.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.update(|values| {
            values.insert(key.to_string(), value.to_string());
        })?;
        debug!(key = key, "Stored credential field");
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        if !self.path().exists() {
            return Ok(());
        }
        self.update(|values| {
            values.remove(key);
        })
    }
}
