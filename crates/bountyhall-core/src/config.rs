//! Application configuration management.
//!
//! This module handles loading and saving the application configuration:
//! the API base URL, refresh endpoint, request timeout, and which storage
//! medium holds the session credentials.
//!
//! Configuration is stored at `~/.config/bountyhall/config.json`.
//! A per-run base URL override (flag or environment) is applied with
//! `with_api_base` and never written back to disk.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::api::transport::DEFAULT_TIMEOUT_SECS;
use crate::auth::{FileStorage, KeychainStorage, MemoryStorage, StorageBackend};

/// Application name used for config/cache directory paths
const APP_NAME: &str = "bountyhall";

/// Config file name
const CONFIG_FILE: &str = "config.json";

pub const DEFAULT_API_BASE: &str = "http://localhost:8080/api/v1";

pub const DEFAULT_REFRESH_PATH: &str = "/auth/refresh";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    #[default]
    File,
    Keyring,
    Memory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api_base: String,
    pub refresh_path: String,
    pub request_timeout_secs: u64,
    pub storage: StorageKind,
    pub last_phone: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            refresh_path: DEFAULT_REFRESH_PATH.to_string(),
            request_timeout_secs: DEFAULT_TIMEOUT_SECS,
            storage: StorageKind::default(),
            last_phone: None,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            serde_json::from_str(&contents).context("Failed to parse config file")
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn cache_dir(&self) -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }

    /// Copy of this config pointed at `api_base`, for use in this run only.
    /// A blank override is ignored.
    pub fn with_api_base(&self, api_base: Option<&str>) -> Config {
        let mut effective = self.clone();
        if let Some(base) = api_base.map(str::trim).filter(|b| !b.is_empty()) {
            effective.api_base = base.to_string();
        }
        effective
    }

    pub fn refresh_url(&self) -> String {
        format!("{}{}", self.api_base.trim_end_matches('/'), self.refresh_path)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Build the storage medium selected by `storage`
    pub fn storage_backend(&self) -> Result<Arc<dyn StorageBackend>> {
        Ok(match self.storage {
            StorageKind::File => Arc::new(FileStorage::new(self.cache_dir()?)),
            StorageKind::Keyring => Arc::new(KeychainStorage::default()),
            StorageKind::Memory => Arc::new(MemoryStorage::new()),
        })
    }
}
