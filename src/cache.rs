//! Local cache store.
//!
//! File-per-key JSON documents under the app's cache directory. Writes
//! are synchronous and last-write-wins; there is no merge. A missing or
//! corrupt entry reads back as absent rather than failing the caller.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::PathBuf;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::SyncError;

/// Persistent key-value map of JSON documents.
#[derive(Debug, Clone)]
pub struct CacheStore {
    dir: PathBuf,
}

impl CacheStore {
    /// Open the store at the default location (`~/.kineapp/cache`).
    pub fn open() -> anyhow::Result<Self> {
        let config = Config::load_or_default();
        let dir = match config.cache_dir {
            Some(dir) => dir,
            None => Config::default_cache_dir()?,
        };
        Ok(Self::at(dir)?)
    }

    /// Open the store at an explicit directory, creating it if needed.
    pub fn at(dir: PathBuf) -> Result<Self, SyncError> {
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn key_path(&self, key: &str) -> PathBuf {
        // Keys come from ids we generate, but keep the mapping safe anyway.
        let safe: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                    c
                } else {
                    '-'
                }
            })
            .collect();
        self.dir.join(format!("{}.json", safe))
    }

    /// Read a value. Missing or unparseable entries come back as `None`.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let path = self.key_path(key);
        if !path.exists() {
            return None;
        }
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) => {
                warn!(key = %key, "Failed to read cache entry: {}", e);
                return None;
            }
        };
        match serde_json::from_str(&content) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key = %key, "Failed to parse cache entry: {}", e);
                None
            }
        }
    }

    /// Write a value, replacing whatever was there.
    pub fn put<T: Serialize>(&self, key: &str, value: &T) -> Result<(), SyncError> {
        let json = serde_json::to_string_pretty(value)?;
        std::fs::write(self.key_path(key), json)?;
        debug!(key = %key, "Cache entry written");
        Ok(())
    }

    /// Remove a value. Removing a missing key is not an error.
    pub fn remove(&self, key: &str) -> Result<(), SyncError> {
        let path = self.key_path(key);
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        Ok(())
    }
}
