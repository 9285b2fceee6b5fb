//! Naming conventions and local configuration.
//!
//! The folder and sheet names here are load-bearing: reconciliation and
//! bilan grouping parse them back out of Drive, so they must match what
//! earlier clients wrote, byte for byte.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::debug;

/// Root folder in the user's Drive.
pub const ROOT_FOLDER_NAME: &str = "KINE_APP";
/// Folder under the root holding one subfolder per patient.
pub const PATIENTS_FOLDER_NAME: &str = "Patients";
/// Assessment photos subfolder inside a patient folder.
pub const BILANS_FOLDER_NAME: &str = "Bilans";
/// Session photos subfolder inside a patient folder.
pub const SEANCES_FOLDER_NAME: &str = "Seances";
/// Spreadsheet name of the per-patient session journal, inside `Seances`.
pub const JOURNAL_SHEET_NAME: &str = "journal";
/// Title of the single tab inside the journal spreadsheet.
pub const SEANCES_TAB_TITLE: &str = "Séances";
/// Header row of the journal tab.
pub const JOURNAL_HEADER: [&str; 3] = ["Date", "Nom du fichier", "Description"];

/// Local configuration, persisted under `~/.kineapp`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Parent folder id for `KINE_APP`. `None` creates it in the Drive root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drive_root_id: Option<String>,
    /// Override for the local cache directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_dir: Option<PathBuf>,
}

impl Config {
    /// Get the default config directory
    pub fn config_dir() -> Result<PathBuf> {
        let home = dirs::home_dir().context("Failed to get home directory")?;
        Ok(home.join(".kineapp"))
    }

    /// Get the config file path
    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Default location of the local cache.
    pub fn default_cache_dir() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("cache"))
    }

    /// Load config from file or return default
    pub fn load_or_default() -> Self {
        match Self::load() {
            Ok(config) => config,
            Err(e) => {
                debug!("Failed to load config, using default: {}", e);
                Self::default()
            }
        }
    }

    /// Load config from file
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            let config: Config = serde_json::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save config to file
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;

        // Ensure directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_roundtrip() {
        let config = Config {
            drive_root_id: Some("folder-123".to_string()),
            cache_dir: None,
        };
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("folder-123"));
        assert!(!json.contains("cache_dir"));

        let parsed: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.drive_root_id.as_deref(), Some("folder-123"));
    }

    #[test]
    fn test_empty_config_parses() {
        let parsed: Config = serde_json::from_str("{}").unwrap();
        assert!(parsed.drive_root_id.is_none());
        assert!(parsed.cache_dir.is_none());
    }
}
