//! Access-token plumbing.
//!
//! The sign-in flow itself is out of scope: the engine only needs a
//! bearer token on demand. `TokenProvider` is the seam a host app plugs
//! its own OAuth flow into; `StoredTokenProvider` persists the last
//! granted token so a fresh launch can reuse it until expiry.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::SyncError;

/// Seconds before nominal expiry at which a token is treated as stale.
const EXPIRY_BUFFER_SECS: i64 = 300;

/// Supplies a bearer token valid for the Drive and Sheets scopes.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Returns `SyncError::AuthMissing` when no valid token is available.
    async fn access_token(&self) -> Result<String, SyncError>;
}

/// Fixed token, for tests and short-lived scripts.
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self { token: token.into() }
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn access_token(&self) -> Result<String, SyncError> {
        if self.token.is_empty() {
            return Err(SyncError::AuthMissing);
        }
        Ok(self.token.clone())
    }
}

/// Persisted token state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenState {
    pub access_token: Option<String>,
    /// Unix timestamp of nominal expiry.
    pub token_expiry: Option<i64>,
}

impl TokenState {
    /// Check if the current token is expired (with 5-minute buffer)
    pub fn is_expired(&self) -> bool {
        if let Some(expiry) = self.token_expiry {
            let now = Utc::now().timestamp();
            now >= (expiry - EXPIRY_BUFFER_SECS)
        } else {
            true
        }
    }

    fn load_from_file(path: &PathBuf) -> Option<Self> {
        if !path.exists() {
            return None;
        }
        match std::fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str::<TokenState>(&content) {
                Ok(state) => Some(state),
                Err(e) => {
                    warn!("Failed to parse saved token state: {}", e);
                    None
                }
            },
            Err(e) => {
                warn!("Failed to read token file: {}", e);
                None
            }
        }
    }

    fn save_to_file(&self, path: &PathBuf) -> Result<(), std::io::Error> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        std::fs::write(path, json)?;
        debug!("Saved token state to {:?}", path);
        Ok(())
    }
}

/// Token provider backed by a JSON file under the app's dot-directory.
pub struct StoredTokenProvider {
    state: RwLock<TokenState>,
    path: PathBuf,
}

impl StoredTokenProvider {
    /// Open the provider at the default location (`~/.kineapp/google_auth.json`).
    pub fn open() -> anyhow::Result<Self> {
        let path = Config::config_dir()?.join("google_auth.json");
        Ok(Self::with_path(path))
    }

    /// Open the provider at an explicit location.
    pub fn with_path(path: PathBuf) -> Self {
        let state = TokenState::load_from_file(&path).unwrap_or_default();
        Self {
            state: RwLock::new(state),
            path,
        }
    }

    /// Record a freshly granted token and its lifetime in seconds.
    pub async fn store(&self, access_token: &str, expires_in_secs: i64) {
        let state = TokenState {
            access_token: Some(access_token.to_string()),
            token_expiry: Some(Utc::now().timestamp() + expires_in_secs),
        };
        if let Err(e) = state.save_to_file(&self.path) {
            warn!("Failed to persist token state: {}", e);
        }
        *self.state.write().await = state;
    }

    /// Forget the stored token (sign-out).
    pub async fn clear(&self) {
        *self.state.write().await = TokenState::default();
        if self.path.exists() {
            let _ = std::fs::remove_file(&self.path);
        }
    }

    pub async fn is_authenticated(&self) -> bool {
        let state = self.state.read().await;
        state.access_token.is_some() && !state.is_expired()
    }
}

#[async_trait]
impl TokenProvider for StoredTokenProvider {
    async fn access_token(&self) -> Result<String, SyncError> {
        let state = self.state.read().await;
        if state.is_expired() {
            return Err(SyncError::AuthMissing);
        }
        state.access_token.clone().ok_or(SyncError::AuthMissing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_state_expiry() {
        let mut state = TokenState {
            access_token: Some("test".to_string()),
            token_expiry: Some(Utc::now().timestamp() + 3600),
        };
        assert!(!state.is_expired());

        // Expired
        state.token_expiry = Some(Utc::now().timestamp() - 100);
        assert!(state.is_expired());

        // Within the 5-minute buffer
        state.token_expiry = Some(Utc::now().timestamp() + 200);
        assert!(state.is_expired());

        // No expiry recorded at all
        state.token_expiry = None;
        assert!(state.is_expired());
    }

    #[tokio::test]
    async fn test_static_provider() {
        let provider = StaticTokenProvider::new("abc");
        assert_eq!(provider.access_token().await.unwrap(), "abc");

        let empty = StaticTokenProvider::new("");
        assert!(matches!(
            empty.access_token().await,
            Err(SyncError::AuthMissing)
        ));
    }

    #[tokio::test]
    async fn test_stored_provider_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("google_auth.json");

        let provider = StoredTokenProvider::with_path(path.clone());
        assert!(matches!(
            provider.access_token().await,
            Err(SyncError::AuthMissing)
        ));

        provider.store("tok-1", 3600).await;
        assert_eq!(provider.access_token().await.unwrap(), "tok-1");
        assert!(provider.is_authenticated().await);

        // A fresh provider reloads the persisted state
        let reloaded = StoredTokenProvider::with_path(path.clone());
        assert_eq!(reloaded.access_token().await.unwrap(), "tok-1");

        provider.clear().await;
        assert!(!provider.is_authenticated().await);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_stored_provider_expired_token_is_missing() {
        let dir = tempfile::tempdir().unwrap();
        let provider = StoredTokenProvider::with_path(dir.path().join("auth.json"));
        provider.store("tok-2", -10).await;
        assert!(matches!(
            provider.access_token().await,
            Err(SyncError::AuthMissing)
        ));
    }
}
