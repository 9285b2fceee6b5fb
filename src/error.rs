//! Error taxonomy for the sync engine.
//!
//! Remote failures are split into transport problems (`RemoteUnavailable`)
//! and explicit API rejections (`RemoteRejected`). Neither is retried
//! automatically; in particular `upload` and `find_or_create_folder` are
//! not idempotent, so a blind retry can create duplicates.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    /// No valid access token. The caller must re-authenticate.
    #[error("not authenticated")]
    AuthMissing,

    /// Transport-level failure reaching the remote API.
    #[error("network error: {0}")]
    RemoteUnavailable(#[from] reqwest::Error),

    /// The remote API answered with an explicit error status.
    #[error("remote API rejected the request: {0}")]
    RemoteRejected(String),

    /// An expected remote structure (subfolder, journal tab) is missing.
    #[error("inconsistent remote data: {0}")]
    DataInconsistent(String),

    /// A required field failed local validation; no remote call was made.
    #[error("validation failed: {0}")]
    ValidationError(String),

    #[error("local cache I/O error: {0}")]
    Cache(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
