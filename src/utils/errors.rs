//! Custom error types for the sync engine.
//!
//! Every failure the engine can surface is a variant here. The coordinator
//! classifies them with [`EngineError::retry_soon`]: transient failures feed
//! the exponential backoff, user-actionable ones max it out (retrying faster
//! cannot help until the user acts), and cancellation leaves it untouched.

use std::collections::HashMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    /// A mutating operation was requested while another one is in flight.
    #[error("Another operation is already in progress, please wait")]
    PleaseWait,

    #[error("No backup with slug '{0}' was found")]
    NoBackup(String),

    /// The in-flight sync task was cancelled at the user's request.
    #[error("Sync was cancelled by the user")]
    Cancelled,

    #[error("Request to the backend timed out")]
    Timeout,

    #[error("The backend is rate limiting requests")]
    RateLimited,

    #[error("The backend returned server error status {0}")]
    ServerError(u16),

    #[error("The backend returned client error status {0}")]
    ClientError(u16),

    /// The backend answered with something the protocol doesn't allow.
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Logic error: {0}")]
    Logic(String),

    /// The resumable upload session is gone on the remote end (404).
    #[error("The upload session is no longer valid")]
    SessionExpired,

    #[error("Backend credentials have expired and must be reauthorized")]
    CredentialsExpired,

    #[error("The destination's storage quota is exhausted")]
    QuotaExceeded,

    /// A backend refused to proceed before any changes were made, e.g. an
    /// ambiguous pre-existing backup folder.
    #[error("Pre-change check failed: {0}")]
    PreconditionFailed(String),

    /// Raised by backends that can measure free space, from
    /// `check_before_changes` ahead of any mutation.
    #[error("Not enough free space to create a new backup")]
    LowSpace,

    /// More than one deletion is pending and multi-delete confirmation is
    /// required but has not been granted. Carries per-backend counts so a
    /// caller can present or auto-approve it exactly once.
    #[error("Multiple backups are pending deletion and require confirmation")]
    DeleteMultiplePending { counts: HashMap<String, usize> },

    #[error("Archive stream ended prematurely during upload")]
    UploadTruncated,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    /// Whether retrying on the normal backoff schedule can plausibly help.
    ///
    /// Errors that need the user to act first return false; the coordinator
    /// maxes out the backoff for those instead of hammering the backend.
    pub fn retry_soon(&self) -> bool {
        !matches!(
            self,
            EngineError::CredentialsExpired
                | EngineError::QuotaExceeded
                | EngineError::PreconditionFailed(_)
                | EngineError::LowSpace
                | EngineError::DeleteMultiplePending { .. }
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, EngineError::Cancelled)
    }
}
