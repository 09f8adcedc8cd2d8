//! Error types for the sync engine.

use crate::backend::RecordFailure;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Local store error.
    #[error("store error: {0}")]
    Store(#[from] syncbox_store::StoreError),

    /// Payload envelope error.
    #[error("codec error: {0}")]
    Codec(#[from] syncbox_codec::CodecError),

    /// The remote backend rejected the request as a whole.
    #[error("remote failure: {0}")]
    Remote(RecordFailure),

    /// The in-flight operation was cancelled by a stop or session reset.
    #[error("sync cancelled")]
    Cancelled,

    /// The engine task has shut down.
    #[error("sync engine stopped")]
    Stopped,

    /// A failure reported to a request that joined an already running pass.
    #[error("joined sync pass failed: {message}")]
    Joined {
        /// The original error, rendered.
        message: String,
    },
}

impl SyncError {
    /// Creates a remote failure.
    pub fn remote(failure: RecordFailure) -> Self {
        Self::Remote(failure)
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Remote(failure) => failure.is_transient(),
            SyncError::Cancelled => true,
            _ => false,
        }
    }

    /// A copy of this error for additional waiters on the same pass.
    pub(crate) fn share(&self) -> Self {
        match self {
            SyncError::Remote(failure) => SyncError::Remote(failure.clone()),
            SyncError::Cancelled => SyncError::Cancelled,
            SyncError::Stopped => SyncError::Stopped,
            other => SyncError::Joined {
                message: other.to_string(),
            },
        }
    }
}

impl From<RecordFailure> for SyncError {
    fn from(failure: RecordFailure) -> Self {
        Self::Remote(failure)
    }
}
