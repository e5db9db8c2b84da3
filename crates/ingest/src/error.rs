//! Ingest-level error type.

use uuid::Uuid;

use feedmill_core::ErrorCode;

/// Errors from ingestion pipeline operations.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("feed not found: {0}")]
    FeedNotFound(Uuid),

    #[error("run not found: {0}")]
    RunNotFound(Uuid),

    #[error("quarantined record not found: {0}")]
    QuarantineNotFound(Uuid),

    /// Quarantine action attempted against a record in the wrong state.
    #[error("record is {current}, expected {expected}")]
    StatusConflict { current: String, expected: String },

    /// Malformed operator input.
    #[error("{0}")]
    Validation(String),

    /// The per-feed advisory lock is held by another attempt.
    #[error("feed {0} is locked by another run attempt")]
    LockUnavailable(Uuid),

    /// The job's run binding could not be confirmed.
    #[error("run binding failed for job {job_key}: {reason}")]
    BindingFailed { job_key: String, reason: String },

    #[error("queue error: {0}")]
    Queue(#[from] feedmill_queue::QueueError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl IngestError {
    /// Stable code for persisted and user-visible failures.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::StatusConflict { .. } => Some(ErrorCode::StatusConflict),
            Self::Validation(_) => Some(ErrorCode::ValidationError),
            Self::LockUnavailable(_) => Some(ErrorCode::LockUnavailable),
            _ => None,
        }
    }
}
