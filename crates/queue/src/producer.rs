//! Producer side of the queue abstraction.

use async_trait::async_trait;

use crate::error::QueueError;
use crate::job::JobEnvelope;

/// What happened to an enqueue attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// The job was accepted as a new unit of work.
    Enqueued,
    /// A job with the same idempotency key is already pending; this
    /// attempt was a no-op. Backends whose dedup happens server-side
    /// without feedback (SQS FIFO) report `Enqueued` for duplicates —
    /// the dedup guarantee holds either way.
    Duplicate,
}

/// Trait for enqueue-capable queue backends.
///
/// The contract callers rely on: enqueueing twice with the same
/// `idempotency_key` within the backend's retention window yields at
/// most one delivered unit of work.
#[async_trait]
pub trait JobProducer: Send + Sync {
    /// Enqueue a job, deduplicating by `envelope.idempotency_key`.
    async fn enqueue(&self, envelope: JobEnvelope) -> Result<EnqueueOutcome, QueueError>;

    /// Look up whether a key is currently pending. Backends without
    /// key lookup return `None`.
    async fn lookup(&self, idempotency_key: &str) -> Result<Option<JobEnvelope>, QueueError> {
        let _ = idempotency_key;
        Ok(None)
    }
}
