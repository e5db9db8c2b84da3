//! Consumer side of the queue abstraction.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::QueueError;
use crate::job::JobEnvelope;

/// A raw message received from a queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobMessage {
    /// Unique message identifier from the queue provider.
    pub id: String,
    /// Raw message body (JSON-serialized [`JobEnvelope`]).
    pub body: String,
    /// Provider-specific handle for ack/nack (e.g., SQS receipt handle).
    pub receipt_handle: String,
    /// When the message was sent to the queue.
    pub timestamp: DateTime<Utc>,
    /// Number of times this message has been delivered. Anything above
    /// 1 means the attempt is a redelivery and must be validated
    /// against its bound run before doing work.
    pub attempt_count: u32,
}

impl JobMessage {
    /// Decode the body back into a [`JobEnvelope`].
    pub fn envelope(&self) -> Result<JobEnvelope, QueueError> {
        serde_json::from_str(&self.body)
            .map_err(|e| QueueError::Parse(format!("invalid job body in message {}: {e}", self.id)))
    }

    pub fn is_redelivery(&self) -> bool {
        self.attempt_count > 1
    }
}

/// Health status of a queue connection.
#[derive(Debug, Clone, Serialize)]
pub struct QueueHealth {
    pub connected: bool,
    pub approximate_message_count: Option<u64>,
    pub provider: String,
}

impl fmt::Display for QueueHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "QueueHealth {{ connected: {}, messages: {:?}, provider: {} }}",
            self.connected, self.approximate_message_count, self.provider
        )
    }
}

/// Trait for queue consumer backends.
///
/// Delivery is at-least-once: a message may be delivered to multiple
/// workers or redelivered after a visibility timeout. Workers own the
/// idempotence of their handlers.
#[async_trait]
pub trait JobConsumer: Send + Sync {
    /// Poll up to `max_messages` from the queue. May block for up to
    /// the provider's long-poll timeout. Returns an empty vec when no
    /// messages are available.
    async fn poll_batch(&self, max_messages: u32) -> Result<Vec<JobMessage>, QueueError>;

    /// Acknowledge successful processing — removes the message.
    async fn ack(&self, receipt_handle: &str) -> Result<(), QueueError>;

    /// Negative-acknowledge — returns the message for redelivery.
    async fn nack(&self, receipt_handle: &str) -> Result<(), QueueError>;

    /// Check queue connectivity and return health status.
    async fn health_check(&self) -> Result<QueueHealth, QueueError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobKind;

    #[test]
    fn message_envelope_roundtrip() {
        let envelope = JobEnvelope::new(
            JobKind::MatchBatch,
            serde_json::json!({"run_id": "r", "batch_index": 2}),
            "match_batch:r:2",
            "r",
        );
        let msg = JobMessage {
            id: "msg-1".into(),
            body: serde_json::to_string(&envelope).unwrap(),
            receipt_handle: "handle-1".into(),
            timestamp: Utc::now(),
            attempt_count: 1,
        };
        assert_eq!(msg.envelope().unwrap(), envelope);
        assert!(!msg.is_redelivery());
    }

    #[test]
    fn invalid_body_is_a_parse_error() {
        let msg = JobMessage {
            id: "msg-2".into(),
            body: "not json".into(),
            receipt_handle: "handle-2".into(),
            timestamp: Utc::now(),
            attempt_count: 2,
        };
        assert!(msg.envelope().is_err());
        assert!(msg.is_redelivery());
    }
}
