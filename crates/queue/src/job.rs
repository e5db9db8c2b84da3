//! Job envelope — the unit of work placed on the queue.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The kinds of work the pipeline enqueues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Run one feed ingestion attempt.
    FeedRun,
    /// Match one fixed-size batch of records from a finished run.
    MatchBatch,
    /// Evaluate alert conditions for one subscription.
    AlertEvaluate,
    /// Periodic whole-catalog recomputation.
    Recompute,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FeedRun => "feed_run",
            Self::MatchBatch => "match_batch",
            Self::AlertEvaluate => "alert_evaluate",
            Self::Recompute => "recompute",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "feed_run" => Ok(Self::FeedRun),
            "match_batch" => Ok(Self::MatchBatch),
            "alert_evaluate" => Ok(Self::AlertEvaluate),
            "recompute" => Ok(Self::Recompute),
            other => Err(format!("unknown job kind: {other}")),
        }
    }
}

/// A unit of work to enqueue.
///
/// `idempotency_key` is the dedup identity: enqueues with the same key
/// within the backend's retention window collapse to one pending unit.
/// `group` serializes delivery for one subject (FIFO message group /
/// per-feed ordering).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEnvelope {
    pub kind: JobKind,
    pub payload: serde_json::Value,
    pub idempotency_key: String,
    pub group: String,
    /// Delivery delay in seconds. Backends that cannot delay
    /// per-message deliver immediately.
    #[serde(default)]
    pub delay_secs: Option<u32>,
    /// Higher runs first where the backend supports ordering.
    #[serde(default)]
    pub priority: Option<u8>,
}

impl JobEnvelope {
    pub fn new(
        kind: JobKind,
        payload: serde_json::Value,
        idempotency_key: impl Into<String>,
        group: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            payload,
            idempotency_key: idempotency_key.into(),
            group: group.into(),
            delay_secs: None,
            priority: None,
        }
    }

    pub fn with_delay(mut self, secs: u32) -> Self {
        self.delay_secs = Some(secs);
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_serde_roundtrip() {
        let env = JobEnvelope::new(
            JobKind::FeedRun,
            serde_json::json!({"feed_id": "00000000-0000-0000-0000-000000000001"}),
            "feed_run:abc:123",
            "abc",
        )
        .with_delay(30);

        let json = serde_json::to_string(&env).unwrap();
        let back: JobEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(env, back);
    }

    #[test]
    fn kind_roundtrip() {
        for k in [
            JobKind::FeedRun,
            JobKind::MatchBatch,
            JobKind::AlertEvaluate,
            JobKind::Recompute,
        ] {
            assert_eq!(k.as_str().parse::<JobKind>().unwrap(), k);
        }
    }
}
