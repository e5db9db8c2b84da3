//! In-memory queue backend.
//!
//! Implements the same at-least-once + dedup-by-key contract as the SQS
//! backend: duplicate idempotency keys within the retention window are
//! dropped, nacked messages are redelivered with a bumped attempt
//! count, and in-flight messages whose visibility timeout lapses become
//! deliverable again. Used by tests and local development
//! (`QUEUE_PROVIDER=memory`).

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use crate::consumer::{JobConsumer, JobMessage, QueueHealth};
use crate::error::QueueError;
use crate::job::JobEnvelope;
use crate::producer::{EnqueueOutcome, JobProducer};

/// Dedup retention matching the SQS FIFO window.
const DEDUP_RETENTION: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
struct PendingJob {
    envelope: JobEnvelope,
    enqueued_at: DateTime<Utc>,
    ready_at: Instant,
    attempt_count: u32,
}

#[derive(Debug)]
struct InFlight {
    job: PendingJob,
    redeliver_at: Instant,
}

#[derive(Debug, Default)]
struct Inner {
    pending: Vec<PendingJob>,
    in_flight: HashMap<String, InFlight>,
    seen_keys: HashMap<String, Instant>,
}

/// Mutex-protected in-memory queue.
pub struct MemoryJobQueue {
    inner: Mutex<Inner>,
    visibility_timeout: Duration,
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        Self::with_visibility_timeout(Duration::from_secs(120))
    }

    pub fn with_visibility_timeout(visibility_timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            visibility_timeout,
        }
    }

    /// Number of deliverable messages (pending, delay elapsed).
    pub fn ready_len(&self) -> usize {
        let inner = self.inner.lock().expect("queue mutex poisoned");
        let now = Instant::now();
        inner.pending.iter().filter(|p| p.ready_at <= now).count()
    }

    /// Total undelivered messages, including delayed and in-flight.
    pub fn len(&self) -> usize {
        let inner = self.inner.lock().expect("queue mutex poisoned");
        inner.pending.len() + inner.in_flight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn expire_in_flight(inner: &mut Inner, now: Instant) {
        let expired: Vec<String> = inner
            .in_flight
            .iter()
            .filter(|(_, f)| f.redeliver_at <= now)
            .map(|(h, _)| h.clone())
            .collect();
        for handle in expired {
            if let Some(flight) = inner.in_flight.remove(&handle) {
                let mut job = flight.job;
                job.attempt_count += 1;
                job.ready_at = now;
                inner.pending.push(job);
            }
        }
    }
}

impl Default for MemoryJobQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobProducer for MemoryJobQueue {
    async fn enqueue(&self, envelope: JobEnvelope) -> Result<EnqueueOutcome, QueueError> {
        let mut inner = self.inner.lock().expect("queue mutex poisoned");
        let now = Instant::now();

        inner.seen_keys.retain(|_, at| now.duration_since(*at) < DEDUP_RETENTION);

        if inner.seen_keys.contains_key(&envelope.idempotency_key) {
            debug!(key = %envelope.idempotency_key, "duplicate enqueue dropped");
            return Ok(EnqueueOutcome::Duplicate);
        }
        inner.seen_keys.insert(envelope.idempotency_key.clone(), now);

        let ready_at = now + Duration::from_secs(envelope.delay_secs.unwrap_or(0) as u64);
        inner.pending.push(PendingJob {
            envelope,
            enqueued_at: Utc::now(),
            ready_at,
            attempt_count: 0,
        });
        Ok(EnqueueOutcome::Enqueued)
    }

    async fn lookup(&self, idempotency_key: &str) -> Result<Option<JobEnvelope>, QueueError> {
        let inner = self.inner.lock().expect("queue mutex poisoned");
        let found = inner
            .pending
            .iter()
            .map(|p| &p.envelope)
            .chain(inner.in_flight.values().map(|f| &f.job.envelope))
            .find(|e| e.idempotency_key == idempotency_key)
            .cloned();
        Ok(found)
    }
}

#[async_trait]
impl JobConsumer for MemoryJobQueue {
    async fn poll_batch(&self, max_messages: u32) -> Result<Vec<JobMessage>, QueueError> {
        let mut inner = self.inner.lock().expect("queue mutex poisoned");
        let now = Instant::now();

        Self::expire_in_flight(&mut inner, now);

        // Highest priority first, then FIFO by insertion order (sort is
        // stable, so equal priorities keep their relative order).
        inner
            .pending
            .sort_by_key(|p| std::cmp::Reverse(p.envelope.priority.unwrap_or(0)));

        let mut messages = Vec::new();
        let mut kept = Vec::new();
        for job in std::mem::take(&mut inner.pending) {
            if messages.len() < max_messages as usize && job.ready_at <= now {
                let receipt_handle = Uuid::new_v4().to_string();
                let body = serde_json::to_string(&job.envelope)
                    .map_err(|e| QueueError::Parse(format!("serializing envelope: {e}")))?;
                let attempt_count = job.attempt_count + 1;
                messages.push(JobMessage {
                    id: Uuid::new_v4().to_string(),
                    body,
                    receipt_handle: receipt_handle.clone(),
                    timestamp: job.enqueued_at,
                    attempt_count,
                });
                inner.in_flight.insert(
                    receipt_handle,
                    InFlight {
                        job: PendingJob {
                            attempt_count,
                            ..job
                        },
                        redeliver_at: now + self.visibility_timeout,
                    },
                );
            } else {
                kept.push(job);
            }
        }
        inner.pending = kept;

        Ok(messages)
    }

    async fn ack(&self, receipt_handle: &str) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().expect("queue mutex poisoned");
        inner
            .in_flight
            .remove(receipt_handle)
            .map(|_| ())
            .ok_or_else(|| QueueError::Ack(format!("unknown receipt handle: {receipt_handle}")))
    }

    async fn nack(&self, receipt_handle: &str) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().expect("queue mutex poisoned");
        let flight = inner.in_flight.remove(receipt_handle).ok_or_else(|| {
            QueueError::Ack(format!("unknown receipt handle: {receipt_handle}"))
        })?;
        let mut job = flight.job;
        job.ready_at = Instant::now();
        inner.pending.push(job);
        Ok(())
    }

    async fn health_check(&self) -> Result<QueueHealth, QueueError> {
        Ok(QueueHealth {
            connected: true,
            approximate_message_count: Some(self.len() as u64),
            provider: "memory".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::windowed_key;
    use crate::job::JobKind;
    use chrono::TimeZone;
    use std::sync::Arc;

    fn envelope(key: &str) -> JobEnvelope {
        JobEnvelope::new(JobKind::FeedRun, serde_json::json!({}), key, "group-1")
    }

    #[tokio::test]
    async fn duplicate_key_is_dropped() {
        let queue = MemoryJobQueue::new();
        assert_eq!(
            queue.enqueue(envelope("k1")).await.unwrap(),
            EnqueueOutcome::Enqueued
        );
        assert_eq!(
            queue.enqueue(envelope("k1")).await.unwrap(),
            EnqueueOutcome::Duplicate
        );
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn distinct_keys_enqueue_independently() {
        let queue = MemoryJobQueue::new();
        queue.enqueue(envelope("k1")).await.unwrap();
        queue.enqueue(envelope("k2")).await.unwrap();
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn concurrent_windowed_enqueues_collapse_to_one() {
        // Two scheduling passes racing in the same window produce the
        // same key; exactly one unit of work must land.
        let queue = Arc::new(MemoryJobQueue::new());
        let subject = Uuid::new_v4();
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 10, 2, 0).single().unwrap();
        let key = windowed_key(JobKind::FeedRun, subject, now, chrono::Duration::minutes(5));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let queue = queue.clone();
            let key = key.clone();
            handles.push(tokio::spawn(async move {
                queue.enqueue(envelope(&key)).await.unwrap()
            }));
        }

        let mut enqueued = 0;
        for h in handles {
            if h.await.unwrap() == EnqueueOutcome::Enqueued {
                enqueued += 1;
            }
        }
        assert_eq!(enqueued, 1);
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn ack_removes_and_nack_redelivers_with_bumped_attempt() {
        let queue = MemoryJobQueue::new();
        queue.enqueue(envelope("k1")).await.unwrap();

        let msgs = queue.poll_batch(10).await.unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].attempt_count, 1);

        queue.nack(&msgs[0].receipt_handle).await.unwrap();
        let msgs = queue.poll_batch(10).await.unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].attempt_count, 2);
        assert!(msgs[0].is_redelivery());

        queue.ack(&msgs[0].receipt_handle).await.unwrap();
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn visibility_timeout_redelivers() {
        let queue = MemoryJobQueue::with_visibility_timeout(Duration::from_millis(0));
        queue.enqueue(envelope("k1")).await.unwrap();

        let first = queue.poll_batch(10).await.unwrap();
        assert_eq!(first.len(), 1);

        // Visibility already lapsed; next poll redelivers.
        let second = queue.poll_batch(10).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].attempt_count, 2);
    }

    #[tokio::test]
    async fn delayed_jobs_are_not_delivered_early() {
        let queue = MemoryJobQueue::new();
        queue
            .enqueue(envelope("k1").with_delay(3600))
            .await
            .unwrap();
        assert_eq!(queue.ready_len(), 0);
        assert!(queue.poll_batch(10).await.unwrap().is_empty());
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn priority_orders_delivery() {
        let queue = MemoryJobQueue::new();
        queue.enqueue(envelope("low")).await.unwrap();
        queue
            .enqueue(envelope("high").with_priority(9))
            .await
            .unwrap();

        let msgs = queue.poll_batch(1).await.unwrap();
        assert_eq!(msgs.len(), 1);
        let env = msgs[0].envelope().unwrap();
        assert_eq!(env.idempotency_key, "high");
    }
}
