//! Scheduling pass: due feeds → feed-run jobs.
//!
//! The scheduler holds no state and no locks. Correctness under
//! overlapping or restarted scheduler instances comes entirely from
//! windowed job identity: every pass in the same window computes the
//! same key, and the queue collapses the duplicates.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info};
use uuid::Uuid;

use feedmill_core::IngestConfig;
use feedmill_queue::{windowed_key, EnqueueOutcome, JobEnvelope, JobKind, JobProducer};

use crate::error::IngestError;
use crate::store::FeedStore;

const DUE_FEEDS_LIMIT: i64 = 500;

/// What one scheduling pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub due: usize,
    pub enqueued: usize,
    pub deduplicated: usize,
}

pub struct Scheduler<S> {
    store: Arc<S>,
    producer: Arc<dyn JobProducer>,
    config: IngestConfig,
}

impl<S: FeedStore> Scheduler<S> {
    pub fn new(store: Arc<S>, producer: Arc<dyn JobProducer>, config: IngestConfig) -> Self {
        Self {
            store,
            producer,
            config,
        }
    }

    /// One scheduling pass: enqueue a run job for every due feed.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport, IngestError> {
        let window = chrono::Duration::minutes(self.config.schedule_window_minutes as i64);
        let due = self.store.due_feeds(now, DUE_FEEDS_LIMIT).await?;

        let mut report = TickReport {
            due: due.len(),
            ..TickReport::default()
        };
        for feed in due {
            let key = windowed_key(JobKind::FeedRun, feed.id, now, window);
            let envelope = JobEnvelope::new(
                JobKind::FeedRun,
                serde_json::json!({
                    "feed_id": feed.id,
                    "trigger": "scheduled",
                }),
                key,
                feed.id.to_string(),
            );
            match self.producer.enqueue(envelope).await? {
                EnqueueOutcome::Enqueued => {
                    debug!(feed_id = %feed.id, "feed-run job enqueued");
                    report.enqueued += 1;
                }
                EnqueueOutcome::Duplicate => {
                    debug!(feed_id = %feed.id, "feed-run job already pending in window");
                    report.deduplicated += 1;
                }
            }
        }
        Ok(report)
    }

    /// Enqueue the periodic whole-catalog recompute job for the
    /// current window.
    pub async fn enqueue_recompute(&self, now: DateTime<Utc>) -> Result<EnqueueOutcome, IngestError> {
        let window = chrono::Duration::minutes(self.config.recompute_window_minutes as i64);
        let key = windowed_key(JobKind::Recompute, Uuid::nil(), now, window);
        let envelope = JobEnvelope::new(
            JobKind::Recompute,
            serde_json::json!({"window_start": now}),
            key,
            "recompute",
        );
        Ok(self.producer.enqueue(envelope).await?)
    }

    /// Run the scheduling loop until the task is cancelled.
    pub async fn run(&self) {
        let interval = std::time::Duration::from_secs(self.config.scheduler_poll_secs);
        loop {
            let now = Utc::now();
            match self.tick(now).await {
                Ok(report) if report.due > 0 => {
                    info!(
                        due = report.due,
                        enqueued = report.enqueued,
                        deduplicated = report.deduplicated,
                        "scheduling pass complete"
                    );
                }
                Ok(_) => {}
                Err(e) => error!(error = %e, "scheduling pass failed"),
            }
            if let Err(e) = self.enqueue_recompute(Utc::now()).await {
                error!(error = %e, "recompute enqueue failed");
            }
            tokio::time::sleep(interval).await;
        }
    }
}
