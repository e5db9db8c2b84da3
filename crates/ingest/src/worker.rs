//! Queue worker for feed-run jobs.
//!
//! Delivery is at-least-once, so every message passes through the same
//! gauntlet before any work happens: bind the job to a run row
//! (first writer wins), validate redeliveries against the bound run,
//! and hold the per-feed advisory lock for the duration of the run.
//! A message whose bound run is already terminal is acked without work;
//! a message whose feed is locked elsewhere is nacked for a later
//! attempt.

use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use feedmill_core::{ErrorCode, RunStatus, TriggerKind};
use feedmill_queue::{JobConsumer, JobKind, JobMessage};

use crate::error::IngestError;
use crate::orchestrator::Orchestrator;
use crate::store::{BindOutcome, IngestStore, RunFinalize};

/// Decoded payload of a feed-run job.
#[derive(Debug, Deserialize)]
struct FeedRunPayload {
    feed_id: Uuid,
    #[serde(default)]
    trigger: Option<String>,
}

/// What the worker did with one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleOutcome {
    /// Work was done and the message acked.
    Processed,
    /// Nothing to do (terminal run, missing feed, stale binding); acked.
    Dropped,
    /// The feed is busy elsewhere; nacked for redelivery.
    Requeued,
}

pub struct IngestWorker<S> {
    orchestrator: Arc<Orchestrator<S>>,
    consumer: Arc<dyn JobConsumer>,
    batch_size: u32,
}

impl<S: IngestStore> IngestWorker<S> {
    pub fn new(
        orchestrator: Arc<Orchestrator<S>>,
        consumer: Arc<dyn JobConsumer>,
        batch_size: u32,
    ) -> Self {
        Self {
            orchestrator,
            consumer,
            batch_size,
        }
    }

    /// Poll once and handle every message in the batch. Returns the
    /// number of messages processed (not dropped or requeued).
    pub async fn poll_once(&self) -> Result<usize, IngestError> {
        let messages = self.consumer.poll_batch(self.batch_size).await?;
        let mut processed = 0;
        for message in messages {
            match self.handle_message(&message).await {
                Ok(HandleOutcome::Processed) => processed += 1,
                Ok(_) => {}
                Err(e) => {
                    // Handler errors are transient (store/queue); the
                    // message stays invisible until redelivery.
                    error!(message_id = %message.id, error = %e, "feed-run handling failed");
                    self.consumer.nack(&message.receipt_handle).await?;
                }
            }
        }
        Ok(processed)
    }

    /// Run the poll loop until the task is cancelled.
    pub async fn run(&self, poll_interval: std::time::Duration) {
        loop {
            match self.poll_once().await {
                Ok(0) => tokio::time::sleep(poll_interval).await,
                Ok(n) => info!(processed = n, "feed-run batch complete"),
                Err(e) => {
                    error!(error = %e, "poll failed");
                    tokio::time::sleep(poll_interval).await;
                }
            }
        }
    }

    pub async fn handle_message(&self, message: &JobMessage) -> Result<HandleOutcome, IngestError> {
        let envelope = match message.envelope() {
            Ok(envelope) => envelope,
            Err(e) => {
                // Undecodable bodies never become decodable; drop them.
                warn!(message_id = %message.id, error = %e, "dropping undecodable message");
                self.consumer.ack(&message.receipt_handle).await?;
                return Ok(HandleOutcome::Dropped);
            }
        };

        if envelope.kind != JobKind::FeedRun {
            warn!(kind = %envelope.kind, "unexpected job kind on feed-run queue, dropping");
            self.consumer.ack(&message.receipt_handle).await?;
            return Ok(HandleOutcome::Dropped);
        }

        let payload: FeedRunPayload = serde_json::from_value(envelope.payload.clone())
            .map_err(|e| IngestError::Validation(format!("feed-run payload: {e}")))?;

        let outcome = self
            .handle_feed_run(&envelope.idempotency_key, payload, message.is_redelivery())
            .await?;
        match outcome {
            HandleOutcome::Requeued => self.consumer.nack(&message.receipt_handle).await?,
            _ => self.consumer.ack(&message.receipt_handle).await?,
        }
        Ok(outcome)
    }

    async fn handle_feed_run(
        &self,
        job_key: &str,
        payload: FeedRunPayload,
        redelivery: bool,
    ) -> Result<HandleOutcome, IngestError> {
        let store = self.orchestrator.store();

        // Redeliveries validate against the bound run before anything
        // else: a missing binding or a terminal run means the original
        // attempt finished (or never started) and there is no work.
        if redelivery {
            let Some(run_id) = store.lookup_binding(job_key).await? else {
                info!(job_key, "redelivery with no binding, dropping");
                return Ok(HandleOutcome::Dropped);
            };
            let Some(run) = store.get_run(run_id).await? else {
                warn!(job_key, run_id = %run_id, "bound run missing, dropping");
                return Ok(HandleOutcome::Dropped);
            };
            if run.run_status().is_terminal() {
                info!(job_key, run_id = %run_id, "bound run already terminal, dropping");
                return Ok(HandleOutcome::Dropped);
            }
            return self.execute_locked(payload.feed_id, run_id).await;
        }

        let Some(feed) = store.get_feed(payload.feed_id).await? else {
            warn!(feed_id = %payload.feed_id, "feed missing, dropping job");
            return Ok(HandleOutcome::Dropped);
        };

        // The lock comes first so a busy feed costs nothing but a nack.
        if !store.try_lock_feed(feed.id).await? {
            info!(feed_id = %feed.id, "feed locked elsewhere, requeueing");
            return Ok(HandleOutcome::Requeued);
        }

        let result = self.bound_run(job_key, &feed, payload.trigger.as_deref()).await;
        store.unlock_feed(feed.id).await?;
        result
    }

    /// With the feed lock held: create the run, bind the job to it,
    /// and execute. A lost binding race finalizes our orphan run and
    /// defers to the winner.
    async fn bound_run(
        &self,
        job_key: &str,
        feed: &feedmill_core::FeedSource,
        trigger: Option<&str>,
    ) -> Result<HandleOutcome, IngestError> {
        let store = self.orchestrator.store();

        let trigger = match trigger {
            Some("manual") => TriggerKind::Manual,
            _ => TriggerKind::Scheduled,
        };
        let run = store.create_running(feed.id, trigger, Utc::now()).await?;

        match store.bind_job(job_key, run.id).await? {
            BindOutcome::Bound => {}
            BindOutcome::AlreadyBound(winner) => {
                // A duplicate delivery beat us to the binding. Our run
                // row is an orphan; close it and check the winner.
                warn!(job_key, orphan = %run.id, winner = %winner, "lost binding race");
                store
                    .finalize_run(
                        run.id,
                        RunFinalize {
                            status: RunStatus::Skipped,
                            completed_at: Utc::now(),
                            row_count: 0,
                            indexed_count: 0,
                            quarantined_count: 0,
                            rejected_count: 0,
                            primary_error_code: Some(ErrorCode::LockUnavailable),
                            errors: Vec::new(),
                        },
                    )
                    .await?;

                let Some(bound) = store.get_run(winner).await? else {
                    return Ok(HandleOutcome::Dropped);
                };
                if bound.run_status().is_terminal() {
                    return Ok(HandleOutcome::Dropped);
                }
                let report = self.orchestrator.execute_run(feed, &bound).await?;
                info!(run_id = %report.run_id, status = %report.status, "run complete");
                return Ok(HandleOutcome::Processed);
            }
        }

        let report = self.orchestrator.execute_run(feed, &run).await?;
        info!(run_id = %report.run_id, status = %report.status, "run complete");
        Ok(HandleOutcome::Processed)
    }

    /// Redelivery path: re-acquire the lock and finish the bound run.
    async fn execute_locked(
        &self,
        feed_id: Uuid,
        run_id: Uuid,
    ) -> Result<HandleOutcome, IngestError> {
        let store = self.orchestrator.store();

        let Some(feed) = store.get_feed(feed_id).await? else {
            warn!(feed_id = %feed_id, "feed missing on redelivery, dropping");
            return Ok(HandleOutcome::Dropped);
        };
        if !store.try_lock_feed(feed_id).await? {
            // The original attempt may still be running; let the queue
            // redeliver again later.
            return Ok(HandleOutcome::Requeued);
        }

        let Some(run) = store.get_run(run_id).await? else {
            store.unlock_feed(feed_id).await?;
            return Ok(HandleOutcome::Dropped);
        };
        if run.run_status().is_terminal() {
            store.unlock_feed(feed_id).await?;
            return Ok(HandleOutcome::Dropped);
        }

        let result = self.orchestrator.execute_run(&feed, &run).await;
        store.unlock_feed(feed_id).await?;
        let report = result?;
        info!(run_id = %report.run_id, status = %report.status, "redelivered run complete");
        Ok(HandleOutcome::Processed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use feedmill_core::{FeedSource, IngestConfig};
    use feedmill_notify::Dispatcher;
    use feedmill_queue::{EnqueueOutcome, JobEnvelope, JobProducer, MemoryJobQueue, QueueError};

    use crate::fetch::{AlwaysEligible, FetchError, Fetcher};
    use crate::memory::MemoryStore;
    use crate::store::{BindingStore, FeedLock, FeedStore, NewFeedSource, RunStore};

    struct StaticFetcher(Vec<u8>);

    #[async_trait]
    impl Fetcher for StaticFetcher {
        async fn fetch(&self, _feed: &FeedSource) -> Result<Vec<u8>, FetchError> {
            Ok(self.0.clone())
        }
    }

    fn config() -> IngestConfig {
        IngestConfig {
            failure_threshold: 3,
            match_batch_size: 100,
            scheduler_poll_secs: 30,
            schedule_window_minutes: 5,
            recompute_window_minutes: 120,
        }
    }

    async fn setup(body: &str) -> (IngestWorker<MemoryStore>, Arc<MemoryStore>, Arc<MemoryJobQueue>, FeedSource)
    {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryJobQueue::new());
        let orchestrator = Arc::new(Orchestrator::new(
            store.clone(),
            Arc::new(StaticFetcher(body.as_bytes().to_vec())),
            Arc::new(AlwaysEligible),
            queue.clone(),
            Arc::new(Dispatcher::empty()),
            config(),
        ));
        let feed = store
            .create_feed(NewFeedSource {
                name: "acme".into(),
                format: "json".into(),
                locator: "https://example.com/feed.json".into(),
                transport: "http".into(),
                schedule_interval_minutes: 60,
            })
            .await
            .unwrap();
        let worker = IngestWorker::new(orchestrator, queue.clone(), 10);
        (worker, store, queue, feed)
    }

    fn message(feed_id: Uuid, key: &str, attempt: u32) -> JobMessage {
        let envelope = JobEnvelope::new(
            JobKind::FeedRun,
            serde_json::json!({"feed_id": feed_id, "trigger": "scheduled"}),
            key,
            feed_id.to_string(),
        );
        JobMessage {
            id: format!("msg-{key}-{attempt}"),
            body: serde_json::to_string(&envelope).unwrap(),
            receipt_handle: format!("rh-{key}-{attempt}"),
            timestamp: Utc::now(),
            attempt_count: attempt,
        }
    }

    const BODY: &str = r#"[{"title": "A", "gtin": "1", "price": 10}]"#;

    #[tokio::test]
    async fn fresh_message_runs_and_binds() {
        let (worker, store, _queue, feed) = setup(BODY).await;

        let outcome = worker
            .handle_feed_run("feed_run:k1", payload_for(feed.id), false)
            .await
            .unwrap();
        assert_eq!(outcome, HandleOutcome::Processed);

        let run_id = store.lookup_binding("feed_run:k1").await.unwrap().unwrap();
        let run = store.get_run(run_id).await.unwrap().unwrap();
        assert_eq!(run.run_status(), RunStatus::Succeeded);
        // The lock was released.
        assert!(store.try_lock_feed(feed.id).await.unwrap());
    }

    #[tokio::test]
    async fn redelivery_of_finished_run_is_a_noop() {
        let (worker, store, _queue, feed) = setup(BODY).await;

        worker
            .handle_feed_run("feed_run:k1", payload_for(feed.id), false)
            .await
            .unwrap();
        let runs_before = store.run_count();

        let outcome = worker
            .handle_feed_run("feed_run:k1", payload_for(feed.id), true)
            .await
            .unwrap();
        assert_eq!(outcome, HandleOutcome::Dropped);
        // No second run row was created.
        assert_eq!(store.run_count(), runs_before);
    }

    #[tokio::test]
    async fn redelivery_without_binding_is_dropped() {
        let (worker, _store, _queue, feed) = setup(BODY).await;

        let outcome = worker
            .handle_feed_run("feed_run:never-bound", payload_for(feed.id), true)
            .await
            .unwrap();
        assert_eq!(outcome, HandleOutcome::Dropped);
    }

    #[tokio::test]
    async fn redelivery_of_unfinished_run_reexecutes() {
        let (worker, store, _queue, feed) = setup(BODY).await;

        // Simulate a crashed first attempt: run created and bound but
        // never finalized, lock released by connection loss.
        let run = store
            .create_running(feed.id, TriggerKind::Scheduled, Utc::now())
            .await
            .unwrap();
        store.bind_job("feed_run:crashed", run.id).await.unwrap();

        let outcome = worker
            .handle_feed_run("feed_run:crashed", payload_for(feed.id), true)
            .await
            .unwrap();
        assert_eq!(outcome, HandleOutcome::Processed);

        let finished = store.get_run(run.id).await.unwrap().unwrap();
        assert_eq!(finished.run_status(), RunStatus::Succeeded);
    }

    #[tokio::test]
    async fn locked_feed_requeues_the_message() {
        let (worker, store, _queue, feed) = setup(BODY).await;

        assert!(store.try_lock_feed(feed.id).await.unwrap());
        let outcome = worker
            .handle_feed_run("feed_run:k2", payload_for(feed.id), false)
            .await
            .unwrap();
        assert_eq!(outcome, HandleOutcome::Requeued);
        // No run was created while the feed was busy.
        assert_eq!(store.run_count(), 0);
        store.unlock_feed(feed.id).await.unwrap();
    }

    #[tokio::test]
    async fn missing_feed_drops_the_job() {
        let (worker, _store, _queue, _feed) = setup(BODY).await;

        let outcome = worker
            .handle_feed_run("feed_run:k3", payload_for(Uuid::new_v4()), false)
            .await
            .unwrap();
        assert_eq!(outcome, HandleOutcome::Dropped);
    }

    #[tokio::test]
    async fn poll_once_acks_processed_messages() {
        let (worker, store, queue, feed) = setup(BODY).await;

        queue
            .enqueue(JobEnvelope::new(
                JobKind::FeedRun,
                serde_json::json!({"feed_id": feed.id}),
                "feed_run:poll",
                feed.id.to_string(),
            ))
            .await
            .unwrap();

        let processed = worker.poll_once().await.unwrap();
        assert_eq!(processed, 1);
        assert_eq!(queue.len(), 0);
        assert!(store.lookup_binding("feed_run:poll").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn unknown_kind_is_acked_away() {
        let (worker, _store, queue, feed) = setup(BODY).await;

        queue
            .enqueue(JobEnvelope::new(
                JobKind::MatchBatch,
                serde_json::json!({"run_id": Uuid::new_v4(), "batch_index": 0}),
                "match_batch:stray",
                feed.id.to_string(),
            ))
            .await
            .unwrap();

        let processed = worker.poll_once().await.unwrap();
        assert_eq!(processed, 0);
        assert_eq!(queue.len(), 0);
    }

    #[tokio::test]
    async fn lost_binding_race_closes_orphan_run() {
        let (worker, store, _queue, feed) = setup(BODY).await;

        // Another attempt already bound this key to a finished run.
        let winner = store
            .create_running(feed.id, TriggerKind::Scheduled, Utc::now())
            .await
            .unwrap();
        store.bind_job("feed_run:raced", winner.id).await.unwrap();
        store
            .finalize_run(
                winner.id,
                RunFinalize {
                    status: RunStatus::Succeeded,
                    completed_at: Utc::now(),
                    row_count: 0,
                    indexed_count: 0,
                    quarantined_count: 0,
                    rejected_count: 0,
                    primary_error_code: None,
                    errors: Vec::new(),
                },
            )
            .await
            .unwrap();

        // Fresh delivery with the same key loses the bind and defers.
        let outcome = worker
            .handle_feed_run("feed_run:raced", payload_for(feed.id), false)
            .await
            .unwrap();
        assert_eq!(outcome, HandleOutcome::Dropped);

        // The orphan run it created is terminal, not stuck RUNNING.
        let stuck = store.runs_in_status(RunStatus::Running);
        assert_eq!(stuck, 0);
    }

    fn payload_for(feed_id: Uuid) -> FeedRunPayload {
        FeedRunPayload {
            feed_id,
            trigger: Some("scheduled".into()),
        }
    }
}
