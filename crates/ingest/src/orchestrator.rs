//! Run orchestration: one feed run from fetch to finalization.
//!
//! The orchestrator assumes its caller holds the feed's advisory lock
//! and owns a RUNNING run row (see [`crate::worker`]). Everything it
//! persists goes through conditional store operations, so a crashed or
//! duplicated attempt can never finalize a run twice or resurrect a
//! terminal one.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use feedmill_connector::{select_connector, ParseOutput, RowOutcome};
use feedmill_core::{
    content_digest, match_key, record_key, ErrorCode, FeedHealth, FeedNotice, FeedRun,
    FeedSource, FeedState, IngestConfig, RunRowError, RunStatus,
};
use feedmill_queue::{batch_key, JobEnvelope, JobKind, JobProducer};
use feedmill_notify::{feed_notification, Dispatcher};

use crate::error::IngestError;
use crate::fetch::{EligibilityCheck, Fetcher};
use crate::policy::{apply_outcome, health_for, health_transition_notice, RunOutcome};
use crate::store::{
    FeedRunResult, IngestStore, NewIndexableRecord, QuarantineUpsert, RunFinalize,
};

/// Summary of one executed run, for logging and tests.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub row_count: u32,
    pub indexed_count: u32,
    pub quarantined_count: u32,
    pub rejected_count: u32,
    pub deactivated_count: u64,
    pub notices: Vec<FeedNotice>,
    pub enqueued_batches: u32,
}

pub struct Orchestrator<S> {
    store: Arc<S>,
    fetcher: Arc<dyn Fetcher>,
    eligibility: Arc<dyn EligibilityCheck>,
    producer: Arc<dyn JobProducer>,
    dispatcher: Arc<Dispatcher>,
    config: IngestConfig,
}

impl<S: IngestStore> Orchestrator<S> {
    pub fn new(
        store: Arc<S>,
        fetcher: Arc<dyn Fetcher>,
        eligibility: Arc<dyn EligibilityCheck>,
        producer: Arc<dyn JobProducer>,
        dispatcher: Arc<Dispatcher>,
        config: IngestConfig,
    ) -> Self {
        Self {
            store,
            fetcher,
            eligibility,
            producer,
            dispatcher,
            config,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Execute one run attempt. The caller holds the feed's advisory
    /// lock and `run` is the RUNNING row bound to this job.
    pub async fn execute_run(
        &self,
        feed: &FeedSource,
        run: &FeedRun,
    ) -> Result<RunReport, IngestError> {
        let interval = feed.schedule_interval();

        // (a) Eligibility: ineligible feeds are skipped, never failed.
        if !self.eligibility.is_eligible(feed).await {
            info!(feed_id = %feed.id, run_id = %run.id, "feed ineligible, skipping run");
            let now = Utc::now();
            self.store
                .finalize_run(
                    run.id,
                    RunFinalize {
                        status: RunStatus::Skipped,
                        completed_at: now,
                        row_count: 0,
                        indexed_count: 0,
                        quarantined_count: 0,
                        rejected_count: 0,
                        primary_error_code: Some(ErrorCode::SubscriptionExpired),
                        errors: Vec::new(),
                    },
                )
                .await?;
            self.store.reschedule(feed.id, now, now + interval).await?;
            return Ok(RunReport {
                run_id: run.id,
                status: RunStatus::Skipped,
                row_count: 0,
                indexed_count: 0,
                quarantined_count: 0,
                rejected_count: 0,
                deactivated_count: 0,
                notices: Vec::new(),
                enqueued_batches: 0,
            });
        }

        // (b) Fetch with a bounded timeout.
        let payload = match self.fetcher.fetch(feed).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(feed_id = %feed.id, run_id = %run.id, error = %e, "fetch failed");
                return self
                    .finalize_failed(feed, run, e.code(), e.to_string(), 0)
                    .await;
            }
        };

        // (c) Change detection: an unchanged payload short-circuits to
        // success without reprocessing.
        let digest = content_digest(&payload);
        if feed.content_hash.as_deref() == Some(digest.as_str()) {
            info!(feed_id = %feed.id, run_id = %run.id, "payload unchanged, short-circuiting");
            return self.finalize_unchanged(feed, run).await;
        }

        // (d) Parse. A payload-level failure fails the run; row-level
        // failures are data, handled below.
        let connector = select_connector(&feed.format, &payload);
        let output = match connector.parse(&payload) {
            Ok(output) => output,
            Err(e) => {
                warn!(feed_id = %feed.id, run_id = %run.id, error = %e, "undecodable payload");
                return self
                    .finalize_failed(feed, run, ErrorCode::ParseError, e.to_string(), 0)
                    .await;
            }
        };

        // (e) Classify rows into the indexable and quarantine lanes.
        let lanes = self.classify_rows(feed, run, &output).await?;

        // (f) Records this run did not touch are no longer in the feed.
        let deactivated = self.store.deactivate_untouched(feed.id, run.id).await?;

        // (g) Health from the run's row ratios.
        let health = health_for(
            lanes.indexed,
            lanes.quarantined,
            lanes.rejected,
            output.total_rows,
        );
        let (status, outcome, primary_error_code) = match health {
            FeedHealth::Failed => (
                RunStatus::Failed,
                RunOutcome::Failed,
                Some(ErrorCode::ParseError),
            ),
            FeedHealth::Warning => (RunStatus::Warning, RunOutcome::Succeeded, None),
            FeedHealth::Healthy => (RunStatus::Succeeded, RunOutcome::Succeeded, None),
        };

        // (h) Finalize the run and persist feed health in one pass.
        let now = Utc::now();
        let decision = apply_outcome(
            feed.consecutive_failures.max(0) as u32,
            outcome,
            now,
            interval,
            self.config.failure_threshold,
        );
        let mut notices = decision.notices.clone();
        if let Some(notice) = health_transition_notice(feed.feed_health(), health) {
            if !notices.contains(&notice) {
                notices.push(notice);
            }
        }

        let finalized = self
            .store
            .finalize_run(
                run.id,
                RunFinalize {
                    status,
                    completed_at: now,
                    row_count: output.total_rows as i32,
                    indexed_count: lanes.indexed as i32,
                    quarantined_count: lanes.quarantined as i32,
                    rejected_count: lanes.rejected as i32,
                    primary_error_code,
                    errors: lanes.errors,
                },
            )
            .await?;
        if !finalized {
            // Another attempt finalized this run; ours stops here.
            warn!(run_id = %run.id, "run already finalized elsewhere, abandoning");
            return Ok(RunReport {
                run_id: run.id,
                status,
                row_count: output.total_rows,
                indexed_count: lanes.indexed,
                quarantined_count: lanes.quarantined,
                rejected_count: lanes.rejected,
                deactivated_count: deactivated,
                notices: Vec::new(),
                enqueued_batches: 0,
            });
        }

        self.store
            .apply_run_result(
                feed.id,
                FeedRunResult {
                    consecutive_failures: decision.consecutive_failures as i32,
                    new_state: decision.auto_disabled.then_some(FeedState::Disabled),
                    health,
                    // The digest marks a processed payload; a reject-heavy
                    // failure leaves it unset so the next run reprocesses.
                    content_hash: (outcome == RunOutcome::Succeeded).then_some(digest),
                    last_run_at: now,
                    succeeded: outcome == RunOutcome::Succeeded,
                    last_error_code: primary_error_code,
                    next_run_at: decision.next_run_at,
                },
            )
            .await?;

        self.dispatch_notices(feed, &notices, primary_error_code).await;

        // (i) Downstream matching in fixed-size batches keyed by
        // (run, batch index) for idempotent re-enqueue.
        let enqueued_batches = if outcome == RunOutcome::Succeeded {
            self.enqueue_match_batches(feed, run.id).await?
        } else {
            0
        };

        info!(
            feed_id = %feed.id,
            run_id = %run.id,
            status = %status,
            rows = output.total_rows,
            indexed = lanes.indexed,
            quarantined = lanes.quarantined,
            rejected = lanes.rejected,
            deactivated,
            batches = enqueued_batches,
            "run finalized"
        );

        Ok(RunReport {
            run_id: run.id,
            status,
            row_count: output.total_rows,
            indexed_count: lanes.indexed,
            quarantined_count: lanes.quarantined,
            rejected_count: lanes.rejected,
            deactivated_count: deactivated,
            notices,
            enqueued_batches,
        })
    }

    async fn classify_rows(
        &self,
        feed: &FeedSource,
        run: &FeedRun,
        output: &ParseOutput,
    ) -> Result<Lanes, IngestError> {
        let mut lanes = Lanes::default();

        for row in &output.rows {
            match &row.outcome {
                RowOutcome::Parsed { record, .. } => {
                    if record.has_strong_identity() {
                        let key = record_key(
                            &record.title,
                            record.identifier.as_deref().unwrap_or(""),
                            record.sku.as_deref().unwrap_or(""),
                            record.price_cents.unwrap_or(0),
                        );
                        self.store
                            .upsert_indexable(NewIndexableRecord {
                                feed_id: feed.id,
                                record_key: key,
                                title: record.title.clone(),
                                identifier: record.identifier.clone(),
                                sku: record.sku.clone(),
                                price_cents: record.price_cents.unwrap_or(0),
                                currency: record.currency.clone(),
                                raw: record.raw.clone(),
                                run_id: run.id,
                            })
                            .await?;
                        // A successfully indexed row resolves any open
                        // quarantine entry for the same logical product.
                        let mk = match_key(&record.title, record.sku.as_deref().unwrap_or(""));
                        self.store.resolve_matching(feed.id, &mk, run.id).await?;
                        lanes.indexed += 1;
                    } else if record.has_minimum_viability() {
                        let mk = match_key(&record.title, record.sku.as_deref().unwrap_or(""));
                        self.store
                            .upsert_quarantined(QuarantineUpsert {
                                feed_id: feed.id,
                                match_key: mk,
                                title: Some(record.title.clone()),
                                sku: record.sku.clone(),
                                price_cents: record.price_cents,
                                raw: record.raw.clone(),
                                blocking_errors: vec![RunRowError {
                                    row_index: Some(row.index),
                                    code: ErrorCode::ValidationError.as_str().to_string(),
                                    message: "no strong product identifier".to_string(),
                                }],
                                run_id: run.id,
                            })
                            .await?;
                        lanes.quarantined += 1;
                    } else {
                        lanes.rejected += 1;
                        lanes.errors.push(RunRowError {
                            row_index: Some(row.index),
                            code: ErrorCode::ValidationError.as_str().to_string(),
                            message: "row lacks identity and minimum viable fields".to_string(),
                        });
                    }
                }
                RowOutcome::Rejected { errors } => {
                    lanes.rejected += 1;
                    for err in errors {
                        lanes.errors.push(RunRowError {
                            row_index: Some(row.index),
                            code: err.code.clone(),
                            message: err.message.clone(),
                        });
                    }
                }
            }
        }

        Ok(lanes)
    }

    /// Unchanged payload: SUCCEEDED with zero counts, counters reset.
    async fn finalize_unchanged(
        &self,
        feed: &FeedSource,
        run: &FeedRun,
    ) -> Result<RunReport, IngestError> {
        let now = Utc::now();
        let decision = apply_outcome(
            feed.consecutive_failures.max(0) as u32,
            RunOutcome::Succeeded,
            now,
            feed.schedule_interval(),
            self.config.failure_threshold,
        );

        self.store
            .finalize_run(
                run.id,
                RunFinalize {
                    status: RunStatus::Succeeded,
                    completed_at: now,
                    row_count: 0,
                    indexed_count: 0,
                    quarantined_count: 0,
                    rejected_count: 0,
                    primary_error_code: None,
                    errors: Vec::new(),
                },
            )
            .await?;
        self.store
            .apply_run_result(
                feed.id,
                FeedRunResult {
                    consecutive_failures: 0,
                    new_state: None,
                    health: feed.feed_health(),
                    content_hash: None,
                    last_run_at: now,
                    succeeded: true,
                    last_error_code: None,
                    next_run_at: decision.next_run_at,
                },
            )
            .await?;
        self.dispatch_notices(feed, &decision.notices, None).await;

        Ok(RunReport {
            run_id: run.id,
            status: RunStatus::Succeeded,
            row_count: 0,
            indexed_count: 0,
            quarantined_count: 0,
            rejected_count: 0,
            deactivated_count: 0,
            notices: decision.notices,
            enqueued_batches: 0,
        })
    }

    /// Run-level failure (fetch or undecodable payload).
    async fn finalize_failed(
        &self,
        feed: &FeedSource,
        run: &FeedRun,
        code: ErrorCode,
        message: String,
        row_count: u32,
    ) -> Result<RunReport, IngestError> {
        let now = Utc::now();
        let decision = apply_outcome(
            feed.consecutive_failures.max(0) as u32,
            RunOutcome::Failed,
            now,
            feed.schedule_interval(),
            self.config.failure_threshold,
        );

        self.store
            .finalize_run(
                run.id,
                RunFinalize {
                    status: RunStatus::Failed,
                    completed_at: now,
                    row_count: row_count as i32,
                    indexed_count: 0,
                    quarantined_count: 0,
                    rejected_count: 0,
                    primary_error_code: Some(code),
                    errors: vec![RunRowError {
                        row_index: None,
                        code: code.as_str().to_string(),
                        message,
                    }],
                },
            )
            .await?;
        self.store
            .apply_run_result(
                feed.id,
                FeedRunResult {
                    consecutive_failures: decision.consecutive_failures as i32,
                    new_state: decision.auto_disabled.then_some(FeedState::Disabled),
                    // A failed fetch says nothing about row quality.
                    health: feed.feed_health(),
                    content_hash: None,
                    last_run_at: now,
                    succeeded: false,
                    last_error_code: Some(code),
                    next_run_at: decision.next_run_at,
                },
            )
            .await?;
        self.dispatch_notices(feed, &decision.notices, Some(code)).await;

        Ok(RunReport {
            run_id: run.id,
            status: RunStatus::Failed,
            row_count,
            indexed_count: 0,
            quarantined_count: 0,
            rejected_count: 0,
            deactivated_count: 0,
            notices: decision.notices,
            enqueued_batches: 0,
        })
    }

    async fn dispatch_notices(
        &self,
        feed: &FeedSource,
        notices: &[FeedNotice],
        code: Option<ErrorCode>,
    ) {
        let detail = code.map(|c| c.as_str().to_string()).unwrap_or_default();
        for notice in notices {
            let notification = feed_notification(feed, *notice, &detail);
            // Delivery failures are logged by the dispatcher; operator
            // notices are best-effort.
            let _ = self.dispatcher.dispatch(notice.as_str(), &notification).await;
        }
    }

    async fn enqueue_match_batches(
        &self,
        feed: &FeedSource,
        run_id: Uuid,
    ) -> Result<u32, IngestError> {
        let touched = self.store.records_touched_by(run_id).await?;
        let batch_size = self.config.match_batch_size.max(1) as usize;

        let mut batches = 0u32;
        for (index, chunk) in touched.chunks(batch_size).enumerate() {
            let index = index as u32;
            let envelope = JobEnvelope::new(
                JobKind::MatchBatch,
                serde_json::json!({
                    "run_id": run_id,
                    "batch_index": index,
                    "record_ids": chunk,
                }),
                batch_key(run_id, index),
                feed.id.to_string(),
            );
            self.producer.enqueue(envelope).await?;
            batches += 1;
        }
        Ok(batches)
    }
}

#[derive(Debug, Default)]
struct Lanes {
    indexed: u32,
    quarantined: u32,
    rejected: u32,
    errors: Vec<RunRowError>,
}
