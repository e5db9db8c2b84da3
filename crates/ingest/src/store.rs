//! Persistence traits for the ingestion pipeline.
//!
//! Two implementations: [`crate::pg::PgStore`] for production and
//! [`crate::memory::MemoryStore`] for tests and local development.
//! Every method that matters for correctness under concurrent workers
//! is specified as a single conditional operation; implementations must
//! not split them into read-modify-write round trips.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use feedmill_core::{
    ErrorCode, FeedHealth, FeedRun, FeedSource, FeedState, IndexableRecord, QuarantinedRecord,
    RunRowError, RunStatus, TriggerKind,
};

use crate::error::IngestError;

/// Fields for creating a feed source.
#[derive(Debug, Clone)]
pub struct NewFeedSource {
    pub name: String,
    pub format: String,
    pub locator: String,
    pub transport: String,
    pub schedule_interval_minutes: i32,
}

/// Everything run finalization writes back to the feed row, applied as
/// one statement.
#[derive(Debug, Clone)]
pub struct FeedRunResult {
    pub consecutive_failures: i32,
    /// `Some(Disabled)` on auto-disable; `None` leaves state untouched.
    pub new_state: Option<FeedState>,
    pub health: FeedHealth,
    /// `Some` only after a successful run that processed a new payload.
    pub content_hash: Option<String>,
    pub last_run_at: DateTime<Utc>,
    pub succeeded: bool,
    pub last_error_code: Option<ErrorCode>,
    pub next_run_at: Option<DateTime<Utc>>,
}

/// Terminal values for one run row.
#[derive(Debug, Clone)]
pub struct RunFinalize {
    pub status: RunStatus,
    pub completed_at: DateTime<Utc>,
    pub row_count: i32,
    pub indexed_count: i32,
    pub quarantined_count: i32,
    pub rejected_count: i32,
    pub primary_error_code: Option<ErrorCode>,
    pub errors: Vec<RunRowError>,
}

/// Fields for upserting an indexable record.
#[derive(Debug, Clone)]
pub struct NewIndexableRecord {
    pub feed_id: Uuid,
    pub record_key: String,
    pub title: String,
    pub identifier: Option<String>,
    pub sku: Option<String>,
    pub price_cents: i64,
    pub currency: Option<String>,
    pub raw: serde_json::Value,
    pub run_id: Uuid,
}

/// Fields for upserting a quarantined record.
#[derive(Debug, Clone)]
pub struct QuarantineUpsert {
    pub feed_id: Uuid,
    pub match_key: String,
    pub title: Option<String>,
    pub sku: Option<String>,
    pub price_cents: Option<i64>,
    pub raw: serde_json::Value,
    pub blocking_errors: Vec<RunRowError>,
    pub run_id: Uuid,
}

/// Outcome of binding a job to its run row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindOutcome {
    /// This attempt created the binding and owns the run.
    Bound,
    /// A previous attempt already bound this job to the given run.
    AlreadyBound(Uuid),
}

#[async_trait]
pub trait FeedStore: Send + Sync {
    async fn create_feed(&self, new: NewFeedSource) -> Result<FeedSource, IngestError>;

    async fn get_feed(&self, id: Uuid) -> Result<Option<FeedSource>, IngestError>;

    /// Enabled feeds whose `next_run_at` is due (or never set).
    async fn due_feeds(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<FeedSource>, IngestError>;

    /// Apply a finalized run's outcome to the feed row in one statement.
    async fn apply_run_result(
        &self,
        feed_id: Uuid,
        result: FeedRunResult,
    ) -> Result<(), IngestError>;

    /// Record the digest of a successfully processed payload.
    async fn set_content_hash(&self, feed_id: Uuid, hash: &str) -> Result<(), IngestError>;

    /// Stamp the attempt time and schedule the next one without
    /// touching counters or health (skipped runs).
    async fn reschedule(
        &self,
        feed_id: Uuid,
        last_run_at: DateTime<Utc>,
        next_run_at: DateTime<Utc>,
    ) -> Result<(), IngestError>;

    /// Manual re-enable. Resets the consecutive-failure counter and
    /// makes the feed due immediately.
    async fn enable_feed(&self, id: Uuid, now: DateTime<Utc>) -> Result<FeedSource, IngestError>;

    /// Manual disable.
    async fn disable_feed(&self, id: Uuid) -> Result<FeedSource, IngestError>;
}

#[async_trait]
pub trait RunStore: Send + Sync {
    /// Create a run row in RUNNING state.
    async fn create_running(
        &self,
        feed_id: Uuid,
        trigger: TriggerKind,
        started_at: DateTime<Utc>,
    ) -> Result<FeedRun, IngestError>;

    /// Finalize a run, conditioned on it still being RUNNING. Returns
    /// `false` when the run was already terminal (finalized elsewhere).
    async fn finalize_run(&self, run_id: Uuid, fin: RunFinalize) -> Result<bool, IngestError>;

    async fn get_run(&self, run_id: Uuid) -> Result<Option<FeedRun>, IngestError>;
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Upsert by (feed_id, record_key); reactivates and stamps the
    /// updating run. Returns the record id.
    async fn upsert_indexable(&self, new: NewIndexableRecord) -> Result<Uuid, IngestError>;

    /// Clear `is_active` on this feed's records not touched by `run_id`.
    /// Returns the number of records deactivated.
    async fn deactivate_untouched(&self, feed_id: Uuid, run_id: Uuid)
        -> Result<u64, IngestError>;

    /// Ids of records touched by a run, in insertion order. Feeds the
    /// downstream match batches.
    async fn records_touched_by(&self, run_id: Uuid) -> Result<Vec<Uuid>, IngestError>;

    async fn get_record(&self, id: Uuid) -> Result<Option<IndexableRecord>, IngestError>;
}

#[async_trait]
pub trait QuarantineStore: Send + Sync {
    /// Upsert by (feed_id, match_key). Refreshes payload, parsed
    /// fields, and errors; never moves a terminal status.
    async fn upsert_quarantined(&self, upsert: QuarantineUpsert) -> Result<(), IngestError>;

    /// Move a still-QUARANTINED entry with this match key to RESOLVED
    /// (the same logical row was successfully indexed). Returns whether
    /// a row transitioned.
    async fn resolve_matching(
        &self,
        feed_id: Uuid,
        match_key: &str,
        run_id: Uuid,
    ) -> Result<bool, IngestError>;

    async fn get_quarantined(&self, id: Uuid) -> Result<Option<QuarantinedRecord>, IngestError>;

    /// Conditional QUARANTINED → DISMISSED transition. Returns whether
    /// a row transitioned; idempotency handling lives in the service.
    async fn dismiss_quarantined(&self, id: Uuid) -> Result<bool, IngestError>;

    /// Append an audit entry for an operator action.
    async fn record_quarantine_audit(
        &self,
        record_id: Uuid,
        action: &str,
        note: &str,
    ) -> Result<(), IngestError>;
}

#[async_trait]
pub trait BindingStore: Send + Sync {
    /// Durably record job → run ownership. First writer wins; later
    /// calls with the same key report the existing binding.
    async fn bind_job(&self, job_key: &str, run_id: Uuid) -> Result<BindOutcome, IngestError>;

    async fn lookup_binding(&self, job_key: &str) -> Result<Option<Uuid>, IngestError>;
}

#[async_trait]
pub trait FeedLock: Send + Sync {
    /// Non-blocking per-feed advisory lock. `false` means another
    /// attempt holds it; callers abandon, they never spin.
    async fn try_lock_feed(&self, feed_id: Uuid) -> Result<bool, IngestError>;

    async fn unlock_feed(&self, feed_id: Uuid) -> Result<(), IngestError>;
}

/// The full persistence surface the orchestrator needs.
pub trait IngestStore:
    FeedStore + RunStore + RecordStore + QuarantineStore + BindingStore + FeedLock
{
}

impl<T> IngestStore for T where
    T: FeedStore + RunStore + RecordStore + QuarantineStore + BindingStore + FeedLock
{
}
