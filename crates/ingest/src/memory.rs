//! In-memory store backend.
//!
//! Mirrors the Postgres store's conditional-write semantics behind a
//! mutex so the orchestrator and its concurrency properties can be
//! tested without a database. Used by tests and local development.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use feedmill_core::{
    FeedRun, FeedSource, FeedState, IndexableRecord, QuarantineStatus, QuarantinedRecord,
    RunStatus, TriggerKind, bound_errors,
};

use crate::error::IngestError;
use crate::store::{
    BindOutcome, BindingStore, FeedLock, FeedRunResult, FeedStore, NewFeedSource,
    NewIndexableRecord, QuarantineStore, QuarantineUpsert, RecordStore, RunFinalize, RunStore,
};

#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub record_id: Uuid,
    pub action: String,
    pub note: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    feeds: HashMap<Uuid, FeedSource>,
    runs: HashMap<Uuid, FeedRun>,
    records: HashMap<Uuid, IndexableRecord>,
    record_keys: HashMap<(Uuid, String), Uuid>,
    quarantined: HashMap<Uuid, QuarantinedRecord>,
    quarantine_keys: HashMap<(Uuid, String), Uuid>,
    audits: Vec<AuditEntry>,
    bindings: HashMap<String, Uuid>,
    locks: HashSet<Uuid>,
}

/// Mutex-protected in-memory implementation of every store trait.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Audit entries recorded so far (test inspection).
    pub fn audit_entries(&self) -> Vec<AuditEntry> {
        self.inner.lock().expect("store mutex poisoned").audits.clone()
    }

    pub fn run_count(&self) -> usize {
        self.inner.lock().expect("store mutex poisoned").runs.len()
    }

    /// Number of runs currently in the given status.
    pub fn runs_in_status(&self, status: RunStatus) -> usize {
        self.inner
            .lock()
            .expect("store mutex poisoned")
            .runs
            .values()
            .filter(|r| r.run_status() == status)
            .count()
    }

    /// Insert a prebuilt quarantined record (test setup).
    pub fn insert_quarantined(&self, record: QuarantinedRecord) {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        inner
            .quarantine_keys
            .insert((record.feed_id, record.match_key.clone()), record.id);
        inner.quarantined.insert(record.id, record);
    }
}

#[async_trait]
impl FeedStore for MemoryStore {
    async fn create_feed(&self, new: NewFeedSource) -> Result<FeedSource, IngestError> {
        let now = Utc::now();
        let feed = FeedSource {
            id: Uuid::new_v4(),
            name: new.name,
            format: new.format,
            locator: new.locator,
            transport: new.transport,
            state: FeedState::Enabled.as_str().to_string(),
            health: feedmill_core::FeedHealth::Healthy.as_str().to_string(),
            schedule_interval_minutes: new.schedule_interval_minutes,
            consecutive_failures: 0,
            content_hash: None,
            last_run_at: None,
            last_success_at: None,
            last_failure_at: None,
            last_error_code: None,
            next_run_at: None,
            created_at: now,
            updated_at: now,
        };
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        inner.feeds.insert(feed.id, feed.clone());
        Ok(feed)
    }

    async fn get_feed(&self, id: Uuid) -> Result<Option<FeedSource>, IngestError> {
        let inner = self.inner.lock().expect("store mutex poisoned");
        Ok(inner.feeds.get(&id).cloned())
    }

    async fn due_feeds(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<FeedSource>, IngestError> {
        let inner = self.inner.lock().expect("store mutex poisoned");
        let mut due: Vec<FeedSource> = inner
            .feeds
            .values()
            .filter(|f| f.is_schedulable())
            .filter(|f| f.next_run_at.is_none_or(|t| t <= now))
            .cloned()
            .collect();
        due.sort_by_key(|f| f.next_run_at);
        due.truncate(limit.max(0) as usize);
        Ok(due)
    }

    async fn apply_run_result(
        &self,
        feed_id: Uuid,
        result: FeedRunResult,
    ) -> Result<(), IngestError> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        let feed = inner
            .feeds
            .get_mut(&feed_id)
            .ok_or(IngestError::FeedNotFound(feed_id))?;
        feed.consecutive_failures = result.consecutive_failures;
        if let Some(state) = result.new_state {
            feed.state = state.as_str().to_string();
        }
        feed.health = result.health.as_str().to_string();
        if let Some(hash) = result.content_hash {
            feed.content_hash = Some(hash);
        }
        feed.last_run_at = Some(result.last_run_at);
        if result.succeeded {
            feed.last_success_at = Some(result.last_run_at);
        } else {
            feed.last_failure_at = Some(result.last_run_at);
        }
        feed.last_error_code = result.last_error_code.map(|c| c.as_str().to_string());
        feed.next_run_at = result.next_run_at;
        feed.updated_at = Utc::now();
        Ok(())
    }

    async fn set_content_hash(&self, feed_id: Uuid, hash: &str) -> Result<(), IngestError> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        let feed = inner
            .feeds
            .get_mut(&feed_id)
            .ok_or(IngestError::FeedNotFound(feed_id))?;
        feed.content_hash = Some(hash.to_string());
        feed.updated_at = Utc::now();
        Ok(())
    }

    async fn reschedule(
        &self,
        feed_id: Uuid,
        last_run_at: DateTime<Utc>,
        next_run_at: DateTime<Utc>,
    ) -> Result<(), IngestError> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        let feed = inner
            .feeds
            .get_mut(&feed_id)
            .ok_or(IngestError::FeedNotFound(feed_id))?;
        feed.last_run_at = Some(last_run_at);
        feed.next_run_at = Some(next_run_at);
        feed.updated_at = Utc::now();
        Ok(())
    }

    async fn enable_feed(&self, id: Uuid, now: DateTime<Utc>) -> Result<FeedSource, IngestError> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        let feed = inner
            .feeds
            .get_mut(&id)
            .ok_or(IngestError::FeedNotFound(id))?;
        feed.state = FeedState::Enabled.as_str().to_string();
        feed.consecutive_failures = 0;
        feed.next_run_at = Some(now);
        feed.updated_at = Utc::now();
        Ok(feed.clone())
    }

    async fn disable_feed(&self, id: Uuid) -> Result<FeedSource, IngestError> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        let feed = inner
            .feeds
            .get_mut(&id)
            .ok_or(IngestError::FeedNotFound(id))?;
        feed.state = FeedState::Disabled.as_str().to_string();
        feed.next_run_at = None;
        feed.updated_at = Utc::now();
        Ok(feed.clone())
    }
}

#[async_trait]
impl RunStore for MemoryStore {
    async fn create_running(
        &self,
        feed_id: Uuid,
        trigger: TriggerKind,
        started_at: DateTime<Utc>,
    ) -> Result<FeedRun, IngestError> {
        let run = FeedRun {
            id: Uuid::new_v4(),
            feed_id,
            trigger: trigger.as_str().to_string(),
            status: RunStatus::Running.as_str().to_string(),
            started_at,
            completed_at: None,
            row_count: 0,
            indexed_count: 0,
            quarantined_count: 0,
            rejected_count: 0,
            primary_error_code: None,
            errors: serde_json::json!([]),
        };
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        inner.runs.insert(run.id, run.clone());
        Ok(run)
    }

    async fn finalize_run(&self, run_id: Uuid, fin: RunFinalize) -> Result<bool, IngestError> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        let run = inner
            .runs
            .get_mut(&run_id)
            .ok_or(IngestError::RunNotFound(run_id))?;
        if run.run_status().is_terminal() {
            return Ok(false);
        }
        run.status = fin.status.as_str().to_string();
        run.completed_at = Some(fin.completed_at);
        run.row_count = fin.row_count;
        run.indexed_count = fin.indexed_count;
        run.quarantined_count = fin.quarantined_count;
        run.rejected_count = fin.rejected_count;
        run.primary_error_code = fin.primary_error_code.map(|c| c.as_str().to_string());
        run.errors = serde_json::to_value(bound_errors(fin.errors)).unwrap_or_default();
        Ok(true)
    }

    async fn get_run(&self, run_id: Uuid) -> Result<Option<FeedRun>, IngestError> {
        let inner = self.inner.lock().expect("store mutex poisoned");
        Ok(inner.runs.get(&run_id).cloned())
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn upsert_indexable(&self, new: NewIndexableRecord) -> Result<Uuid, IngestError> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        let key = (new.feed_id, new.record_key.clone());
        let now = Utc::now();
        if let Some(&id) = inner.record_keys.get(&key) {
            let record = inner
                .records
                .get_mut(&id)
                .ok_or_else(|| IngestError::Validation("record index out of sync".into()))?;
            record.title = new.title;
            record.identifier = new.identifier;
            record.sku = new.sku;
            record.price_cents = new.price_cents;
            record.currency = new.currency;
            record.raw = new.raw;
            record.is_active = true;
            record.last_updated_by_run_id = new.run_id;
            record.updated_at = now;
            Ok(id)
        } else {
            let id = Uuid::new_v4();
            inner.record_keys.insert(key, id);
            inner.records.insert(
                id,
                IndexableRecord {
                    id,
                    feed_id: new.feed_id,
                    record_key: new.record_key,
                    title: new.title,
                    identifier: new.identifier,
                    sku: new.sku,
                    price_cents: new.price_cents,
                    currency: new.currency,
                    raw: new.raw,
                    is_active: true,
                    created_by_run_id: new.run_id,
                    last_updated_by_run_id: new.run_id,
                    created_at: now,
                    updated_at: now,
                },
            );
            Ok(id)
        }
    }

    async fn deactivate_untouched(
        &self,
        feed_id: Uuid,
        run_id: Uuid,
    ) -> Result<u64, IngestError> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        let mut deactivated = 0;
        for record in inner.records.values_mut() {
            if record.feed_id == feed_id
                && record.is_active
                && record.last_updated_by_run_id != run_id
            {
                record.is_active = false;
                record.updated_at = Utc::now();
                deactivated += 1;
            }
        }
        Ok(deactivated)
    }

    async fn records_touched_by(&self, run_id: Uuid) -> Result<Vec<Uuid>, IngestError> {
        let inner = self.inner.lock().expect("store mutex poisoned");
        let mut touched: Vec<&IndexableRecord> = inner
            .records
            .values()
            .filter(|r| r.last_updated_by_run_id == run_id)
            .collect();
        touched.sort_by_key(|r| (r.updated_at, r.id));
        Ok(touched.iter().map(|r| r.id).collect())
    }

    async fn get_record(&self, id: Uuid) -> Result<Option<IndexableRecord>, IngestError> {
        let inner = self.inner.lock().expect("store mutex poisoned");
        Ok(inner.records.get(&id).cloned())
    }
}

#[async_trait]
impl QuarantineStore for MemoryStore {
    async fn upsert_quarantined(&self, upsert: QuarantineUpsert) -> Result<(), IngestError> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        let key = (upsert.feed_id, upsert.match_key.clone());
        let now = Utc::now();
        let errors = serde_json::to_value(bound_errors(upsert.blocking_errors))
            .unwrap_or_else(|_| serde_json::json!([]));
        if let Some(&id) = inner.quarantine_keys.get(&key) {
            let record = inner
                .quarantined
                .get_mut(&id)
                .ok_or_else(|| IngestError::Validation("quarantine index out of sync".into()))?;
            // Refresh data; status is sticky once terminal.
            record.title = upsert.title;
            record.sku = upsert.sku;
            record.price_cents = upsert.price_cents;
            record.raw = upsert.raw;
            record.blocking_errors = errors;
            record.last_seen_run_id = upsert.run_id;
            record.updated_at = now;
        } else {
            let id = Uuid::new_v4();
            inner.quarantine_keys.insert(key, id);
            inner.quarantined.insert(
                id,
                QuarantinedRecord {
                    id,
                    feed_id: upsert.feed_id,
                    match_key: upsert.match_key,
                    status: QuarantineStatus::Quarantined.as_str().to_string(),
                    title: upsert.title,
                    sku: upsert.sku,
                    price_cents: upsert.price_cents,
                    raw: upsert.raw,
                    blocking_errors: errors,
                    last_seen_run_id: upsert.run_id,
                    created_at: now,
                    updated_at: now,
                },
            );
        }
        Ok(())
    }

    async fn resolve_matching(
        &self,
        feed_id: Uuid,
        match_key: &str,
        run_id: Uuid,
    ) -> Result<bool, IngestError> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        let Some(&id) = inner.quarantine_keys.get(&(feed_id, match_key.to_string())) else {
            return Ok(false);
        };
        let record = inner
            .quarantined
            .get_mut(&id)
            .ok_or_else(|| IngestError::Validation("quarantine index out of sync".into()))?;
        if record.quarantine_status() != QuarantineStatus::Quarantined {
            return Ok(false);
        }
        record.status = QuarantineStatus::Resolved.as_str().to_string();
        record.last_seen_run_id = run_id;
        record.updated_at = Utc::now();
        Ok(true)
    }

    async fn get_quarantined(&self, id: Uuid) -> Result<Option<QuarantinedRecord>, IngestError> {
        let inner = self.inner.lock().expect("store mutex poisoned");
        Ok(inner.quarantined.get(&id).cloned())
    }

    async fn dismiss_quarantined(&self, id: Uuid) -> Result<bool, IngestError> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        let record = inner
            .quarantined
            .get_mut(&id)
            .ok_or(IngestError::QuarantineNotFound(id))?;
        if record.quarantine_status() != QuarantineStatus::Quarantined {
            return Ok(false);
        }
        record.status = QuarantineStatus::Dismissed.as_str().to_string();
        record.updated_at = Utc::now();
        Ok(true)
    }

    async fn record_quarantine_audit(
        &self,
        record_id: Uuid,
        action: &str,
        note: &str,
    ) -> Result<(), IngestError> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        inner.audits.push(AuditEntry {
            record_id,
            action: action.to_string(),
            note: note.to_string(),
            created_at: Utc::now(),
        });
        Ok(())
    }
}

#[async_trait]
impl BindingStore for MemoryStore {
    async fn bind_job(&self, job_key: &str, run_id: Uuid) -> Result<BindOutcome, IngestError> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        if let Some(&existing) = inner.bindings.get(job_key) {
            return Ok(BindOutcome::AlreadyBound(existing));
        }
        inner.bindings.insert(job_key.to_string(), run_id);
        Ok(BindOutcome::Bound)
    }

    async fn lookup_binding(&self, job_key: &str) -> Result<Option<Uuid>, IngestError> {
        let inner = self.inner.lock().expect("store mutex poisoned");
        Ok(inner.bindings.get(job_key).copied())
    }
}

#[async_trait]
impl FeedLock for MemoryStore {
    async fn try_lock_feed(&self, feed_id: Uuid) -> Result<bool, IngestError> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        Ok(inner.locks.insert(feed_id))
    }

    async fn unlock_feed(&self, feed_id: Uuid) -> Result<(), IngestError> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        inner.locks.remove(&feed_id);
        Ok(())
    }
}
