//! PostgreSQL store backend.
//!
//! Conditional writes are single statements: run finalization guards on
//! the current status, quarantine transitions guard on QUARANTINED,
//! job bindings insert with ON CONFLICT DO NOTHING. The per-feed
//! advisory lock pins a pool connection for the duration of the hold,
//! since session advisory locks are connection-scoped.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tokio::sync::Mutex;
use uuid::Uuid;

use feedmill_core::{
    FeedRun, FeedSource, IndexableRecord, PostgresConfig, QuarantinedRecord, TriggerKind,
    bound_errors,
};

use crate::error::IngestError;
use crate::store::{
    BindOutcome, BindingStore, FeedLock, FeedRunResult, FeedStore, NewFeedSource,
    NewIndexableRecord, QuarantineStore, QuarantineUpsert, RecordStore, RunFinalize, RunStore,
};

const FEED_COLUMNS: &str = "id, name, format, locator, transport, state, health, \
     schedule_interval_minutes, consecutive_failures, content_hash, last_run_at, \
     last_success_at, last_failure_at, last_error_code, next_run_at, created_at, updated_at";

const RUN_COLUMNS: &str = "id, feed_id, trigger, status, started_at, completed_at, row_count, \
     indexed_count, quarantined_count, rejected_count, primary_error_code, errors";

const QUARANTINE_COLUMNS: &str = "id, feed_id, match_key, status, title, sku, price_cents, raw, \
     blocking_errors, last_seen_run_id, created_at, updated_at";

/// All store traits backed by one Postgres pool.
pub struct PgStore {
    pool: PgPool,
    /// Connections currently pinned by held advisory locks.
    held_locks: Mutex<HashMap<Uuid, sqlx::pool::PoolConnection<sqlx::Postgres>>>,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            held_locks: Mutex::new(HashMap::new()),
        }
    }

    pub async fn connect(config: &PostgresConfig) -> Result<Self, IngestError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.connection_string())
            .await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Advisory lock key: first 8 bytes of the feed id.
    fn lock_key(feed_id: Uuid) -> i64 {
        let bytes = feed_id.as_bytes();
        i64::from_be_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
        ])
    }
}

#[async_trait]
impl FeedStore for PgStore {
    async fn create_feed(&self, new: NewFeedSource) -> Result<FeedSource, IngestError> {
        let feed = sqlx::query_as::<_, FeedSource>(&format!(
            "INSERT INTO feed_sources (name, format, locator, transport, schedule_interval_minutes)
             VALUES ($1, $2, $3, $4, $5)
             RETURNING {FEED_COLUMNS}"
        ))
        .bind(&new.name)
        .bind(&new.format)
        .bind(&new.locator)
        .bind(&new.transport)
        .bind(new.schedule_interval_minutes)
        .fetch_one(&self.pool)
        .await?;
        Ok(feed)
    }

    async fn get_feed(&self, id: Uuid) -> Result<Option<FeedSource>, IngestError> {
        let feed = sqlx::query_as::<_, FeedSource>(&format!(
            "SELECT {FEED_COLUMNS} FROM feed_sources WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(feed)
    }

    async fn due_feeds(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<FeedSource>, IngestError> {
        let feeds = sqlx::query_as::<_, FeedSource>(&format!(
            "SELECT {FEED_COLUMNS} FROM feed_sources
             WHERE state = 'enabled'
               AND (next_run_at IS NULL OR next_run_at <= $1)
             ORDER BY next_run_at ASC NULLS FIRST
             LIMIT $2"
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(feeds)
    }

    async fn apply_run_result(
        &self,
        feed_id: Uuid,
        result: FeedRunResult,
    ) -> Result<(), IngestError> {
        let rows = sqlx::query(
            "UPDATE feed_sources SET
                 consecutive_failures = $2,
                 state = COALESCE($3, state),
                 health = $4,
                 content_hash = COALESCE($5, content_hash),
                 last_run_at = $6,
                 last_success_at = CASE WHEN $7 THEN $6 ELSE last_success_at END,
                 last_failure_at = CASE WHEN $7 THEN last_failure_at ELSE $6 END,
                 last_error_code = $8,
                 next_run_at = $9,
                 updated_at = NOW()
             WHERE id = $1",
        )
        .bind(feed_id)
        .bind(result.consecutive_failures)
        .bind(result.new_state.map(|s| s.as_str().to_string()))
        .bind(result.health.as_str())
        .bind(result.content_hash)
        .bind(result.last_run_at)
        .bind(result.succeeded)
        .bind(result.last_error_code.map(|c| c.as_str().to_string()))
        .bind(result.next_run_at)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows == 0 {
            return Err(IngestError::FeedNotFound(feed_id));
        }
        Ok(())
    }

    async fn set_content_hash(&self, feed_id: Uuid, hash: &str) -> Result<(), IngestError> {
        sqlx::query(
            "UPDATE feed_sources SET content_hash = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(feed_id)
        .bind(hash)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn reschedule(
        &self,
        feed_id: Uuid,
        last_run_at: DateTime<Utc>,
        next_run_at: DateTime<Utc>,
    ) -> Result<(), IngestError> {
        sqlx::query(
            "UPDATE feed_sources SET last_run_at = $2, next_run_at = $3, updated_at = NOW()
             WHERE id = $1",
        )
        .bind(feed_id)
        .bind(last_run_at)
        .bind(next_run_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn enable_feed(&self, id: Uuid, now: DateTime<Utc>) -> Result<FeedSource, IngestError> {
        let feed = sqlx::query_as::<_, FeedSource>(&format!(
            "UPDATE feed_sources SET
                 state = 'enabled',
                 consecutive_failures = 0,
                 next_run_at = $2,
                 updated_at = NOW()
             WHERE id = $1
             RETURNING {FEED_COLUMNS}"
        ))
        .bind(id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        feed.ok_or(IngestError::FeedNotFound(id))
    }

    async fn disable_feed(&self, id: Uuid) -> Result<FeedSource, IngestError> {
        let feed = sqlx::query_as::<_, FeedSource>(&format!(
            "UPDATE feed_sources SET
                 state = 'disabled',
                 next_run_at = NULL,
                 updated_at = NOW()
             WHERE id = $1
             RETURNING {FEED_COLUMNS}"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        feed.ok_or(IngestError::FeedNotFound(id))
    }
}

#[async_trait]
impl RunStore for PgStore {
    async fn create_running(
        &self,
        feed_id: Uuid,
        trigger: TriggerKind,
        started_at: DateTime<Utc>,
    ) -> Result<FeedRun, IngestError> {
        let run = sqlx::query_as::<_, FeedRun>(&format!(
            "INSERT INTO feed_runs (feed_id, trigger, status, started_at)
             VALUES ($1, $2, 'running', $3)
             RETURNING {RUN_COLUMNS}"
        ))
        .bind(feed_id)
        .bind(trigger.as_str())
        .bind(started_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(run)
    }

    async fn finalize_run(&self, run_id: Uuid, fin: RunFinalize) -> Result<bool, IngestError> {
        let errors = serde_json::to_value(bound_errors(fin.errors))
            .unwrap_or_else(|_| serde_json::json!([]));
        let rows = sqlx::query(
            "UPDATE feed_runs SET
                 status = $2,
                 completed_at = $3,
                 row_count = $4,
                 indexed_count = $5,
                 quarantined_count = $6,
                 rejected_count = $7,
                 primary_error_code = $8,
                 errors = $9
             WHERE id = $1 AND status IN ('pending', 'running')",
        )
        .bind(run_id)
        .bind(fin.status.as_str())
        .bind(fin.completed_at)
        .bind(fin.row_count)
        .bind(fin.indexed_count)
        .bind(fin.quarantined_count)
        .bind(fin.rejected_count)
        .bind(fin.primary_error_code.map(|c| c.as_str().to_string()))
        .bind(errors)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(rows > 0)
    }

    async fn get_run(&self, run_id: Uuid) -> Result<Option<FeedRun>, IngestError> {
        let run = sqlx::query_as::<_, FeedRun>(&format!(
            "SELECT {RUN_COLUMNS} FROM feed_runs WHERE id = $1"
        ))
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(run)
    }
}

#[async_trait]
impl RecordStore for PgStore {
    async fn upsert_indexable(&self, new: NewIndexableRecord) -> Result<Uuid, IngestError> {
        let id: Uuid = sqlx::query_scalar(
            "INSERT INTO indexable_records
                 (feed_id, record_key, title, identifier, sku, price_cents, currency, raw,
                  is_active, created_by_run_id, last_updated_by_run_id)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, TRUE, $9, $9)
             ON CONFLICT (feed_id, record_key) DO UPDATE SET
                 title = EXCLUDED.title,
                 identifier = EXCLUDED.identifier,
                 sku = EXCLUDED.sku,
                 price_cents = EXCLUDED.price_cents,
                 currency = EXCLUDED.currency,
                 raw = EXCLUDED.raw,
                 is_active = TRUE,
                 last_updated_by_run_id = EXCLUDED.last_updated_by_run_id,
                 updated_at = NOW()
             RETURNING id",
        )
        .bind(new.feed_id)
        .bind(&new.record_key)
        .bind(&new.title)
        .bind(&new.identifier)
        .bind(&new.sku)
        .bind(new.price_cents)
        .bind(&new.currency)
        .bind(&new.raw)
        .bind(new.run_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn deactivate_untouched(
        &self,
        feed_id: Uuid,
        run_id: Uuid,
    ) -> Result<u64, IngestError> {
        let rows = sqlx::query(
            "UPDATE indexable_records SET is_active = FALSE, updated_at = NOW()
             WHERE feed_id = $1 AND is_active AND last_updated_by_run_id <> $2",
        )
        .bind(feed_id)
        .bind(run_id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(rows)
    }

    async fn records_touched_by(&self, run_id: Uuid) -> Result<Vec<Uuid>, IngestError> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            "SELECT id FROM indexable_records
             WHERE last_updated_by_run_id = $1
             ORDER BY updated_at, id",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn get_record(&self, id: Uuid) -> Result<Option<IndexableRecord>, IngestError> {
        let record = sqlx::query_as::<_, IndexableRecord>(
            "SELECT id, feed_id, record_key, title, identifier, sku, price_cents, currency,
                    raw, is_active, created_by_run_id, last_updated_by_run_id,
                    created_at, updated_at
             FROM indexable_records WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }
}

#[async_trait]
impl QuarantineStore for PgStore {
    async fn upsert_quarantined(&self, upsert: QuarantineUpsert) -> Result<(), IngestError> {
        let errors = serde_json::to_value(bound_errors(upsert.blocking_errors))
            .unwrap_or_else(|_| serde_json::json!([]));
        // Status deliberately untouched on conflict: terminal states are
        // sticky under re-ingestion.
        sqlx::query(
            "INSERT INTO quarantined_records
                 (feed_id, match_key, status, title, sku, price_cents, raw,
                  blocking_errors, last_seen_run_id)
             VALUES ($1, $2, 'quarantined', $3, $4, $5, $6, $7, $8)
             ON CONFLICT (feed_id, match_key) DO UPDATE SET
                 title = EXCLUDED.title,
                 sku = EXCLUDED.sku,
                 price_cents = EXCLUDED.price_cents,
                 raw = EXCLUDED.raw,
                 blocking_errors = EXCLUDED.blocking_errors,
                 last_seen_run_id = EXCLUDED.last_seen_run_id,
                 updated_at = NOW()",
        )
        .bind(upsert.feed_id)
        .bind(&upsert.match_key)
        .bind(&upsert.title)
        .bind(&upsert.sku)
        .bind(upsert.price_cents)
        .bind(&upsert.raw)
        .bind(errors)
        .bind(upsert.run_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn resolve_matching(
        &self,
        feed_id: Uuid,
        match_key: &str,
        run_id: Uuid,
    ) -> Result<bool, IngestError> {
        let rows = sqlx::query(
            "UPDATE quarantined_records SET
                 status = 'resolved',
                 last_seen_run_id = $3,
                 updated_at = NOW()
             WHERE feed_id = $1 AND match_key = $2 AND status = 'quarantined'",
        )
        .bind(feed_id)
        .bind(match_key)
        .bind(run_id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(rows > 0)
    }

    async fn get_quarantined(&self, id: Uuid) -> Result<Option<QuarantinedRecord>, IngestError> {
        let record = sqlx::query_as::<_, QuarantinedRecord>(&format!(
            "SELECT {QUARANTINE_COLUMNS} FROM quarantined_records WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    async fn dismiss_quarantined(&self, id: Uuid) -> Result<bool, IngestError> {
        let rows = sqlx::query(
            "UPDATE quarantined_records SET status = 'dismissed', updated_at = NOW()
             WHERE id = $1 AND status = 'quarantined'",
        )
        .bind(id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(rows > 0)
    }

    async fn record_quarantine_audit(
        &self,
        record_id: Uuid,
        action: &str,
        note: &str,
    ) -> Result<(), IngestError> {
        sqlx::query(
            "INSERT INTO quarantine_audit (record_id, action, note) VALUES ($1, $2, $3)",
        )
        .bind(record_id)
        .bind(action)
        .bind(note)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl BindingStore for PgStore {
    async fn bind_job(&self, job_key: &str, run_id: Uuid) -> Result<BindOutcome, IngestError> {
        let rows = sqlx::query(
            "INSERT INTO job_bindings (job_key, run_id) VALUES ($1, $2)
             ON CONFLICT (job_key) DO NOTHING",
        )
        .bind(job_key)
        .bind(run_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows > 0 {
            return Ok(BindOutcome::Bound);
        }

        let existing: Option<Uuid> =
            sqlx::query_scalar("SELECT run_id FROM job_bindings WHERE job_key = $1")
                .bind(job_key)
                .fetch_optional(&self.pool)
                .await?;
        match existing {
            Some(bound) => Ok(BindOutcome::AlreadyBound(bound)),
            // Insert lost the race but the winner's row is not visible;
            // treat the binding as unconfirmed.
            None => Err(IngestError::BindingFailed {
                job_key: job_key.to_string(),
                reason: "binding row not visible after conflict".to_string(),
            }),
        }
    }

    async fn lookup_binding(&self, job_key: &str) -> Result<Option<Uuid>, IngestError> {
        let run_id: Option<Uuid> =
            sqlx::query_scalar("SELECT run_id FROM job_bindings WHERE job_key = $1")
                .bind(job_key)
                .fetch_optional(&self.pool)
                .await?;
        Ok(run_id)
    }
}

#[async_trait]
impl FeedLock for PgStore {
    async fn try_lock_feed(&self, feed_id: Uuid) -> Result<bool, IngestError> {
        let mut held = self.held_locks.lock().await;
        if held.contains_key(&feed_id) {
            return Ok(false);
        }

        let mut conn = self.pool.acquire().await?;
        let row = sqlx::query("SELECT pg_try_advisory_lock($1) AS acquired")
            .bind(Self::lock_key(feed_id))
            .fetch_one(&mut *conn)
            .await?;
        let acquired: bool = row.try_get("acquired")?;

        if acquired {
            // Session locks live on the connection; pin it until unlock.
            held.insert(feed_id, conn);
        }
        Ok(acquired)
    }

    async fn unlock_feed(&self, feed_id: Uuid) -> Result<(), IngestError> {
        let mut held = self.held_locks.lock().await;
        if let Some(mut conn) = held.remove(&feed_id) {
            sqlx::query("SELECT pg_advisory_unlock($1)")
                .bind(Self::lock_key(feed_id))
                .execute(&mut *conn)
                .await?;
        }
        Ok(())
    }
}
