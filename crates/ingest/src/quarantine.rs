//! Operator actions on quarantined records.
//!
//! Resolution happens implicitly when a later run indexes the same
//! logical product (see the orchestrator); the operations here are the
//! explicit operator paths: dismiss an entry as noise, or force a
//! manual re-run of its feed.

use std::sync::Arc;

use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use feedmill_core::{QuarantinedRecord, QuarantineStatus};
use feedmill_queue::{JobEnvelope, JobKind, JobProducer};

use crate::error::IngestError;
use crate::store::IngestStore;

/// Minimum length for the operator's dismissal note, after trimming.
const MIN_NOTE_LEN: usize = 10;

pub struct QuarantineService<S> {
    store: Arc<S>,
    producer: Arc<dyn JobProducer>,
}

/// What a dismiss call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DismissOutcome {
    Dismissed,
    /// The entry was already dismissed; the call is a no-op.
    AlreadyDismissed,
}

impl<S: IngestStore> QuarantineService<S> {
    pub fn new(store: Arc<S>, producer: Arc<dyn JobProducer>) -> Self {
        Self { store, producer }
    }

    /// Dismiss a quarantined entry with a mandatory operator note.
    ///
    /// Idempotent on repeat: a second dismiss of the same entry
    /// succeeds without a second audit entry. Dismissing a RESOLVED
    /// entry is a conflict; resolution is the stronger outcome.
    pub async fn dismiss(
        &self,
        record_id: Uuid,
        note: &str,
    ) -> Result<DismissOutcome, IngestError> {
        let note = note.trim();
        if note.len() < MIN_NOTE_LEN {
            return Err(IngestError::Validation(format!(
                "dismissal note must be at least {MIN_NOTE_LEN} characters"
            )));
        }

        let record = self.require(record_id).await?;
        match record.quarantine_status() {
            QuarantineStatus::Dismissed => return Ok(DismissOutcome::AlreadyDismissed),
            QuarantineStatus::Resolved => {
                return Err(IngestError::StatusConflict {
                    current: record.status.clone(),
                    expected: QuarantineStatus::Quarantined.as_str().to_string(),
                });
            }
            QuarantineStatus::Quarantined => {}
        }

        // Conditional transition: a concurrent resolve or dismiss can
        // win between the read above and this write.
        if !self.store.dismiss_quarantined(record_id).await? {
            let current = self.require(record_id).await?;
            return match current.quarantine_status() {
                QuarantineStatus::Dismissed => Ok(DismissOutcome::AlreadyDismissed),
                _ => Err(IngestError::StatusConflict {
                    current: current.status,
                    expected: QuarantineStatus::Quarantined.as_str().to_string(),
                }),
            };
        }

        self.store
            .record_quarantine_audit(record_id, "dismiss", note)
            .await?;
        info!(record_id = %record_id, "quarantined record dismissed");
        Ok(DismissOutcome::Dismissed)
    }

    /// Force a manual run of the quarantined record's feed. The run
    /// itself decides whether the entry resolves.
    pub async fn reprocess(&self, record_id: Uuid, note: &str) -> Result<Uuid, IngestError> {
        let record = self.require(record_id).await?;
        if record.quarantine_status() != QuarantineStatus::Quarantined {
            return Err(IngestError::StatusConflict {
                current: record.status,
                expected: QuarantineStatus::Quarantined.as_str().to_string(),
            });
        }

        let feed = self
            .store
            .get_feed(record.feed_id)
            .await?
            .ok_or(IngestError::FeedNotFound(record.feed_id))?;

        // Manual triggers carry a distinct qualifier so they never
        // collapse onto a pending scheduled run's windowed key.
        let key = format!(
            "{}:{}:manual:{}",
            JobKind::FeedRun,
            feed.id,
            Utc::now().timestamp()
        );
        self.producer
            .enqueue(JobEnvelope::new(
                JobKind::FeedRun,
                serde_json::json!({
                    "feed_id": feed.id,
                    "trigger": "manual",
                }),
                key,
                feed.id.to_string(),
            ))
            .await?;

        self.store
            .record_quarantine_audit(record_id, "reprocess", note.trim())
            .await?;
        info!(record_id = %record_id, feed_id = %feed.id, "manual reprocess enqueued");
        Ok(feed.id)
    }

    async fn require(&self, record_id: Uuid) -> Result<QuarantinedRecord, IngestError> {
        self.store
            .get_quarantined(record_id)
            .await?
            .ok_or(IngestError::QuarantineNotFound(record_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use feedmill_queue::MemoryJobQueue;

    use crate::memory::MemoryStore;
    use crate::store::{FeedStore, NewFeedSource, QuarantineStore};

    async fn setup() -> (QuarantineService<MemoryStore>, Arc<MemoryStore>, Arc<MemoryJobQueue>) {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryJobQueue::new());
        let service = QuarantineService::new(store.clone(), queue.clone());
        (service, store, queue)
    }

    async fn quarantined(store: &MemoryStore) -> Uuid {
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
        let now = Utc::now();
        let record = QuarantinedRecord {
            id: Uuid::new_v4(),
            feed_id: feed.id,
            match_key: "widget\u{1f}".into(),
            status: QuarantineStatus::Quarantined.as_str().into(),
            title: Some("widget".into()),
            sku: None,
            price_cents: Some(1000),
            raw: serde_json::json!({"title": "widget"}),
            blocking_errors: serde_json::json!([]),
            last_seen_run_id: Uuid::new_v4(),
            created_at: now,
            updated_at: now,
        };
        let id = record.id;
        store.insert_quarantined(record);
        id
    }

    fn audits_for(store: &MemoryStore, id: Uuid) -> Vec<crate::memory::AuditEntry> {
        store
            .audit_entries()
            .into_iter()
            .filter(|a| a.record_id == id)
            .collect()
    }

    #[tokio::test]
    async fn dismiss_requires_substantive_note() {
        let (service, store, _) = setup().await;
        let id = quarantined(&store).await;

        let err = service.dismiss(id, "  short  ").await.unwrap_err();
        assert!(matches!(err, IngestError::Validation(_)));

        // The record is untouched.
        let record = store.get_quarantined(id).await.unwrap().unwrap();
        assert_eq!(record.quarantine_status(), QuarantineStatus::Quarantined);
    }

    #[tokio::test]
    async fn dismiss_is_idempotent() {
        let (service, store, _) = setup().await;
        let id = quarantined(&store).await;

        let first = service.dismiss(id, "supplier confirmed duplicate").await.unwrap();
        assert_eq!(first, DismissOutcome::Dismissed);

        let second = service.dismiss(id, "supplier confirmed duplicate").await.unwrap();
        assert_eq!(second, DismissOutcome::AlreadyDismissed);

        // One audit entry, not two.
        let audits = audits_for(&store, id);
        assert_eq!(audits.len(), 1);
        assert_eq!(audits[0].action, "dismiss");
    }

    #[tokio::test]
    async fn dismiss_of_resolved_entry_conflicts() {
        let (service, store, _) = setup().await;
        let id = quarantined(&store).await;

        let record = store.get_quarantined(id).await.unwrap().unwrap();
        store
            .resolve_matching(record.feed_id, &record.match_key, Uuid::new_v4())
            .await
            .unwrap();

        let err = service.dismiss(id, "cleaning out old entries").await.unwrap_err();
        assert!(matches!(err, IngestError::StatusConflict { .. }));
    }

    #[tokio::test]
    async fn dismiss_of_missing_entry_is_not_found() {
        let (service, _, _) = setup().await;
        let err = service
            .dismiss(Uuid::new_v4(), "long enough note here")
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::QuarantineNotFound(_)));
    }

    #[tokio::test]
    async fn reprocess_enqueues_manual_run_and_audits() {
        let (service, store, queue) = setup().await;
        let id = quarantined(&store).await;

        let feed_id = service.reprocess(id, "supplier fixed the export").await.unwrap();
        assert_eq!(queue.len(), 1);

        let audits = audits_for(&store, id);
        assert_eq!(audits.len(), 1);
        assert_eq!(audits[0].action, "reprocess");

        let record = store.get_quarantined(id).await.unwrap().unwrap();
        assert_eq!(record.feed_id, feed_id);
        // Reprocess does not move the status; the next run does.
        assert_eq!(record.quarantine_status(), QuarantineStatus::Quarantined);
    }

    #[tokio::test]
    async fn reprocess_of_dismissed_entry_conflicts() {
        let (service, store, queue) = setup().await;
        let id = quarantined(&store).await;

        service.dismiss(id, "supplier confirmed duplicate").await.unwrap();
        let err = service.reprocess(id, "second thoughts").await.unwrap_err();
        assert!(matches!(err, IngestError::StatusConflict { .. }));
        assert_eq!(queue.len(), 0);
    }
}
