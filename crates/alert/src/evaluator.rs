//! Alert condition evaluation.
//!
//! A match batch yields record changes; the evaluator decides which
//! rule kinds each change qualifies for and enqueues one subject-keyed
//! evaluation job per (subscription, rule). The subject key means a
//! subscription has at most one pending evaluation job per rule no
//! matter how many batches fire.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use feedmill_core::RuleKind;
use feedmill_queue::{subject_key, EnqueueOutcome, JobEnvelope, JobKind, JobProducer};

use crate::error::AlertError;

/// Before/after snapshot of one record from a finished run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordChange {
    pub record_id: Uuid,
    pub title: String,
    pub previous_price_cents: Option<i64>,
    pub price_cents: i64,
    pub was_active: bool,
    pub is_active: bool,
}

/// Rule kinds a change qualifies for.
pub fn qualifying_rules(change: &RecordChange) -> Vec<RuleKind> {
    let mut rules = Vec::new();
    if change.is_active {
        if let Some(previous) = change.previous_price_cents {
            if change.price_cents < previous {
                rules.push(RuleKind::PriceDrop);
            }
        }
        if !change.was_active {
            rules.push(RuleKind::BackInStock);
        }
    }
    rules
}

/// Which subscriptions watch a given record. External collaborator;
/// the catalog side owns the watch lists.
#[async_trait]
pub trait SubscriptionLookup: Send + Sync {
    async fn watchers(&self, record_id: Uuid) -> Result<Vec<Uuid>, AlertError>;
}

pub struct Evaluator {
    subscriptions: Arc<dyn SubscriptionLookup>,
    producer: Arc<dyn JobProducer>,
}

impl Evaluator {
    pub fn new(subscriptions: Arc<dyn SubscriptionLookup>, producer: Arc<dyn JobProducer>) -> Self {
        Self {
            subscriptions,
            producer,
        }
    }

    /// Evaluate one batch of changes. Returns the number of evaluation
    /// jobs actually enqueued (deduplicated jobs excluded).
    pub async fn evaluate_batch(&self, changes: &[RecordChange]) -> Result<usize, AlertError> {
        let mut enqueued = 0;
        for change in changes {
            let rules = qualifying_rules(change);
            if rules.is_empty() {
                continue;
            }
            let watchers = self.subscriptions.watchers(change.record_id).await?;
            for subscription_id in watchers {
                for rule in &rules {
                    let envelope = JobEnvelope::new(
                        JobKind::AlertEvaluate,
                        serde_json::json!({
                            "subscription_id": subscription_id,
                            "rule": rule,
                            "record_id": change.record_id,
                            "title": change.title,
                        }),
                        // One pending evaluation per subscription; the
                        // handler re-reads current state anyway.
                        format!("{}:{}", subject_key(JobKind::AlertEvaluate, subscription_id), rule),
                        subscription_id.to_string(),
                    );
                    if self.producer.enqueue(envelope).await? == EnqueueOutcome::Enqueued {
                        enqueued += 1;
                    } else {
                        debug!(
                            subscription_id = %subscription_id,
                            rule = %rule,
                            "evaluation already pending"
                        );
                    }
                }
            }
        }
        Ok(enqueued)
    }
}
