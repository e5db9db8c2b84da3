//! Claim-wrapped notification delivery.
//!
//! The driver for one evaluation job: claim the (subscription, rule)
//! slot, dispatch with no lock held, then commit or release. At most
//! one dispatch reaches the subscriber per committed claim; a crashed
//! worker leaves a claim that goes stale and is taken over.

use std::sync::Arc;

use chrono::{Duration, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use feedmill_core::RuleKind;
use feedmill_notify::{alert_notification, Dispatcher};

use crate::claim::{AlertSlotStore, ClaimOutcome};
use crate::error::AlertError;

/// What one delivery attempt did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Dispatched and committed; the cooldown clock advanced.
    Delivered,
    /// Suppressed by the cooldown window.
    InCooldown,
    /// Another worker holds the slot; nothing sent.
    AlreadyClaimed,
    /// Dispatch failed on every channel; claim released for retry.
    Failed,
}

pub struct AlertDelivery {
    slots: Arc<dyn AlertSlotStore>,
    dispatcher: Arc<Dispatcher>,
    cooldown: Duration,
    stale_threshold: Duration,
}

impl AlertDelivery {
    pub fn new(
        slots: Arc<dyn AlertSlotStore>,
        dispatcher: Arc<Dispatcher>,
        cooldown: Duration,
        stale_threshold: Duration,
    ) -> Self {
        Self {
            slots,
            dispatcher,
            cooldown,
            stale_threshold,
        }
    }

    pub async fn deliver(
        &self,
        subscription_id: Uuid,
        rule: RuleKind,
        product_title: &str,
        detail: &str,
    ) -> Result<DeliveryOutcome, AlertError> {
        let key = Uuid::new_v4();
        let now = Utc::now();

        match self
            .slots
            .claim(
                subscription_id,
                rule,
                key,
                now,
                self.cooldown,
                self.stale_threshold,
            )
            .await?
        {
            ClaimOutcome::InCooldown => {
                info!(subscription_id = %subscription_id, rule = %rule, "suppressed by cooldown");
                return Ok(DeliveryOutcome::InCooldown);
            }
            ClaimOutcome::AlreadyClaimed => {
                info!(subscription_id = %subscription_id, rule = %rule, "slot claimed elsewhere");
                return Ok(DeliveryOutcome::AlreadyClaimed);
            }
            ClaimOutcome::Claimed => {}
        }

        // Send with no lock held. The claim is what protects the slot.
        let notification = alert_notification(subscription_id, rule, product_title, detail);
        let results = self.dispatcher.dispatch(rule.as_str(), &notification).await;

        if results.iter().any(|r| r.success) {
            // Commit can only lose to a stale takeover; either way the
            // slot has moved on and there is nothing left to do here.
            if !self.slots.commit(subscription_id, rule, key, Utc::now()).await? {
                warn!(subscription_id = %subscription_id, rule = %rule, "claim lost before commit");
            }
            Ok(DeliveryOutcome::Delivered)
        } else {
            warn!(subscription_id = %subscription_id, rule = %rule, "dispatch failed, releasing claim");
            self.slots.release(subscription_id, rule, key).await?;
            Ok(DeliveryOutcome::Failed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use feedmill_notify::{Notification, Notifier, NotifyError};

    use crate::claim::MemorySlotStore;

    struct CountingNotifier {
        sent: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl Notifier for CountingNotifier {
        async fn send(&self, _notification: &Notification) -> Result<(), NotifyError> {
            if self.fail {
                return Err(NotifyError::Rejected("channel down".into()));
            }
            self.sent.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn channel_name(&self) -> &str {
            "counting"
        }
    }

    fn delivery(fail: bool) -> (AlertDelivery, Arc<MemorySlotStore>, Arc<AtomicUsize>) {
        let sent = Arc::new(AtomicUsize::new(0));
        let slots = Arc::new(MemorySlotStore::new());
        let dispatcher = Dispatcher::with_defaults(vec![Box::new(CountingNotifier {
            sent: sent.clone(),
            fail,
        })]);
        let driver = AlertDelivery::new(
            slots.clone(),
            Arc::new(dispatcher),
            Duration::days(7),
            Duration::minutes(5),
        );
        (driver, slots, sent)
    }

    #[tokio::test]
    async fn delivers_once_then_cools_down() {
        let (driver, slots, sent) = delivery(false);
        let sub = Uuid::new_v4();

        let first = driver
            .deliver(sub, RuleKind::PriceDrop, "Widget", "price dropped")
            .await
            .unwrap();
        assert_eq!(first, DeliveryOutcome::Delivered);
        assert_eq!(sent.load(Ordering::SeqCst), 1);

        let second = driver
            .deliver(sub, RuleKind::PriceDrop, "Widget", "price dropped again")
            .await
            .unwrap();
        assert_eq!(second, DeliveryOutcome::InCooldown);
        assert_eq!(sent.load(Ordering::SeqCst), 1);

        let slot = slots
            .get_slot(sub, RuleKind::PriceDrop)
            .await
            .unwrap()
            .unwrap();
        assert!(slot.last_notified_at.is_some());
        assert_eq!(slot.claim_key, None);
    }

    #[tokio::test]
    async fn failed_dispatch_releases_without_cooldown() {
        let (driver, slots, sent) = delivery(true);
        let sub = Uuid::new_v4();

        let outcome = driver
            .deliver(sub, RuleKind::BackInStock, "Widget", "back in stock")
            .await
            .unwrap();
        assert_eq!(outcome, DeliveryOutcome::Failed);
        assert_eq!(sent.load(Ordering::SeqCst), 0);

        // No cooldown started and no claim left behind; a retry can
        // claim immediately.
        let slot = slots
            .get_slot(sub, RuleKind::BackInStock)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(slot.last_notified_at, None);
        assert_eq!(slot.claim_key, None);
    }
}
