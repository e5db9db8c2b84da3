//! Queue worker for alert evaluation jobs.
//!
//! Handlers are idempotent by construction: the claim protocol absorbs
//! duplicate deliveries, so a redelivered evaluation job at worst
//! observes `InCooldown` or `AlreadyClaimed` and acks.

use std::sync::Arc;

use serde::Deserialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use feedmill_core::RuleKind;
use feedmill_queue::{JobConsumer, JobKind, JobMessage};

use crate::delivery::{AlertDelivery, DeliveryOutcome};
use crate::error::AlertError;

#[derive(Debug, Deserialize)]
struct EvaluatePayload {
    subscription_id: Uuid,
    rule: RuleKind,
    #[serde(default)]
    title: Option<String>,
}

pub struct AlertWorker {
    delivery: Arc<AlertDelivery>,
    consumer: Arc<dyn JobConsumer>,
    batch_size: u32,
}

impl AlertWorker {
    pub fn new(delivery: Arc<AlertDelivery>, consumer: Arc<dyn JobConsumer>, batch_size: u32) -> Self {
        Self {
            delivery,
            consumer,
            batch_size,
        }
    }

    pub async fn poll_once(&self) -> Result<usize, AlertError> {
        let messages = self.consumer.poll_batch(self.batch_size).await?;
        let mut delivered = 0;
        for message in messages {
            match self.handle_message(&message).await {
                Ok(DeliveryOutcome::Delivered) => delivered += 1,
                Ok(_) => {}
                Err(e) => {
                    error!(message_id = %message.id, error = %e, "alert handling failed");
                    self.consumer.nack(&message.receipt_handle).await?;
                }
            }
        }
        Ok(delivered)
    }

    pub async fn run(&self, poll_interval: std::time::Duration) {
        loop {
            match self.poll_once().await {
                Ok(0) => tokio::time::sleep(poll_interval).await,
                Ok(n) => info!(delivered = n, "alert batch complete"),
                Err(e) => {
                    error!(error = %e, "poll failed");
                    tokio::time::sleep(poll_interval).await;
                }
            }
        }
    }

    async fn handle_message(&self, message: &JobMessage) -> Result<DeliveryOutcome, AlertError> {
        let envelope = message
            .envelope()
            .map_err(|e| AlertError::Payload(e.to_string()))?;
        if envelope.kind != JobKind::AlertEvaluate {
            warn!(kind = %envelope.kind, "unexpected job kind on alert queue, dropping");
            self.consumer.ack(&message.receipt_handle).await?;
            return Ok(DeliveryOutcome::InCooldown);
        }

        let payload: EvaluatePayload = serde_json::from_value(envelope.payload.clone())
            .map_err(|e| AlertError::Payload(format!("evaluate payload: {e}")))?;

        let outcome = self
            .delivery
            .deliver(
                payload.subscription_id,
                payload.rule,
                payload.title.as_deref().unwrap_or("(unknown product)"),
                payload.rule.as_str(),
            )
            .await?;

        match outcome {
            // A failed dispatch goes back to the queue; the released
            // claim lets the retry in.
            DeliveryOutcome::Failed => self.consumer.nack(&message.receipt_handle).await?,
            _ => self.consumer.ack(&message.receipt_handle).await?,
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    use feedmill_notify::Dispatcher;
    use feedmill_queue::{EnqueueOutcome, JobEnvelope, JobProducer, MemoryJobQueue};

    use crate::claim::{AlertSlotStore, MemorySlotStore};

    async fn setup() -> (AlertWorker, Arc<MemorySlotStore>, Arc<MemoryJobQueue>) {
        let slots = Arc::new(MemorySlotStore::new());
        let queue = Arc::new(MemoryJobQueue::new());
        let delivery = Arc::new(AlertDelivery::new(
            slots.clone(),
            Arc::new(Dispatcher::empty()),
            Duration::days(7),
            Duration::minutes(5),
        ));
        (AlertWorker::new(delivery, queue.clone(), 10), slots, queue)
    }

    #[tokio::test]
    async fn evaluation_with_no_channels_is_acked_as_failed() {
        // An empty dispatcher delivers nothing; the claim is released
        // and the message nacked for retry.
        let (worker, slots, queue) = setup().await;
        let sub = Uuid::new_v4();

        let outcome = queue
            .enqueue(JobEnvelope::new(
                JobKind::AlertEvaluate,
                serde_json::json!({
                    "subscription_id": sub,
                    "rule": "price_drop",
                    "title": "Widget",
                }),
                format!("alert_evaluate:{sub}:price_drop"),
                sub.to_string(),
            ))
            .await
            .unwrap();
        assert_eq!(outcome, EnqueueOutcome::Enqueued);

        let delivered = worker.poll_once().await.unwrap();
        assert_eq!(delivered, 0);

        // No cooldown was started by the failed attempt.
        let slot = slots
            .get_slot(sub, RuleKind::PriceDrop)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(slot.last_notified_at, None);
        assert_eq!(slot.claim_key, None);
    }
}
