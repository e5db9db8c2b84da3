//! AWS SQS backend (FIFO).
//!
//! Idempotent enqueue maps the envelope's identity key to the FIFO
//! `MessageDeduplicationId`; SQS collapses duplicate keys within its
//! 5-minute dedup window. `MessageGroupId` carries the envelope group,
//! which serializes delivery per feed/subscription.

use async_trait::async_trait;
use aws_credential_types::Credentials;
use aws_sdk_sqs::config::BehaviorVersion;
use aws_sdk_sqs::types::QueueAttributeName;
use aws_sdk_sqs::Client;
use chrono::{TimeZone, Utc};
use tracing::{debug, info};

use feedmill_core::config::QueueConfig;

use crate::consumer::{JobConsumer, JobMessage, QueueHealth};
use crate::error::QueueError;
use crate::job::JobEnvelope;
use crate::producer::{EnqueueOutcome, JobProducer};

/// SQS-backed queue. One struct serves both the producer and consumer
/// halves of the abstraction.
pub struct SqsJobQueue {
    client: Client,
    queue_url: String,
    visibility_timeout_secs: i32,
}

impl SqsJobQueue {
    /// Create an SQS queue client from project config.
    ///
    /// The configured queue must be a FIFO queue; standard SQS queues
    /// have no dedup-by-key and would break the idempotent-enqueue
    /// contract.
    pub async fn new(config: &QueueConfig) -> Result<Self, QueueError> {
        let queue_url = config
            .queue_url
            .clone()
            .ok_or_else(|| QueueError::NotFound("QUEUE_URL is not set".into()))?;

        let region = aws_sdk_sqs::config::Region::new(config.region.clone());

        // Build SQS client config directly rather than from ambient AWS
        // env defaults; a shared AWS_ENDPOINT_URL may point elsewhere.
        let mut sqs_config = aws_sdk_sqs::Config::builder()
            .region(region)
            .behavior_version(BehaviorVersion::latest());

        if let (Some(key_id), Some(secret)) = (&config.access_key_id, &config.secret_access_key) {
            let creds = Credentials::new(
                key_id,
                secret,
                config.session_token.clone(),
                None,
                "feedmill-queue-static",
            );
            sqs_config = sqs_config.credentials_provider(creds);
        }

        if let Some(ref endpoint) = config.endpoint_url {
            if !endpoint.is_empty() {
                let url = if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
                    endpoint.clone()
                } else {
                    format!("https://{endpoint}")
                };
                sqs_config = sqs_config.endpoint_url(&url);
            }
        }

        let client = Client::from_conf(sqs_config.build());

        info!(queue_url = %queue_url, region = %config.region, "SQS queue initialized");

        Ok(Self {
            client,
            queue_url,
            visibility_timeout_secs: config.visibility_timeout_secs as i32,
        })
    }
}

#[async_trait]
impl JobProducer for SqsJobQueue {
    async fn enqueue(&self, envelope: JobEnvelope) -> Result<EnqueueOutcome, QueueError> {
        let body = serde_json::to_string(&envelope)
            .map_err(|e| QueueError::Enqueue(format!("serializing job envelope: {e}")))?;

        debug!(
            kind = %envelope.kind,
            key = %envelope.idempotency_key,
            group = %envelope.group,
            "Enqueueing SQS message"
        );

        self.client
            .send_message()
            .queue_url(&self.queue_url)
            .message_body(body)
            .message_deduplication_id(&envelope.idempotency_key)
            .message_group_id(&envelope.group)
            .send()
            .await
            .map_err(|e| QueueError::Enqueue(format!("SQS send failed: {e:?}")))?;

        // FIFO dedup is server-side and not observable in the response.
        Ok(EnqueueOutcome::Enqueued)
    }
}

#[async_trait]
impl JobConsumer for SqsJobQueue {
    async fn poll_batch(&self, max_messages: u32) -> Result<Vec<JobMessage>, QueueError> {
        // SQS caps at 10 messages per request.
        let capped = max_messages.min(10) as i32;

        debug!(max_messages = capped, "Polling SQS");

        let resp = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(capped)
            .wait_time_seconds(20)
            .visibility_timeout(self.visibility_timeout_secs)
            .message_system_attribute_names(aws_sdk_sqs::types::MessageSystemAttributeName::All)
            .send()
            .await
            .map_err(|e| QueueError::Connection(format!("SQS receive failed: {e:?}")))?;

        let sqs_messages = resp.messages.unwrap_or_default();
        debug!(count = sqs_messages.len(), "Received SQS messages");

        let mut messages = Vec::with_capacity(sqs_messages.len());
        for msg in sqs_messages {
            let id = msg.message_id().unwrap_or("unknown").to_string();
            let body = msg.body().unwrap_or("").to_string();

            let receipt_handle = msg
                .receipt_handle()
                .ok_or_else(|| QueueError::Parse("missing receipt handle".into()))?
                .to_string();

            let timestamp = msg
                .attributes()
                .and_then(|attrs| {
                    attrs.get(&aws_sdk_sqs::types::MessageSystemAttributeName::SentTimestamp)
                })
                .and_then(|ts| ts.parse::<i64>().ok())
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
                .unwrap_or_else(Utc::now);

            let attempt_count = msg
                .attributes()
                .and_then(|attrs| {
                    attrs.get(
                        &aws_sdk_sqs::types::MessageSystemAttributeName::ApproximateReceiveCount,
                    )
                })
                .and_then(|c| c.parse::<u32>().ok())
                .unwrap_or(1);

            messages.push(JobMessage {
                id,
                body,
                receipt_handle,
                timestamp,
                attempt_count,
            });
        }

        Ok(messages)
    }

    async fn ack(&self, receipt_handle: &str) -> Result<(), QueueError> {
        debug!(receipt_handle, "Acking SQS message");

        self.client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_handle)
            .send()
            .await
            .map_err(|e| QueueError::Ack(format!("SQS delete failed: {e:?}")))?;

        Ok(())
    }

    async fn nack(&self, receipt_handle: &str) -> Result<(), QueueError> {
        debug!(receipt_handle, "Nacking SQS message (visibility=0)");

        self.client
            .change_message_visibility()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_handle)
            .visibility_timeout(0)
            .send()
            .await
            .map_err(|e| QueueError::Provider(format!("SQS visibility change failed: {e:?}")))?;

        Ok(())
    }

    async fn health_check(&self) -> Result<QueueHealth, QueueError> {
        let resp = self
            .client
            .get_queue_attributes()
            .queue_url(&self.queue_url)
            .attribute_names(QueueAttributeName::ApproximateNumberOfMessages)
            .send()
            .await
            .map_err(|e| QueueError::Connection(format!("SQS health check failed: {e:?}")))?;

        let count = resp
            .attributes()
            .and_then(|attrs| attrs.get(&QueueAttributeName::ApproximateNumberOfMessages))
            .and_then(|v| v.parse::<u64>().ok());

        Ok(QueueHealth {
            connected: true,
            approximate_message_count: count,
            provider: "sqs".to_string(),
        })
    }
}
