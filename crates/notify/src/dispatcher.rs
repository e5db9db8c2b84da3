//! Routes notifications to configured channels.
//!
//! The dispatcher delivers a notification to every configured channel
//! for its message kind. Individual channel failures don't block other
//! channels; the caller inspects the per-channel results when delivery
//! matters for correctness (committed alert claims).

use std::collections::HashMap;

use crate::traits::{DispatchResult, Notification, Notifier, NotifyError};

/// Dispatches notifications to multiple channels, organized per message
/// kind ("run_failed", "auto_disabled", "price_drop", ...).
pub struct Dispatcher {
    /// Message kind → list of notifier channels for that kind.
    kind_channels: HashMap<String, Vec<Box<dyn Notifier>>>,
    /// Fallback channels used when no kind-specific channels exist.
    default_channels: Vec<Box<dyn Notifier>>,
}

impl Dispatcher {
    /// Create an empty dispatcher.
    pub fn empty() -> Self {
        Self {
            kind_channels: HashMap::new(),
            default_channels: Vec::new(),
        }
    }

    /// Create a simple dispatcher with channels shared across all kinds.
    pub fn with_defaults(channels: Vec<Box<dyn Notifier>>) -> Self {
        Self {
            kind_channels: HashMap::new(),
            default_channels: channels,
        }
    }

    /// Replace all channels for a specific message kind.
    pub fn set_kind_channels(&mut self, kind: String, channels: Vec<Box<dyn Notifier>>) {
        self.kind_channels.insert(kind, channels);
    }

    /// Dispatch a notification to all channels for its kind.
    ///
    /// Returns results for each channel delivery. Individual failures
    /// don't block other channels.
    pub async fn dispatch(&self, kind: &str, notification: &Notification) -> Vec<DispatchResult> {
        let channels = self
            .kind_channels
            .get(kind)
            .unwrap_or(&self.default_channels);

        if channels.is_empty() {
            tracing::debug!(kind, "No notification channels configured");
            return Vec::new();
        }

        let mut results = Vec::with_capacity(channels.len());

        for channel in channels {
            let start = std::time::Instant::now();
            let result = channel.send(notification).await;
            let duration_ms = start.elapsed().as_millis() as u64;

            let (success, error) = match result {
                Ok(()) => {
                    tracing::info!(
                        kind,
                        channel = channel.channel_name(),
                        duration_ms,
                        "Notification delivered"
                    );
                    (true, None)
                }
                Err(e) => {
                    tracing::warn!(
                        kind,
                        channel = channel.channel_name(),
                        error = %e,
                        duration_ms,
                        "Notification delivery failed"
                    );
                    (false, Some(e.to_string()))
                }
            };

            results.push(DispatchResult {
                channel: channel.channel_name().to_string(),
                subject_key: notification
                    .metadata
                    .get("feed_id")
                    .or_else(|| notification.metadata.get("subscription_id"))
                    .cloned()
                    .unwrap_or_default(),
                success,
                error,
                duration_ms,
            });
        }

        results
    }

    /// Send a test notification to a kind's channel by index. Falls
    /// back to the default channels when the kind has none, matching
    /// `dispatch` routing.
    pub async fn test_notify(&self, kind: &str, channel_index: usize) -> Result<(), NotifyError> {
        let channels = self
            .kind_channels
            .get(kind)
            .unwrap_or(&self.default_channels);

        let channel = channels.get(channel_index).ok_or_else(|| {
            NotifyError::Config(format!("Channel index {channel_index} out of range for '{kind}'"))
        })?;

        channel.test().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct MockNotifier {
        name: String,
        send_count: Arc<AtomicUsize>,
        should_fail: bool,
    }

    #[async_trait::async_trait]
    impl Notifier for MockNotifier {
        async fn send(&self, _notification: &Notification) -> Result<(), NotifyError> {
            self.send_count.fetch_add(1, Ordering::SeqCst);
            if self.should_fail {
                Err(NotifyError::Config("mock failure".to_string()))
            } else {
                Ok(())
            }
        }
        fn channel_name(&self) -> &str {
            &self.name
        }
    }

    fn notification() -> Notification {
        Notification {
            subject: "test".to_string(),
            body: "test body".to_string(),
            metadata: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn dispatch_to_all_channels() {
        let count_a = Arc::new(AtomicUsize::new(0));
        let count_b = Arc::new(AtomicUsize::new(0));

        let channels: Vec<Box<dyn Notifier>> = vec![
            Box::new(MockNotifier {
                name: "a".to_string(),
                send_count: count_a.clone(),
                should_fail: false,
            }),
            Box::new(MockNotifier {
                name: "b".to_string(),
                send_count: count_b.clone(),
                should_fail: false,
            }),
        ];

        let mut dispatcher = Dispatcher::empty();
        dispatcher.set_kind_channels("run_failed".to_string(), channels);

        let results = dispatcher.dispatch("run_failed", &notification()).await;
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.success));
        assert_eq!(count_a.load(Ordering::SeqCst), 1);
        assert_eq!(count_b.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn partial_failure_doesnt_block() {
        let count = Arc::new(AtomicUsize::new(0));

        let channels: Vec<Box<dyn Notifier>> = vec![
            Box::new(MockNotifier {
                name: "fail".to_string(),
                send_count: Arc::new(AtomicUsize::new(0)),
                should_fail: true,
            }),
            Box::new(MockNotifier {
                name: "ok".to_string(),
                send_count: count.clone(),
                should_fail: false,
            }),
        ];

        let mut dispatcher = Dispatcher::empty();
        dispatcher.set_kind_channels("warning".to_string(), channels);

        let results = dispatcher.dispatch("warning", &notification()).await;
        assert_eq!(results.len(), 2);
        assert!(!results[0].success);
        assert!(results[1].success);
        assert!(DispatchResult::any_delivered(&results));
        assert_eq!(count.load(Ordering::SeqCst), 1); // second channel still sent
    }

    #[tokio::test]
    async fn unknown_kind_falls_back_to_defaults() {
        let count = Arc::new(AtomicUsize::new(0));
        let dispatcher = Dispatcher::with_defaults(vec![Box::new(MockNotifier {
            name: "default".to_string(),
            send_count: count.clone(),
            should_fail: false,
        })]);

        let results = dispatcher.dispatch("anything", &notification()).await;
        assert_eq!(results.len(), 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_notify_reaches_the_default_channel() {
        let count = Arc::new(AtomicUsize::new(0));
        let dispatcher = Dispatcher::with_defaults(vec![Box::new(MockNotifier {
            name: "webhook".to_string(),
            send_count: count.clone(),
            should_fail: false,
        })]);

        dispatcher
            .test_notify("run_failed", 0)
            .await
            .expect("connectivity check should reach the channel");
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_notify_rejects_an_out_of_range_index() {
        let dispatcher = Dispatcher::with_defaults(vec![Box::new(MockNotifier {
            name: "webhook".to_string(),
            send_count: Arc::new(AtomicUsize::new(0)),
            should_fail: false,
        })]);

        let err = dispatcher.test_notify("run_failed", 3).await;
        assert!(matches!(err, Err(NotifyError::Config(_))));
    }

    #[tokio::test]
    async fn empty_dispatcher_returns_no_results() {
        let dispatcher = Dispatcher::empty();
        let results = dispatcher.dispatch("run_failed", &notification()).await;
        assert!(results.is_empty());
    }
}
