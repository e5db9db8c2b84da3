//! Notification dispatch.
//!
//! The pipeline emits two message families: operator notices about feed
//! health (run failures, auto-disable, recovery, warnings) and
//! subscriber alerts (price drop, back in stock). Both go through the
//! same [`Dispatcher`]; message content is rendered here, delivery
//! correctness (exactly-once for alerts) is the caller's concern.

pub mod dispatcher;
pub mod message;
pub mod traits;
pub mod webhook;

pub use dispatcher::Dispatcher;
pub use message::{alert_notification, feed_notification};
pub use traits::{DispatchResult, Notification, Notifier, NotifyError};
pub use webhook::WebhookNotifier;
