//! Message rendering for feed notices and subscriber alerts.
//!
//! The pipeline guarantees when a message is sent; this module only
//! decides what it says.

use std::collections::HashMap;

use uuid::Uuid;

use feedmill_core::{FeedNotice, FeedSource, RuleKind};

use crate::traits::Notification;

/// Render an operator notice about a feed's run outcome or health.
pub fn feed_notification(feed: &FeedSource, notice: FeedNotice, detail: &str) -> Notification {
    let (subject, body) = match notice {
        FeedNotice::RunFailed => (
            format!("Feed run failed: {}", feed.name),
            format!(
                "Run for feed \"{}\" failed ({} consecutive failure(s)). {}",
                feed.name,
                feed.consecutive_failures.max(1),
                detail
            ),
        ),
        FeedNotice::AutoDisabled => (
            format!("Feed auto-disabled: {}", feed.name),
            format!(
                "Feed \"{}\" reached the consecutive-failure threshold and was disabled. \
                 Re-enable it manually after fixing the underlying problem. {}",
                feed.name, detail
            ),
        ),
        FeedNotice::Recovery => (
            format!("Feed recovered: {}", feed.name),
            format!("Feed \"{}\" succeeded after earlier failures. {}", feed.name, detail),
        ),
        FeedNotice::Warning => (
            format!("Feed health warning: {}", feed.name),
            format!(
                "Feed \"{}\" produced an elevated share of rejected or quarantined rows. {}",
                feed.name, detail
            ),
        ),
    };
    Notification {
        subject,
        body,
        metadata: HashMap::from([
            ("feed_id".to_string(), feed.id.to_string()),
            ("notice".to_string(), notice.as_str().to_string()),
        ]),
    }
}

/// Render a subscriber alert for a committed claim.
pub fn alert_notification(
    subscription_id: Uuid,
    rule: RuleKind,
    product_title: &str,
    detail: &str,
) -> Notification {
    let subject = match rule {
        RuleKind::PriceDrop => format!("Price drop: {product_title}"),
        RuleKind::BackInStock => format!("Back in stock: {product_title}"),
    };
    Notification {
        subject,
        body: detail.to_string(),
        metadata: HashMap::from([
            ("subscription_id".to_string(), subscription_id.to_string()),
            ("rule".to_string(), rule.as_str().to_string()),
        ]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn feed(name: &str, failures: i32) -> FeedSource {
        FeedSource {
            id: Uuid::new_v4(),
            name: name.to_string(),
            format: "json".into(),
            locator: "https://example.com/feed.json".into(),
            transport: "http".into(),
            state: "enabled".into(),
            health: "healthy".into(),
            schedule_interval_minutes: 60,
            consecutive_failures: failures,
            content_hash: None,
            last_run_at: None,
            last_success_at: None,
            last_failure_at: None,
            last_error_code: None,
            next_run_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn feed_notice_carries_metadata() {
        let f = feed("Acme Catalog", 2);
        let n = feed_notification(&f, FeedNotice::RunFailed, "FETCH_ERROR");
        assert!(n.subject.contains("Acme Catalog"));
        assert_eq!(n.metadata["notice"], "run_failed");
        assert_eq!(n.metadata["feed_id"], f.id.to_string());
    }

    #[test]
    fn alert_subject_varies_by_rule() {
        let sub = Uuid::new_v4();
        let drop = alert_notification(sub, RuleKind::PriceDrop, "Widget", "now 9.99");
        let stock = alert_notification(sub, RuleKind::BackInStock, "Widget", "available");
        assert!(drop.subject.starts_with("Price drop"));
        assert!(stock.subject.starts_with("Back in stock"));
        assert_eq!(drop.metadata["rule"], "price_drop");
    }
}
