//! Failure policy and health classification.
//!
//! Pure functions: everything here is computed from inputs alone, with
//! timestamps passed in, so the run-counting and auto-disable behavior
//! is directly testable without a store.

use chrono::{DateTime, Duration, Utc};

use feedmill_core::{FeedHealth, FeedNotice};

/// Consecutive failures at which a feed is disabled automatically.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

/// Terminal outcome of one run, as seen by the failure policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Succeeded,
    Failed,
}

/// What the failure policy decided for one finalized run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyDecision {
    pub consecutive_failures: u32,
    pub auto_disabled: bool,
    /// `None` exactly when the feed was auto-disabled.
    pub next_run_at: Option<DateTime<Utc>>,
    pub notices: Vec<FeedNotice>,
}

/// Apply one run outcome to the feed's failure counter.
///
/// - Success resets the counter and emits [`FeedNotice::Recovery`] iff
///   there were prior failures.
/// - Failure increments the counter and always emits
///   [`FeedNotice::RunFailed`]; reaching `threshold` additionally
///   disables the feed, clears `next_run_at`, and emits
///   [`FeedNotice::AutoDisabled`] on that crossing.
pub fn apply_outcome(
    prior_consecutive_failures: u32,
    outcome: RunOutcome,
    completed_at: DateTime<Utc>,
    schedule_interval: Duration,
    threshold: u32,
) -> PolicyDecision {
    match outcome {
        RunOutcome::Succeeded => PolicyDecision {
            consecutive_failures: 0,
            auto_disabled: false,
            next_run_at: Some(completed_at + schedule_interval),
            notices: if prior_consecutive_failures > 0 {
                vec![FeedNotice::Recovery]
            } else {
                Vec::new()
            },
        },
        RunOutcome::Failed => {
            let new_count = prior_consecutive_failures + 1;
            let auto_disabled = new_count >= threshold;
            let mut notices = vec![FeedNotice::RunFailed];
            if auto_disabled {
                notices.push(FeedNotice::AutoDisabled);
            }
            PolicyDecision {
                consecutive_failures: new_count,
                auto_disabled,
                next_run_at: if auto_disabled {
                    None
                } else {
                    Some(completed_at + schedule_interval)
                },
                notices,
            }
        }
    }
}

/// Health classification from one run's row counts.
///
/// reject ratio > 0.5 ⇒ Failed; quarantine ratio > 0.3 or reject
/// ratio > 0.1 ⇒ Warning; else Healthy. A run with no rows is Healthy.
pub fn health_for(indexed: u32, quarantined: u32, rejected: u32, total_rows: u32) -> FeedHealth {
    let reject_ratio = if total_rows > 0 {
        rejected as f64 / total_rows as f64
    } else {
        0.0
    };
    let classified = indexed + quarantined;
    let quarantine_ratio = if classified > 0 {
        quarantined as f64 / classified as f64
    } else {
        0.0
    };

    if reject_ratio > 0.5 {
        FeedHealth::Failed
    } else if quarantine_ratio > 0.3 || reject_ratio > 0.1 {
        FeedHealth::Warning
    } else {
        FeedHealth::Healthy
    }
}

/// Notice for a health transition, if the transition warrants one.
///
/// Entering Warning notifies once per entry; leaving Warning/Failed for
/// Healthy notifies recovery. Failed itself is reported through the
/// failure policy's RunFailed notice, not here.
pub fn health_transition_notice(previous: FeedHealth, new: FeedHealth) -> Option<FeedNotice> {
    match (previous, new) {
        (FeedHealth::Warning, FeedHealth::Warning) => None,
        (_, FeedHealth::Warning) => Some(FeedNotice::Warning),
        (FeedHealth::Warning | FeedHealth::Failed, FeedHealth::Healthy) => {
            Some(FeedNotice::Recovery)
        }
        _ => None,
    }
}
