//! Job identity schemes for idempotent enqueue.
//!
//! Three schemes, all producing deduplication keys:
//! - windowed: periodic work collapses per (subject, time window)
//! - subject: per-record work collapses per subject regardless of time
//! - batch: downstream batches derived from one run collapse per
//!   (run, batch index) across retried enqueue steps
//!
//! Keys are plain `kind:subject:qualifier` strings — they stay readable
//! in queue consoles and fit SQS's 128-character dedup id limit.

use chrono::{DateTime, TimeZone, Utc};
use uuid::Uuid;

use crate::job::JobKind;

/// Truncate `now` down to the containing window boundary.
///
/// Windows are aligned to the Unix epoch, so every scheduling pass in
/// the same wall-clock window computes the same boundary.
pub fn window_start(now: DateTime<Utc>, window: chrono::Duration) -> DateTime<Utc> {
    let window_secs = window.num_seconds().max(1);
    let truncated = now.timestamp().div_euclid(window_secs) * window_secs;
    Utc.timestamp_opt(truncated, 0).single().unwrap_or(now)
}

/// Windowed identity: one unit of work per (subject, window).
pub fn windowed_key(
    kind: JobKind,
    subject: Uuid,
    now: DateTime<Utc>,
    window: chrono::Duration,
) -> String {
    let start = window_start(now, window);
    format!("{}:{}:{}", kind, subject, start.timestamp())
}

/// Subject identity: one pending unit of work per subject, no time
/// component.
pub fn subject_key(kind: JobKind, subject: Uuid) -> String {
    format!("{kind}:{subject}")
}

/// Batch identity: one unit per (run, batch index).
pub fn batch_key(run_id: Uuid, batch_index: u32) -> String {
    format!("{}:{}:{}", JobKind::MatchBatch, run_id, batch_index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, h, m, s).single().unwrap()
    }

    #[test]
    fn window_start_truncates_to_boundary() {
        let w = chrono::Duration::minutes(5);
        assert_eq!(window_start(at(10, 3, 59), w), at(10, 0, 0));
        assert_eq!(window_start(at(10, 5, 0), w), at(10, 5, 0));
        assert_eq!(window_start(at(10, 9, 59), w), at(10, 5, 0));
    }

    #[test]
    fn same_window_same_key() {
        let subject = Uuid::new_v4();
        let w = chrono::Duration::minutes(5);
        let a = windowed_key(JobKind::FeedRun, subject, at(10, 1, 0), w);
        let b = windowed_key(JobKind::FeedRun, subject, at(10, 4, 59), w);
        assert_eq!(a, b);
    }

    #[test]
    fn different_window_different_key() {
        let subject = Uuid::new_v4();
        let w = chrono::Duration::minutes(5);
        let a = windowed_key(JobKind::FeedRun, subject, at(10, 4, 59), w);
        let b = windowed_key(JobKind::FeedRun, subject, at(10, 5, 0), w);
        assert_ne!(a, b);
    }

    #[test]
    fn different_subject_different_key() {
        let w = chrono::Duration::minutes(5);
        let now = at(10, 1, 0);
        let a = windowed_key(JobKind::FeedRun, Uuid::new_v4(), now, w);
        let b = windowed_key(JobKind::FeedRun, Uuid::new_v4(), now, w);
        assert_ne!(a, b);
    }

    #[test]
    fn subject_key_has_no_time_component() {
        let subject = Uuid::new_v4();
        assert_eq!(
            subject_key(JobKind::AlertEvaluate, subject),
            subject_key(JobKind::AlertEvaluate, subject)
        );
    }

    #[test]
    fn batch_keys_differ_by_index() {
        let run = Uuid::new_v4();
        assert_ne!(batch_key(run, 0), batch_key(run, 1));
        assert_eq!(batch_key(run, 3), batch_key(run, 3));
    }

    #[test]
    fn two_hour_recompute_window() {
        let w = chrono::Duration::hours(2);
        let subject = Uuid::new_v4();
        let a = windowed_key(JobKind::Recompute, subject, at(10, 0, 0), w);
        let b = windowed_key(JobKind::Recompute, subject, at(11, 59, 59), w);
        let c = windowed_key(JobKind::Recompute, subject, at(12, 0, 0), w);
        assert_eq!(a, b);
        assert_ne!(b, c);
    }
}
