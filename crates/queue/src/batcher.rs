//! Micro-batch accumulator for job messages.
//!
//! Collects [`JobMessage`]s and flushes when either the size threshold
//! or time window is reached, whichever comes first. The match-batch
//! lane uses this to balance throughput against latency.

use std::time::{Duration, Instant};

use crate::consumer::JobMessage;

/// Accumulates job messages into micro-batches.
pub struct MicroBatcher {
    buffer: Vec<JobMessage>,
    max_size: usize,
    max_wait: Duration,
    batch_started: Option<Instant>,
}

impl MicroBatcher {
    /// Create a new batcher.
    ///
    /// - `max_size`: flush when this many messages are buffered.
    /// - `max_wait`: flush when this duration has elapsed since the
    ///   first message in the current batch was pushed.
    pub fn new(max_size: usize, max_wait: Duration) -> Self {
        Self {
            buffer: Vec::with_capacity(max_size),
            max_size,
            max_wait,
            batch_started: None,
        }
    }

    /// Add messages to the current batch. Starts the batch timer on the
    /// first non-empty push.
    pub fn push(&mut self, messages: Vec<JobMessage>) {
        if self.batch_started.is_none() && !messages.is_empty() {
            self.batch_started = Some(Instant::now());
        }
        self.buffer.extend(messages);
    }

    /// Whether the size or time threshold has been reached.
    pub fn should_flush(&self) -> bool {
        if self.buffer.is_empty() {
            return false;
        }
        if self.buffer.len() >= self.max_size {
            return true;
        }
        if let Some(started) = self.batch_started {
            if started.elapsed() >= self.max_wait {
                return true;
            }
        }
        false
    }

    /// Flush the current batch, returning all accumulated messages.
    pub fn flush(&mut self) -> Vec<JobMessage> {
        self.batch_started = None;
        std::mem::take(&mut self.buffer)
    }

    /// Flush only if thresholds are met, otherwise return `None`.
    pub fn try_flush(&mut self) -> Option<Vec<JobMessage>> {
        if self.should_flush() {
            Some(self.flush())
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn make_message(id: &str) -> JobMessage {
        JobMessage {
            id: id.to_string(),
            body: "{}".to_string(),
            receipt_handle: format!("handle-{id}"),
            timestamp: Utc::now(),
            attempt_count: 1,
        }
    }

    fn make_messages(count: usize) -> Vec<JobMessage> {
        (0..count).map(|i| make_message(&format!("m{i}"))).collect()
    }

    #[test]
    fn flushes_at_size_threshold() {
        let mut batcher = MicroBatcher::new(3, Duration::from_secs(60));
        batcher.push(make_messages(2));
        assert!(!batcher.should_flush());
        batcher.push(make_messages(1));
        assert!(batcher.should_flush());
        assert_eq!(batcher.flush().len(), 3);
        assert!(batcher.is_empty());
    }

    #[test]
    fn flushes_after_time_window() {
        let mut batcher = MicroBatcher::new(100, Duration::from_millis(0));
        batcher.push(make_messages(1));
        assert!(batcher.should_flush());
    }

    #[test]
    fn empty_batcher_never_flushes() {
        let batcher = MicroBatcher::new(1, Duration::from_millis(0));
        assert!(!batcher.should_flush());
    }

    #[test]
    fn try_flush_returns_none_below_thresholds() {
        let mut batcher = MicroBatcher::new(10, Duration::from_secs(60));
        batcher.push(make_messages(2));
        assert!(batcher.try_flush().is_none());
        assert_eq!(batcher.len(), 2);
    }
}
