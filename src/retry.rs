//! Retry policy with exponential backoff
//!
//! The policy advises the scheduler; it never retries anything itself.
//! The delay before attempt `n` (zero-based) is `min(base * 2^n, cap)`.
//! A RETRYING item carries its next-eligible instant on the record so the
//! backoff clock can be inspected by clients.

use crate::config::RetryConfig;
use crate::types::QueueItem;
use chrono::{DateTime, TimeDelta, Utc};

/// Scheduler-facing retry policy
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    base_seconds: f64,
    cap_seconds: f64,
}

impl RetryPolicy {
    /// Build a policy from configuration
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            base_seconds: config.base_seconds,
            cap_seconds: config.cap_seconds,
        }
    }

    /// Whether the item may be attempted again right now
    ///
    /// True iff the retry budget is not exhausted AND either no retry clock
    /// is set or the wall clock is past it.
    pub fn should_retry(&self, item: &QueueItem) -> bool {
        self.should_retry_at(item, Utc::now())
    }

    /// Clock-injected variant of [`should_retry`](Self::should_retry)
    pub fn should_retry_at(&self, item: &QueueItem, now: DateTime<Utc>) -> bool {
        if item.retry_count >= item.max_retries {
            return false;
        }
        match item.next_attempt_at {
            Some(next) => now >= next,
            None => true,
        }
    }

    /// Whether the retry budget allows another attempt, ignoring the clock
    ///
    /// Used at failure time to decide between RETRYING and FAILED; the clock
    /// only matters at admission.
    pub fn has_budget(&self, item: &QueueItem) -> bool {
        item.retry_count < item.max_retries
    }

    /// Delay applied before the attempt following `retry_count` failures
    pub fn delay_seconds(&self, retry_count: u32) -> f64 {
        let exp = self.base_seconds * 2_f64.powi(retry_count.min(62) as i32);
        exp.min(self.cap_seconds)
    }

    /// Schedule the next attempt on the item
    ///
    /// Sets `next_attempt_at` to `now + min(base * 2^retry_count, cap)` and
    /// increments `retry_count`. Does not touch the status; the scheduler
    /// owns that transition.
    pub fn schedule_retry(&self, item: &mut QueueItem) {
        self.schedule_retry_at(item, Utc::now());
    }

    /// Clock-injected variant of [`schedule_retry`](Self::schedule_retry)
    pub fn schedule_retry_at(&self, item: &mut QueueItem, now: DateTime<Utc>) {
        let delay = self.delay_seconds(item.retry_count);
        let delta = TimeDelta::milliseconds((delay * 1000.0) as i64);
        item.next_attempt_at = Some(now + delta);
        item.retry_count += 1;

        tracing::info!(
            item_id = %item.id,
            url = %item.url,
            delay_seconds = delay,
            attempt = item.retry_count,
            "Scheduled retry"
        );
    }
}
