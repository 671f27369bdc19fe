//! Retry and chunking policy shared by the worker pool and backlog runs.

use crate::error::SyncError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff, attempt and chunking knobs in one place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts per task, the first one included.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound of the random extra delay, as a fraction of the backoff.
    pub jitter_fraction: f64,
    pub chunk_size: usize,
    pub chunk_delay: Duration,
    /// A backlog chunk aborts once its failure ratio exceeds this.
    pub fail_fast_threshold: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter_fraction: 0.1,
            chunk_size: 100,
            chunk_delay: Duration::from_millis(100),
            fail_fast_threshold: 0.1,
        }
    }
}

impl RetryPolicy {
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.max_attempts == 0 {
            return Err(SyncError::InvalidPolicy("max_attempts must be at least 1".into()));
        }
        if self.chunk_size == 0 {
            return Err(SyncError::InvalidPolicy("chunk_size must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.jitter_fraction) {
            return Err(SyncError::InvalidPolicy(format!(
                "jitter_fraction must be within [0, 1], got {}",
                self.jitter_fraction
            )));
        }
        if !(self.fail_fast_threshold > 0.0 && self.fail_fast_threshold <= 1.0) {
            return Err(SyncError::InvalidPolicy(format!(
                "fail_fast_threshold must be within (0, 1], got {}",
                self.fail_fast_threshold
            )));
        }
        if self.base_delay > self.max_delay {
            return Err(SyncError::InvalidPolicy("base_delay exceeds max_delay".into()));
        }
        Ok(())
    }

    /// Backoff before retrying after the `failed_attempts`-th failure,
    /// without jitter: `min(max_delay, base_delay * 2^(n-1))`.
    pub fn backoff(&self, failed_attempts: u32) -> Duration {
        let exp = failed_attempts.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exp)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }

    /// [`Self::backoff`] plus a uniform jitter in `[0, jitter_fraction * backoff]`.
    pub fn retry_delay(&self, failed_attempts: u32) -> Duration {
        apply_jitter(self.backoff(failed_attempts), self.jitter_fraction)
    }

    /// Whether another attempt is allowed after `attempts` have been made.
    pub fn can_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    /// True once `failures` out of `chunk_len` crosses the fail-fast ratio.
    pub fn chunk_should_abort(&self, failures: usize, chunk_len: usize) -> bool {
        chunk_len > 0 && failures as f64 > self.fail_fast_threshold * chunk_len as f64
    }
}

fn apply_jitter(delay: Duration, jitter_fraction: f64) -> Duration {
    if jitter_fraction <= 0.0 || delay.is_zero() {
        return delay;
    }
    let extra = rand::rng().random_range(0.0..=jitter_fraction);
    delay + delay.mul_f64(extra)
}
