use crate::{MAX_INTERVAL_SECS, MIN_INTERVAL_SECS, SchedulerError};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::Level;

/// How loudly drift and clock-jump events are logged.
///
/// The first `warn_limit` events of a session log at WARN, later ones at
/// INFO. `suppress` drops all of them to DEBUG.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriftLogPolicy {
    pub warn_limit: u32,
    pub suppress: bool,
}

impl Default for DriftLogPolicy {
    fn default() -> Self {
        Self {
            warn_limit: 3,
            suppress: false,
        }
    }
}

impl DriftLogPolicy {
    /// Level for the `nth` (1-based) drift event of a session.
    pub fn level_for(self, nth: u32) -> Level {
        if self.suppress {
            Level::DEBUG
        } else if nth <= self.warn_limit {
            Level::WARN
        } else {
            Level::INFO
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub interval: Duration,
    /// Zero means unbounded.
    pub duration_limit: Duration,
    /// Wall/monotonic divergence that counts as a clock jump.
    pub jump_threshold: Duration,
    /// Longest uninterrupted sleep; bounds shutdown latency.
    pub poll_slice: Duration,
    /// Tick lateness beyond this is logged and audited as drift.
    pub drift_tolerance: Duration,
    pub drift_policy: DriftLogPolicy,
    /// Consecutive transient capture failures before the session errors.
    pub max_consecutive_failures: u32,
    /// Log a progress line every this many ticks (0 disables).
    pub progress_every: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            duration_limit: Duration::ZERO,
            jump_threshold: Duration::from_millis(1000),
            poll_slice: Duration::from_millis(500),
            drift_tolerance: Duration::from_millis(250),
            drift_policy: DriftLogPolicy::default(),
            max_consecutive_failures: 5,
            progress_every: 10,
        }
    }
}

impl SchedulerConfig {
    pub fn new(interval_seconds: u64, duration_seconds: u64) -> Self {
        Self {
            interval: Duration::from_secs(interval_seconds),
            duration_limit: Duration::from_secs(duration_seconds),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), SchedulerError> {
        let secs = self.interval.as_secs();
        if self.interval.subsec_nanos() != 0 || !(MIN_INTERVAL_SECS..=MAX_INTERVAL_SECS).contains(&secs) {
            return Err(SchedulerError::InvalidInterval(secs));
        }
        Ok(())
    }

    /// Ticks a bounded session should fire: one at t=0 and one per interval
    /// strictly before the limit.
    pub fn planned_ticks(&self) -> Option<u64> {
        if self.duration_limit.is_zero() {
            return None;
        }
        let limit = self.duration_limit.as_millis();
        let step = self.interval.as_millis().max(1);
        u64::try_from(limit.div_ceil(step)).ok()
    }
}
