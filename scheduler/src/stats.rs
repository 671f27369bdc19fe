use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

const HISTORY_LEN: usize = 100;

/// Running timing figures for one session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimingStats {
    /// Actual gaps between consecutive fires, newest last.
    #[serde(skip)]
    intervals: VecDeque<Duration>,
    #[serde(skip)]
    last_fire: Option<Instant>,
    /// Sum of tick drift since the last clock jump.
    pub accumulated_drift_ms: i64,
    pub max_abs_drift_ms: i64,
    pub clock_jumps: u64,
    pub drift_events: u32,
    pub skipped_slots: u64,
}

impl TimingStats {
    pub(crate) fn record_fire(&mut self, at: Instant, drift_ms: i64) {
        if let Some(prev) = self.last_fire.replace(at) {
            if self.intervals.len() == HISTORY_LEN {
                self.intervals.pop_front();
            }
            self.intervals.push_back(at.saturating_duration_since(prev));
        }
        self.accumulated_drift_ms += drift_ms;
        self.max_abs_drift_ms = self.max_abs_drift_ms.max(drift_ms.abs());
    }

    pub(crate) fn record_clock_jump(&mut self) {
        self.clock_jumps += 1;
        self.accumulated_drift_ms = 0;
    }

    pub fn average_interval(&self) -> Option<Duration> {
        let n = u32::try_from(self.intervals.len()).ok().filter(|n| *n > 0)?;
        Some(self.intervals.iter().sum::<Duration>() / n)
    }

    pub fn min_interval(&self) -> Option<Duration> {
        self.intervals.iter().min().copied()
    }

    pub fn max_interval(&self) -> Option<Duration> {
        self.intervals.iter().max().copied()
    }

    pub fn log_report(&self, session_id: &str) {
        let ms = |d: Option<Duration>| d.as_ref().map(Duration::as_millis).unwrap_or_default();
        tracing::info!(
            session = session_id,
            avg_interval_ms = ms(self.average_interval()) as u64,
            min_interval_ms = ms(self.min_interval()) as u64,
            max_interval_ms = ms(self.max_interval()) as u64,
            accumulated_drift_ms = self.accumulated_drift_ms,
            max_abs_drift_ms = self.max_abs_drift_ms,
            clock_jumps = self.clock_jumps,
            skipped_slots = self.skipped_slots,
            "Timing report"
        );
    }
}
