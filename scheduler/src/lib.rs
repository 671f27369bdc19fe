//! Drift-aware interval scheduler for capture sessions.
//!
//! One control loop per session fires ticks on a monotonic cadence,
//! invokes the capture callback, and hands each artifact to the sync
//! intake. Wall-clock jumps are detected by comparing wall and monotonic
//! deltas; they reset the drift accumulator but never trigger catch-up
//! ticks.

mod clock;
mod config;
mod scheduler;
mod stats;

pub use clock::SteppableClock;
pub use clock::SystemClock;
pub use clock::WallClock;
pub use config::DriftLogPolicy;
pub use config::SchedulerConfig;
pub use scheduler::IntervalScheduler;
pub use scheduler::SessionReport;
pub use stats::TimingStats;

use async_trait::async_trait;
use cinepi_protocol::{ArtifactRef, InvalidTransition, ScheduledTick};

pub const MIN_INTERVAL_SECS: u64 = 1;
pub const MAX_INTERVAL_SECS: u64 = 3600;

/// Failure reported by the capture callback.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CaptureError {
    /// Momentary problem (device busy, timeout); the session continues.
    #[error("transient capture failure: {0}")]
    Transient(String),

    /// The session cannot continue (device gone, disk full).
    #[error("fatal capture failure: {0}")]
    Fatal(String),
}

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("interval must be between {MIN_INTERVAL_SECS} and {MAX_INTERVAL_SECS} seconds, got {0}")]
    InvalidInterval(u64),

    #[error("a valid device lock is required to start a session")]
    LockNotHeld,

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),
}

/// Produces one artifact now. Hardware access lives behind this.
#[async_trait]
pub trait CaptureCallback: Send + Sync {
    async fn capture(&self, tick: &ScheduledTick) -> Result<ArtifactRef, CaptureError>;
}

/// Receives artifacts from successful ticks (the sync intake).
#[async_trait]
pub trait ArtifactSink: Send + Sync {
    async fn hand_off(&self, artifact: ArtifactRef);
}

/// Sink used when sync is disabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardSink;

#[async_trait]
impl ArtifactSink for DiscardSink {
    async fn hand_off(&self, artifact: ArtifactRef) {
        tracing::debug!(path = %artifact.path.display(), "Sync disabled; artifact kept local only");
    }
}
