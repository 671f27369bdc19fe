use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::time::Instant;

/// Source of wall-clock time. Monotonic time always comes from tokio.
pub trait WallClock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl WallClock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Wall clock that tracks tokio's clock and can be stepped, the way an NTP
/// correction steps the real one.
#[derive(Debug)]
pub struct SteppableClock {
    base: DateTime<Utc>,
    origin: Instant,
    offset_ms: AtomicI64,
}

impl SteppableClock {
    pub fn new(base: DateTime<Utc>) -> Self {
        Self {
            base,
            origin: Instant::now(),
            offset_ms: AtomicI64::new(0),
        }
    }

    /// Step the clock by `delta_ms` (negative steps backwards).
    pub fn step(&self, delta_ms: i64) {
        self.offset_ms.fetch_add(delta_ms, Ordering::SeqCst);
    }
}

impl WallClock for SteppableClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = ChronoDuration::from_std(self.origin.elapsed()).unwrap_or(ChronoDuration::zero());
        self.base + elapsed + ChronoDuration::milliseconds(self.offset_ms.load(Ordering::SeqCst))
    }
}
