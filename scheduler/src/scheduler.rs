use crate::clock::{SystemClock, WallClock};
use crate::config::SchedulerConfig;
use crate::stats::TimingStats;
use crate::{ArtifactSink, CaptureCallback, CaptureError, DiscardSink, SchedulerError};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use cinepi_async_utils::sleep_until_sliced;
use cinepi_lock::LockHandle;
use cinepi_protocol::{
    AuditKind, AuditOutcome, AuditRecord, AuditSink, CaptureSession, ScheduledTick, SessionStatus,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Level;

/// Emit at a level chosen at runtime.
macro_rules! log_at {
    ($level:expr, $($arg:tt)+) => {
        let level: Level = $level;
        if level == Level::WARN {
            tracing::warn!($($arg)+);
        } else if level == Level::INFO {
            tracing::info!($($arg)+);
        } else {
            tracing::debug!($($arg)+);
        }
    };
}

/// Why the loop left `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    OperatorStop,
    DurationExhausted,
}

impl StopReason {
    fn as_str(self) -> &'static str {
        match self {
            Self::OperatorStop => "operator_stop",
            Self::DurationExhausted => "duration_exhausted",
        }
    }
}

/// Outcome of a finished session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub session_id: String,
    pub status: SessionStatus,
    pub ticks: u64,
    pub expected_ticks: u64,
    pub captures_ok: u64,
    pub capture_failures: u64,
    pub elapsed_ms: u64,
    pub stop_reason: Option<String>,
    pub error: Option<String>,
    pub last_tick: Option<ScheduledTick>,
    pub timing: TimingStats,
}

impl SessionReport {
    pub fn is_success(&self) -> bool {
        self.status == SessionStatus::Stopped
    }
}

/// Wall/monotonic pair taken at the last clock observation.
struct ClockSample {
    mono: Instant,
    wall: DateTime<Utc>,
}

pub struct IntervalScheduler {
    config: SchedulerConfig,
    capture: Arc<dyn CaptureCallback>,
    sink: Arc<dyn ArtifactSink>,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn WallClock>,
    session: CaptureSession,
    stats: TimingStats,
    captures_ok: u64,
    capture_failures: u64,
    consecutive_failures: u32,
    last_tick: Option<ScheduledTick>,
}

impl IntervalScheduler {
    pub fn new(
        config: SchedulerConfig,
        capture: Arc<dyn CaptureCallback>,
        audit: Arc<dyn AuditSink>,
    ) -> Result<Self, SchedulerError> {
        config.validate()?;
        let session = CaptureSession::new(
            uuid::Uuid::new_v4().to_string(),
            config.interval.as_secs(),
            config.duration_limit.as_secs(),
        );
        Ok(Self {
            config,
            capture,
            sink: Arc::new(DiscardSink),
            audit,
            clock: Arc::new(SystemClock),
            session,
            stats: TimingStats::default(),
            captures_ok: 0,
            capture_failures: 0,
            consecutive_failures: 0,
            last_tick: None,
        })
    }

    pub fn with_sink(mut self, sink: Arc<dyn ArtifactSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_wall_clock(mut self, clock: Arc<dyn WallClock>) -> Self {
        self.clock = clock;
        self
    }

    /// Run the session to completion.
    ///
    /// `lock` must be a live handle on the capture device; the scheduler
    /// never acquires it itself, and re-checks it before every tick.
    /// Cancelling `cancel` stops the loop within one poll slice. A session
    /// that ends `Errored` is reported through [`SessionReport`], except when
    /// the lock is lost mid-session: that ends `Errored` as well but returns
    /// [`SchedulerError::LockNotHeld`].
    pub async fn run(
        mut self,
        lock: &LockHandle,
        cancel: CancellationToken,
    ) -> Result<SessionReport, SchedulerError> {
        if !lock.is_valid() {
            return Err(SchedulerError::LockNotHeld);
        }
        self.session.transition(SessionStatus::Running)?;

        let interval = self.config.interval;
        let slice = self.config.poll_slice;
        let start = Instant::now();
        let mut next_fire = start;
        let mut sample = ClockSample {
            mono: start,
            wall: self.clock.now(),
        };

        tracing::info!(
            session = %self.session.id,
            interval_secs = interval.as_secs(),
            duration_secs = self.config.duration_limit.as_secs(),
            planned_ticks = self.config.planned_ticks(),
            lock_holder = lock.holder_id(),
            "Capture session started"
        );
        self.emit(
            AuditRecord::new(AuditKind::SessionStarted, self.session.id.clone(), AuditOutcome::Info)
                .with_detail("interval_secs", interval.as_secs())
                .with_detail("duration_secs", self.config.duration_limit.as_secs())
                .with_detail("lock_holder", lock.holder_id()),
        );

        let mut lock_lost = false;
        let outcome: Result<StopReason, String> = loop {
            // Stop requests are honoured at the top of every cycle.
            if cancel.is_cancelled() {
                break Ok(StopReason::OperatorStop);
            }
            if !self.config.duration_limit.is_zero()
                && next_fire.saturating_duration_since(start) >= self.config.duration_limit
            {
                break Ok(StopReason::DurationExhausted);
            }

            let waited = sleep_until_sliced(next_fire, slice, &cancel, || {
                self.observe_clocks(&mut sample);
                true
            })
            .await;
            if waited.is_err() {
                break Ok(StopReason::OperatorStop);
            }
            self.observe_clocks(&mut sample);

            if !lock.is_valid() {
                lock_lost = true;
                break Err(format!("device lock {} no longer held", lock.lock_path().display()));
            }
            if let Err(reason) = self.fire(next_fire, start).await {
                break Err(reason);
            }

            next_fire += interval;
            self.skip_missed_slots(&mut next_fire, interval);
        };

        let elapsed = start.elapsed();
        let (stop_reason, error) = match outcome {
            Ok(reason) => {
                self.session.transition(SessionStatus::Stopping)?;
                // Ticks run sequentially, so the last artifact has already
                // been handed off by the time we get here.
                self.session.transition(SessionStatus::Stopped)?;
                tracing::info!(
                    session = %self.session.id,
                    reason = reason.as_str(),
                    ticks = self.session.tick_count(),
                    "Capture session stopped"
                );
                self.emit(
                    AuditRecord::new(AuditKind::SessionStopped, self.session.id.clone(), AuditOutcome::Success)
                        .with_detail("reason", reason.as_str())
                        .with_detail("ticks", self.session.tick_count()),
                );
                (Some(reason.as_str().to_string()), None)
            }
            Err(message) => {
                self.session.transition(SessionStatus::Errored)?;
                tracing::error!(session = %self.session.id, error = %message, "Capture session errored");
                self.emit(
                    AuditRecord::new(AuditKind::SessionErrored, self.session.id.clone(), AuditOutcome::Failure)
                        .with_detail("error", message.clone())
                        .with_detail("ticks", self.session.tick_count()),
                );
                (None, Some(message))
            }
        };

        self.stats.log_report(&self.session.id);
        if lock_lost {
            return Err(SchedulerError::LockNotHeld);
        }
        let expected_ticks = self.config.planned_ticks().unwrap_or_else(|| {
            let step = interval.as_millis().max(1);
            u64::try_from(elapsed.as_millis() / step + 1).unwrap_or(u64::MAX)
        });

        Ok(SessionReport {
            session_id: self.session.id.clone(),
            status: self.session.status(),
            ticks: self.session.tick_count(),
            expected_ticks,
            captures_ok: self.captures_ok,
            capture_failures: self.capture_failures,
            elapsed_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            stop_reason,
            error,
            last_tick: self.last_tick,
            timing: self.stats,
        })
    }

    /// Fire one tick. `Err` carries the reason the session must error.
    async fn fire(&mut self, scheduled: Instant, start: Instant) -> Result<(), String> {
        let fired = Instant::now();
        let drift_ms = signed_millis(fired, scheduled);
        let sequence_number = self.session.record_tick();
        let fired_at = self.clock.now();
        let tick = ScheduledTick {
            sequence_number,
            scheduled_at: fired_at - ChronoDuration::milliseconds(drift_ms),
            fired_at,
            drift_ms,
        };
        self.stats.record_fire(fired, drift_ms);

        if drift_ms.unsigned_abs() > duration_millis(self.config.drift_tolerance) {
            self.stats.drift_events += 1;
            let level = self.config.drift_policy.level_for(self.stats.drift_events);
            log_at!(
                level,
                session = %self.session.id,
                sequence_number,
                drift_ms,
                "Tick fired late"
            );
            self.emit(
                AuditRecord::new(AuditKind::TickDrift, self.session.id.clone(), AuditOutcome::Info)
                    .with_detail("sequence_number", sequence_number)
                    .with_detail("drift_ms", drift_ms),
            );
        }

        let result = self.capture.capture(&tick).await;
        self.last_tick = Some(tick);

        match result {
            Ok(artifact) => {
                self.captures_ok += 1;
                self.consecutive_failures = 0;
                tracing::debug!(sequence_number, path = %artifact.path.display(), "Captured");
                self.sink.hand_off(artifact).await;
            }
            Err(CaptureError::Transient(message)) => {
                self.capture_failures += 1;
                self.consecutive_failures += 1;
                tracing::warn!(
                    sequence_number,
                    consecutive = self.consecutive_failures,
                    error = %message,
                    "Capture failed"
                );
                self.emit(
                    AuditRecord::new(AuditKind::CaptureFailed, self.session.id.clone(), AuditOutcome::Failure)
                        .with_detail("sequence_number", sequence_number)
                        .with_detail("fatal", false)
                        .with_detail("error", message.clone()),
                );
                if self.consecutive_failures >= self.config.max_consecutive_failures {
                    return Err(format!(
                        "{} consecutive capture failures, last: {message}",
                        self.consecutive_failures
                    ));
                }
            }
            Err(CaptureError::Fatal(message)) => {
                self.capture_failures += 1;
                self.emit(
                    AuditRecord::new(AuditKind::CaptureFailed, self.session.id.clone(), AuditOutcome::Failure)
                        .with_detail("sequence_number", sequence_number)
                        .with_detail("fatal", true)
                        .with_detail("error", message.clone()),
                );
                return Err(format!("fatal capture failure: {message}"));
            }
        }

        let every = self.config.progress_every;
        if every > 0 && sequence_number % every == 0 {
            tracing::info!(
                session = %self.session.id,
                ticks = sequence_number,
                failures = self.capture_failures,
                elapsed_secs = start.elapsed().as_secs(),
                avg_interval_ms = self.stats.average_interval().map(duration_millis),
                "Capture progress"
            );
        }
        Ok(())
    }

    /// If we are a whole interval or more behind (suspend, slow capture),
    /// drop the missed slots instead of firing them back to back.
    fn skip_missed_slots(&mut self, next_fire: &mut Instant, interval: Duration) {
        let now = Instant::now();
        if now < *next_fire + interval {
            return;
        }
        let behind = now.saturating_duration_since(*next_fire);
        let missed = u32::try_from(behind.as_nanos() / interval.as_nanos().max(1)).unwrap_or(u32::MAX);
        *next_fire += interval * missed;
        self.stats.skipped_slots += u64::from(missed);
        tracing::warn!(
            session = %self.session.id,
            missed,
            "Fell behind schedule; skipping missed slots"
        );
    }

    /// Compare wall and monotonic progress since the last observation.
    fn observe_clocks(&mut self, sample: &mut ClockSample) {
        let mono = Instant::now();
        let wall = self.clock.now();
        let mono_delta = signed_millis(mono, sample.mono);
        let wall_delta = (wall - sample.wall).num_milliseconds();
        sample.mono = mono;
        sample.wall = wall;

        let skew_ms = wall_delta - mono_delta;
        if skew_ms.unsigned_abs() <= duration_millis(self.config.jump_threshold) {
            return;
        }

        self.stats.record_clock_jump();
        self.stats.drift_events += 1;
        let level = self.config.drift_policy.level_for(self.stats.drift_events);
        log_at!(
            level,
            session = %self.session.id,
            skew_ms,
            "Wall clock jumped; drift counter reset"
        );
        self.emit(
            AuditRecord::new(AuditKind::ClockJump, self.session.id.clone(), AuditOutcome::Info)
                .with_detail("skew_ms", skew_ms)
                .with_detail("wall_delta_ms", wall_delta)
                .with_detail("monotonic_delta_ms", mono_delta),
        );
    }

    fn emit(&self, record: AuditRecord) {
        if let Err(e) = self.audit.append(&record) {
            tracing::warn!(kind = record.kind.as_str(), error = %e, "Failed to append audit record");
        }
    }
}

fn duration_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// `a - b` in milliseconds, negative when `a` is earlier.
fn signed_millis(a: Instant, b: Instant) -> i64 {
    if a >= b {
        i64::try_from((a - b).as_millis()).unwrap_or(i64::MAX)
    } else {
        -i64::try_from((b - a).as_millis()).unwrap_or(i64::MAX)
    }
}
