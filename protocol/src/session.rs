//! Capture session and tick records owned by the interval scheduler.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Idle,
    Running,
    Stopping,
    Stopped,
    Errored,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Errored => "errored",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Errored)
    }

    /// Sessions only move forward; a stopped session is never resurrected.
    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        matches!(
            (self, next),
            (Idle, Running)
                | (Running, Stopping)
                | (Stopping, Stopped)
                | (Idle | Running | Stopping, Errored)
        )
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid session transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: SessionStatus,
    pub to: SessionStatus,
}

/// One run of periodic capture.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureSession {
    pub id: String,
    pub interval_seconds: u64,
    /// Zero means unbounded.
    pub duration_limit_seconds: u64,
    pub started_at: Option<DateTime<Utc>>,
    tick_count: u64,
    status: SessionStatus,
}

impl CaptureSession {
    pub fn new(id: impl Into<String>, interval_seconds: u64, duration_limit_seconds: u64) -> Self {
        Self {
            id: id.into(),
            interval_seconds,
            duration_limit_seconds,
            started_at: None,
            tick_count: 0,
            status: SessionStatus::Idle,
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }

    pub fn transition(&mut self, next: SessionStatus) -> Result<(), InvalidTransition> {
        if !self.status.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        if next == SessionStatus::Running {
            self.started_at = Some(Utc::now());
        }
        self.status = next;
        Ok(())
    }

    /// Bump the tick counter and return the new sequence number.
    pub fn record_tick(&mut self) -> u64 {
        self.tick_count += 1;
        self.tick_count
    }
}

/// One scheduling decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledTick {
    pub sequence_number: u64,
    /// Ideal fire time.
    pub scheduled_at: DateTime<Utc>,
    /// Actual fire time.
    pub fired_at: DateTime<Utc>,
    /// `fired_at - scheduled_at` measured on the monotonic clock.
    pub drift_ms: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn stopped_session_cannot_restart() {
        let mut session = CaptureSession::new("s1", 10, 30);
        assert!(session.transition(SessionStatus::Running).is_ok());
        assert!(session.started_at.is_some());
        assert!(session.transition(SessionStatus::Stopping).is_ok());
        assert!(session.transition(SessionStatus::Stopped).is_ok());

        let err = session.transition(SessionStatus::Running);
        assert_eq!(
            err,
            Err(InvalidTransition {
                from: SessionStatus::Stopped,
                to: SessionStatus::Running,
            })
        );
    }

    #[test]
    fn errored_is_reachable_from_every_live_state() {
        for from in [
            SessionStatus::Idle,
            SessionStatus::Running,
            SessionStatus::Stopping,
        ] {
            assert!(from.can_transition_to(SessionStatus::Errored), "{from}");
        }
        assert!(!SessionStatus::Stopped.can_transition_to(SessionStatus::Errored));
        assert!(!SessionStatus::Idle.can_transition_to(SessionStatus::Stopping));
    }

    #[test]
    fn tick_count_is_monotonic() {
        let mut session = CaptureSession::new("s1", 1, 0);
        let seqs: Vec<u64> = (0..3).map(|_| session.record_tick()).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert_eq!(session.tick_count(), 3);
    }
}
