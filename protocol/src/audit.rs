//! Append-only audit trail shared by every component.
//!
//! Records are immutable once appended. Retention and deletion are handled
//! outside this process.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::{Mutex, PoisonError};

/// Lifecycle event recorded in the audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    LockAcquired,
    LockBusy,
    LockTimeout,
    LockReclaimed,
    LockReleased,
    LockCorrupt,
    SessionStarted,
    TickDrift,
    ClockJump,
    CaptureFailed,
    SessionStopped,
    SessionErrored,
    UploadAttempt,
    UploadSkipped,
    ChunkAborted,
}

impl AuditKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LockAcquired => "lock_acquired",
            Self::LockBusy => "lock_busy",
            Self::LockTimeout => "lock_timeout",
            Self::LockReclaimed => "lock_reclaimed",
            Self::LockReleased => "lock_released",
            Self::LockCorrupt => "lock_corrupt",
            Self::SessionStarted => "session_started",
            Self::TickDrift => "tick_drift",
            Self::ClockJump => "clock_jump",
            Self::CaptureFailed => "capture_failed",
            Self::SessionStopped => "session_stopped",
            Self::SessionErrored => "session_errored",
            Self::UploadAttempt => "upload_attempt",
            Self::UploadSkipped => "upload_skipped",
            Self::ChunkAborted => "chunk_aborted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "lock_acquired" => Self::LockAcquired,
            "lock_busy" => Self::LockBusy,
            "lock_timeout" => Self::LockTimeout,
            "lock_reclaimed" => Self::LockReclaimed,
            "lock_released" => Self::LockReleased,
            "lock_corrupt" => Self::LockCorrupt,
            "session_started" => Self::SessionStarted,
            "tick_drift" => Self::TickDrift,
            "clock_jump" => Self::ClockJump,
            "capture_failed" => Self::CaptureFailed,
            "session_stopped" => Self::SessionStopped,
            "session_errored" => Self::SessionErrored,
            "upload_attempt" => Self::UploadAttempt,
            "upload_skipped" => Self::UploadSkipped,
            "chunk_aborted" => Self::ChunkAborted,
            _ => return None,
        })
    }
}

impl std::fmt::Display for AuditKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditOutcome {
    Success,
    Failure,
    /// Informational events (drift, clock jumps, reclamation).
    Info,
}

impl AuditOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Info => "info",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(Self::Success),
            "failure" => Some(Self::Failure),
            "info" => Some(Self::Info),
            _ => None,
        }
    }
}

/// One immutable audit entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub kind: AuditKind,
    /// Artifact id, content hash, lock holder id or session id.
    pub subject_id: String,
    pub outcome: AuditOutcome,
    #[serde(default)]
    pub details: Map<String, Value>,
}

impl AuditRecord {
    pub fn new(kind: AuditKind, subject_id: impl Into<String>, outcome: AuditOutcome) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
            subject_id: subject_id.into(),
            outcome,
            details: Map::new(),
        }
    }

    pub fn with_detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }

    pub fn detail_str(&self, key: &str) -> Option<&str> {
        self.details.get(key).and_then(Value::as_str)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("audit storage error: {0}")]
    Storage(String),

    #[error("audit serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("audit I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Destination for audit records. Implementations must be append-only.
pub trait AuditSink: Send + Sync {
    fn append(&self, record: &AuditRecord) -> Result<(), AuditError>;
}

/// An audit sink that can answer "was this content already delivered?".
///
/// The sync pipeline treats this as the source of truth for upload
/// idempotency, independent of any in-memory task state.
pub trait UploadLedger: AuditSink {
    fn has_successful_upload(&self, content_hash: &str) -> Result<bool, AuditError>;
}

/// In-process sink used for dry runs and tests.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn count(&self, kind: AuditKind) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|r| r.kind == kind)
            .count()
    }
}

impl AuditSink for MemoryAuditSink {
    fn append(&self, record: &AuditRecord) -> Result<(), AuditError> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record.clone());
        Ok(())
    }
}

impl UploadLedger for MemoryAuditSink {
    fn has_successful_upload(&self, content_hash: &str) -> Result<bool, AuditError> {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(records.iter().any(|r| {
            r.kind == AuditKind::UploadAttempt
                && r.outcome == AuditOutcome::Success
                && r.subject_id == content_hash
        }))
    }
}
