//! Upload error taxonomy and retry classification.

use cinepi_protocol::{TaskId, UploadStatus};
use std::time::Duration;

/// How the retry machinery should treat a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Network trouble or a 5xx; try again after a backoff.
    Retryable,
    /// The backend refused the upload; retrying cannot help.
    Permanent,
    /// Could not read the artifact locally. Terminal, but says nothing
    /// about the health of the backend.
    Local,
}

impl ErrorClass {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Retryable => "transient",
            Self::Permanent => "rejected",
            Self::Local => "fatal_local",
        }
    }
}

/// Classification hook used by the retry loops.
pub trait RetryClassifiable {
    fn classify(&self) -> ErrorClass;

    fn is_retryable(&self) -> bool {
        matches!(self.classify(), ErrorClass::Retryable)
    }

    /// Server-requested wait, if any (e.g. `Retry-After` on a 429).
    fn suggested_backoff(&self) -> Option<Duration>;
}

/// Why the backend refused an upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    Duplicate,
    Quota,
    Validation,
}

impl RejectReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Duplicate => "duplicate",
            Self::Quota => "quota",
            Self::Validation => "validation",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UploadError {
    #[error("transient upload failure: {message}")]
    Transient {
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("upload rejected ({}): {message}", reason.as_str())]
    Rejected {
        reason: RejectReason,
        message: String,
    },

    #[error("cannot read artifact: {0}")]
    Fatal(String),
}

impl UploadError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn rejected(reason: RejectReason, message: impl Into<String>) -> Self {
        Self::Rejected {
            reason,
            message: message.into(),
        }
    }
}

impl RetryClassifiable for UploadError {
    fn classify(&self) -> ErrorClass {
        match self {
            Self::Transient { .. } => ErrorClass::Retryable,
            Self::Rejected { .. } => ErrorClass::Permanent,
            Self::Fatal(_) => ErrorClass::Local,
        }
    }

    fn suggested_backoff(&self) -> Option<Duration> {
        match self {
            Self::Transient { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Errors from pipeline bookkeeping (not from individual uploads).
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("unknown upload task {0}")]
    UnknownTask(TaskId),

    #[error("task {id} is {} and cannot be replayed", status.as_str())]
    NotReplayable { id: TaskId, status: UploadStatus },

    #[error("upload queue is full")]
    QueueFull,

    #[error("upload queue is closed")]
    QueueClosed,

    #[error("invalid sync policy: {0}")]
    InvalidPolicy(String),

    #[error("HTTP client setup failed: {0}")]
    Client(#[from] reqwest::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
