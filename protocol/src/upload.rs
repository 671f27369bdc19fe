//! Upload task records owned by the sync pipeline.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub u64);

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    Pending,
    InFlight,
    Succeeded,
    Failed,
    Cancelled,
}

impl UploadStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InFlight => "in_flight",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

/// One artifact queued for remote sync.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadTask {
    pub id: TaskId,
    pub artifact_path: PathBuf,
    pub size_bytes: u64,
    /// Number of upload attempts made so far.
    pub attempt: u32,
    pub status: UploadStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// SHA-256 of the artifact bytes, filled in on the first attempt.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    /// True when the ledger already held a success for this content.
    #[serde(default)]
    pub deduplicated: bool,
}

impl UploadTask {
    pub fn new(id: TaskId, artifact_path: PathBuf, size_bytes: u64) -> Self {
        Self {
            id,
            artifact_path,
            size_bytes,
            attempt: 0,
            status: UploadStatus::Pending,
            last_error: None,
            content_hash: None,
            deduplicated: false,
        }
    }
}
