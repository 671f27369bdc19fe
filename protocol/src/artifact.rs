use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A locally persisted capture, as returned by the capture callback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub path: PathBuf,
    /// Sequence number of the tick that produced it.
    pub sequence_number: u64,
    pub captured_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
}

impl ArtifactRef {
    pub fn new(path: impl Into<PathBuf>, sequence_number: u64) -> Self {
        Self {
            path: path.into(),
            sequence_number,
            captured_at: Utc::now(),
            size_bytes: None,
        }
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}
