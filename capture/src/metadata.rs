//! JSONL capture ledger: one line per successful frame.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureMetadata {
    pub timestamp: DateTime<Local>,
    pub filename: String,
    pub capture_number: u64,
    pub drift_ms: i64,
    pub size_bytes: u64,
}

/// Appends [`CaptureMetadata`] lines to a file. Writes are serialized so
/// lines never interleave.
#[derive(Debug)]
pub struct MetadataLog {
    path: PathBuf,
    write: Mutex<()>,
}

impl MetadataLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(&self, entry: &CaptureMetadata) -> std::io::Result<()> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');

        let _guard = self.write.lock().await;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await
    }
}
