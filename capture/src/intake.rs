//! Bridges scheduler output into the upload queue.

use async_trait::async_trait;
use cinepi_protocol::ArtifactRef;
use cinepi_scheduler::ArtifactSink;
use cinepi_sync::{SyncError, SyncPipeline};

/// Hands captured frames to the sync pipeline without ever blocking the
/// capture cadence. A full queue leaves the frame on disk for the next
/// `sync-backlog` run.
#[derive(Clone)]
pub struct PipelineSink {
    pipeline: SyncPipeline,
}

impl PipelineSink {
    pub fn new(pipeline: SyncPipeline) -> Self {
        Self { pipeline }
    }
}

#[async_trait]
impl ArtifactSink for PipelineSink {
    async fn hand_off(&self, artifact: ArtifactRef) {
        match self.pipeline.try_enqueue(&artifact) {
            Ok(task) => {
                tracing::debug!(task = %task.id, path = %artifact.path.display(), "Queued for upload");
            }
            Err(SyncError::QueueFull) => {
                tracing::warn!(
                    path = %artifact.path.display(),
                    "Upload queue full; frame left for backlog sync"
                );
            }
            Err(e) => {
                tracing::warn!(error = %e, path = %artifact.path.display(), "Failed to queue upload");
            }
        }
    }
}
