//! Capture callback that shells out to a still-capture command.
//!
//! The command line comes from `capture.command`; every `{output}` in it is
//! replaced with the target path. A frame counts as captured only when the
//! command exits zero and left a non-empty file behind.

use crate::config::CaptureConfig;
use crate::metadata::{CaptureMetadata, MetadataLog};
use crate::naming::FrameNamer;
use crate::storage::{self, StorageError};
use async_trait::async_trait;
use chrono::Local;
use cinepi_protocol::{ArtifactRef, ScheduledTick};
use cinepi_scheduler::{CaptureCallback, CaptureError};
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

const OUTPUT_PLACEHOLDER: &str = "{output}";
const STDERR_TAIL_CHARS: usize = 400;

pub struct CommandCapture {
    argv: Vec<String>,
    timeout: Duration,
    namer: FrameNamer,
    output_dir: PathBuf,
    min_free_space_mb: u64,
    metadata: MetadataLog,
}

impl CommandCapture {
    pub fn from_config(config: &CaptureConfig) -> Self {
        Self {
            argv: config.capture.command.clone(),
            timeout: Duration::from_secs(config.capture.timeout_seconds),
            namer: FrameNamer::from_config(&config.timelapse),
            output_dir: config.timelapse.output_dir.clone(),
            min_free_space_mb: config.timelapse.min_free_space_mb,
            metadata: MetadataLog::new(config.metadata_path()),
        }
    }

    fn command_line(&self, output: &Path) -> Vec<String> {
        let output = output.to_string_lossy();
        self.argv
            .iter()
            .map(|arg| arg.replace(OUTPUT_PLACEHOLDER, &output))
            .collect()
    }

    async fn run_command(&self, output: &Path) -> Result<(), CaptureError> {
        let argv = self.command_line(output);
        let Some((program, args)) = argv.split_first() else {
            return Err(CaptureError::Fatal("capture command is empty".to_string()));
        };

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| spawn_error(program, e))?;

        // Dropping the future on timeout kills the child.
        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Err(_) => {
                return Err(CaptureError::Transient(format!(
                    "{program} timed out after {}s",
                    self.timeout.as_secs()
                )));
            }
            Ok(Err(e)) => return Err(CaptureError::Transient(format!("{program} wait failed: {e}"))),
            Ok(Ok(output)) => output,
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CaptureError::Transient(format!(
                "{program} exited with {}: {}",
                output.status,
                stderr_tail(&stderr)
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl CaptureCallback for CommandCapture {
    async fn capture(&self, tick: &ScheduledTick) -> Result<ArtifactRef, CaptureError> {
        match storage::check_free_space(&self.output_dir, self.min_free_space_mb) {
            Ok(_) => {}
            Err(e @ StorageError::LowSpace { .. }) => return Err(CaptureError::Fatal(e.to_string())),
            Err(e) => tracing::warn!(error = %e, "Free space check failed"),
        }

        let captured_at = tick.fired_at.with_timezone(&Local);
        let path = self
            .namer
            .path_for(tick.sequence_number, captured_at)
            .map_err(|e| CaptureError::Fatal(format!("cannot prepare output directory: {e}")))?;

        self.run_command(&path).await?;

        let size_bytes = match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.len() > 0 => meta.len(),
            Ok(_) => {
                return Err(CaptureError::Transient(format!(
                    "capture produced an empty file at {}",
                    path.display()
                )));
            }
            Err(e) => {
                return Err(CaptureError::Transient(format!(
                    "capture produced no file at {}: {e}",
                    path.display()
                )));
            }
        };

        let artifact = ArtifactRef {
            path,
            sequence_number: tick.sequence_number,
            captured_at: tick.fired_at,
            size_bytes: Some(size_bytes),
        };

        let entry = CaptureMetadata {
            timestamp: captured_at,
            filename: artifact.file_name(),
            capture_number: tick.sequence_number,
            drift_ms: tick.drift_ms,
            size_bytes,
        };
        if let Err(e) = self.metadata.append(&entry).await {
            tracing::warn!(error = %e, path = %self.metadata.path().display(), "Failed to append capture metadata");
        }

        tracing::info!(
            seq = tick.sequence_number,
            file = %artifact.file_name(),
            size_bytes,
            "Frame captured"
        );
        Ok(artifact)
    }
}

/// A missing or non-executable capture binary will not fix itself.
fn spawn_error(program: &str, e: io::Error) -> CaptureError {
    match e.kind() {
        io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied => {
            CaptureError::Fatal(format!("cannot run {program}: {e}"))
        }
        _ => CaptureError::Transient(format!("failed to spawn {program}: {e}")),
    }
}

fn stderr_tail(stderr: &str) -> &str {
    let trimmed = stderr.trim();
    match trimmed.char_indices().rev().nth(STDERR_TAIL_CHARS) {
        Some((idx, _)) => &trimmed[idx..],
        None => trimmed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn capture(dir: &Path, command: &[&str], timeout_seconds: u64) -> CommandCapture {
        let mut config = CaptureConfig::default();
        config.timelapse.output_dir = dir.to_path_buf();
        config.timelapse.add_timestamp = false;
        config.timelapse.create_daily_dirs = false;
        config.timelapse.min_free_space_mb = 0;
        config.capture.command = command.iter().map(ToString::to_string).collect();
        config.capture.timeout_seconds = timeout_seconds;
        CommandCapture::from_config(&config)
    }

    fn tick(seq: u64) -> ScheduledTick {
        let now = Utc::now();
        ScheduledTick {
            sequence_number: seq,
            scheduled_at: now,
            fired_at: now,
            drift_ms: 4,
        }
    }

    #[tokio::test]
    async fn successful_command_yields_artifact_and_metadata() {
        let dir = TempDir::new().unwrap();
        let source = capture(dir.path(), &["sh", "-c", "printf frame > {output}"], 5);

        let artifact = source.capture(&tick(3)).await.unwrap();

        assert_eq!(artifact.path, dir.path().join("timelapse_000003.jpg"));
        assert_eq!(artifact.size_bytes, Some(5));
        let ledger = std::fs::read_to_string(dir.path().join("capture_metadata.jsonl")).unwrap();
        let entry: CaptureMetadata = serde_json::from_str(ledger.trim()).unwrap();
        assert_eq!(entry.capture_number, 3);
        assert_eq!(entry.drift_ms, 4);
    }

    #[tokio::test]
    async fn nonzero_exit_is_transient() {
        let dir = TempDir::new().unwrap();
        let source = capture(dir.path(), &["sh", "-c", "echo device busy >&2; exit 1", "{output}"], 5);
        let err = source.capture(&tick(1)).await.unwrap_err();
        match err {
            CaptureError::Transient(msg) => assert!(msg.contains("device busy"), "{msg}"),
            other => panic!("expected transient, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_output_file_is_transient() {
        let dir = TempDir::new().unwrap();
        let source = capture(dir.path(), &["true", "{output}"], 5);
        let err = source.capture(&tick(1)).await.unwrap_err();
        assert!(matches!(err, CaptureError::Transient(_)));
    }

    #[tokio::test]
    async fn missing_binary_is_fatal() {
        let dir = TempDir::new().unwrap();
        let source = capture(dir.path(), &["/nonexistent/rpicam-still", "-o", "{output}"], 5);
        let err = source.capture(&tick(1)).await.unwrap_err();
        assert!(matches!(err, CaptureError::Fatal(_)));
    }

    #[tokio::test]
    async fn hung_command_times_out() {
        let dir = TempDir::new().unwrap();
        let source = capture(dir.path(), &["sh", "-c", "sleep 30; : {output}"], 1);
        let started = std::time::Instant::now();
        let err = source.capture(&tick(1)).await.unwrap_err();
        assert!(matches!(err, CaptureError::Transient(_)));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn placeholder_is_substituted_everywhere() {
        let source = capture(Path::new("/tmp"), &["cam", "-o", "{output}", "--meta={output}.json"], 5);
        let line = source.command_line(Path::new("/tmp/f.jpg"));
        assert_eq!(line, vec!["cam", "-o", "/tmp/f.jpg", "--meta=/tmp/f.jpg.json"]);
    }
}
