#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use cinepi_protocol::{
    ArtifactRef, AuditKind, AuditOutcome, AuditRecord, AuditSink, MemoryAuditSink, UploadStatus,
};
use cinepi_sync::{
    PipelineConfig, RejectReason, RemoteBackend, RetryPolicy, SyncError, SyncPipeline,
    UploadError, UploadRequest, content_hash,
};
use pretty_assertions::assert_eq;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

type Behaviour = Box<dyn Fn(&UploadRequest) -> Result<(), UploadError> + Send + Sync>;

/// Backend stub that records every call and answers per `behaviour`.
struct StubBackend {
    origin: Instant,
    calls: Mutex<Vec<(String, Duration)>>,
    audits: Mutex<Vec<AuditRecord>>,
    behaviour: Behaviour,
}

impl StubBackend {
    fn new(behaviour: impl Fn(&UploadRequest) -> Result<(), UploadError> + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            origin: Instant::now(),
            calls: Mutex::new(Vec::new()),
            audits: Mutex::new(Vec::new()),
            behaviour: Box::new(behaviour),
        })
    }

    fn accepting() -> Arc<Self> {
        Self::new(|_| Ok(()))
    }

    fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn call_offsets_ms(&self) -> Vec<u128> {
        self.calls.lock().unwrap().iter().map(|(_, at)| at.as_millis()).collect()
    }
}

#[async_trait]
impl RemoteBackend for StubBackend {
    async fn upload(&self, request: &UploadRequest) -> Result<(), UploadError> {
        self.calls
            .lock()
            .unwrap()
            .push((request.key.clone(), self.origin.elapsed()));
        (self.behaviour)(request)
    }

    async fn append_audit(&self, record: &AuditRecord) -> Result<(), UploadError> {
        self.audits.lock().unwrap().push(record.clone());
        Ok(())
    }
}

fn config(policy: RetryPolicy) -> PipelineConfig {
    PipelineConfig {
        policy,
        forward_audit: false,
        ..PipelineConfig::default()
    }
}

fn no_jitter() -> RetryPolicy {
    RetryPolicy {
        jitter_fraction: 0.0,
        ..RetryPolicy::default()
    }
}

fn pipeline(
    config: PipelineConfig,
    backend: &Arc<StubBackend>,
    ledger: &Arc<MemoryAuditSink>,
) -> SyncPipeline {
    SyncPipeline::new(
        config,
        backend.clone() as Arc<dyn RemoteBackend>,
        ledger.clone() as Arc<dyn cinepi_protocol::UploadLedger>,
    )
    .unwrap()
}

fn write_frames(dir: &Path, count: usize) -> Vec<PathBuf> {
    (0..count)
        .map(|i| {
            let path = dir.join(format!("frame_{i:06}.jpg"));
            std::fs::write(&path, format!("frame-bytes-{i}")).unwrap();
            path
        })
        .collect()
}

fn spawn_workers(pipeline: &SyncPipeline, workers: usize) -> (CancellationToken, tokio::task::JoinHandle<()>) {
    let cancel = CancellationToken::new();
    let p = pipeline.clone();
    let token = cancel.clone();
    let handle = tokio::spawn(async move { p.run_workers(workers, token).await });
    (cancel, handle)
}

#[tokio::test(start_paused = true)]
async fn always_transient_task_fails_after_max_attempts_on_backoff_schedule() {
    let dir = TempDir::new().unwrap();
    let frame = write_frames(dir.path(), 1).remove(0);
    let backend = StubBackend::new(|_| Err(UploadError::transient("HTTP 503")));
    let ledger = Arc::new(MemoryAuditSink::new());
    let sync = pipeline(config(RetryPolicy::default()), &backend, &ledger);
    let (cancel, workers) = spawn_workers(&sync, 2);

    let task = sync.enqueue(&frame).await.unwrap();
    sync.wait_idle().await;

    let task = sync.task(task.id).unwrap();
    assert_eq!(task.status, UploadStatus::Failed);
    assert_eq!(task.attempt, 3);
    assert!(task.last_error.unwrap().contains("503"));
    assert_eq!(backend.call_count(), 3);

    let offsets = backend.call_offsets_ms();
    assert!(offsets[0] < 50, "first attempt at {}ms", offsets[0]);
    let first_gap = offsets[1] - offsets[0];
    let second_gap = offsets[2] - offsets[1];
    assert!((1000..=1150).contains(&first_gap), "first retry after {first_gap}ms");
    assert!((2000..=2250).contains(&second_gap), "second retry after {second_gap}ms");

    // No fourth attempt, however long we wait.
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(backend.call_count(), 3);
    assert_eq!(sync.failed_tasks().len(), 1);

    let failures = ledger
        .records()
        .into_iter()
        .filter(|r| r.kind == AuditKind::UploadAttempt && r.outcome == AuditOutcome::Failure)
        .count();
    assert_eq!(failures, 3);

    cancel.cancel();
    workers.await.unwrap();
}

#[tokio::test]
async fn content_with_recorded_success_is_never_uploaded_again() {
    let dir = TempDir::new().unwrap();
    let frame = write_frames(dir.path(), 1).remove(0);
    let hash = content_hash(&std::fs::read(&frame).unwrap());

    let ledger = Arc::new(MemoryAuditSink::new());
    ledger
        .append(&AuditRecord::new(AuditKind::UploadAttempt, hash.clone(), AuditOutcome::Success))
        .unwrap();
    let backend = StubBackend::accepting();
    let sync = pipeline(config(no_jitter()), &backend, &ledger);
    let (cancel, workers) = spawn_workers(&sync, 2);

    let task = sync.enqueue(&frame).await.unwrap();
    sync.wait_idle().await;

    assert_eq!(backend.call_count(), 0);
    let task = sync.task(task.id).unwrap();
    assert_eq!(task.status, UploadStatus::Succeeded);
    assert!(task.deduplicated);
    assert_eq!(task.content_hash.as_deref(), Some(hash.as_str()));
    assert_eq!(ledger.count(AuditKind::UploadSkipped), 1);

    cancel.cancel();
    workers.await.unwrap();
}

#[tokio::test]
async fn re_enqueued_artifact_is_uploaded_once() {
    let dir = TempDir::new().unwrap();
    let frame = write_frames(dir.path(), 1).remove(0);
    let backend = StubBackend::accepting();
    let ledger = Arc::new(MemoryAuditSink::new());
    let sync = pipeline(config(no_jitter()), &backend, &ledger);
    let (cancel, workers) = spawn_workers(&sync, 1);

    sync.enqueue(&frame).await.unwrap();
    sync.wait_idle().await;
    sync.enqueue(&frame).await.unwrap();
    sync.wait_idle().await;

    assert_eq!(backend.call_count(), 1);
    assert_eq!(sync.status().succeeded, 2);
    assert_eq!(ledger.count(AuditKind::UploadSkipped), 1);

    let successes: Vec<_> = ledger
        .records()
        .into_iter()
        .filter(|r| r.kind == AuditKind::UploadAttempt && r.outcome == AuditOutcome::Success)
        .collect();
    assert_eq!(successes.len(), 1);
    assert_eq!(successes[0].detail_str("key"), Some(
        format!("{}/frame_000000.jpg", chrono::Utc::now().date_naive().format("%Y-%m-%d")).as_str()
    ));

    cancel.cancel();
    workers.await.unwrap();
}

#[tokio::test]
async fn rejected_upload_is_terminal_until_replayed() {
    let dir = TempDir::new().unwrap();
    let frame = write_frames(dir.path(), 1).remove(0);
    let reject = Arc::new(AtomicBool::new(true));
    let flag = Arc::clone(&reject);
    let backend = StubBackend::new(move |_| {
        if flag.load(Ordering::SeqCst) {
            Err(UploadError::rejected(RejectReason::Validation, "HTTP 400: bad key"))
        } else {
            Ok(())
        }
    });
    let ledger = Arc::new(MemoryAuditSink::new());
    let sync = pipeline(config(no_jitter()), &backend, &ledger);
    let (cancel, workers) = spawn_workers(&sync, 1);

    let task = sync.enqueue(&frame).await.unwrap();
    sync.wait_idle().await;
    assert_eq!(backend.call_count(), 1);
    assert_eq!(sync.task(task.id).unwrap().status, UploadStatus::Failed);

    reject.store(false, Ordering::SeqCst);
    let replayed = sync.replay(task.id).await.unwrap();
    assert_eq!(replayed.attempt, 0);
    sync.wait_idle().await;

    assert_eq!(backend.call_count(), 2);
    assert_eq!(sync.task(task.id).unwrap().status, UploadStatus::Succeeded);
    assert!(sync.failed_tasks().is_empty());
    assert!(matches!(
        sync.replay(task.id).await,
        Err(SyncError::NotReplayable { .. })
    ));

    cancel.cancel();
    workers.await.unwrap();
}

#[tokio::test]
async fn unreadable_artifact_fails_without_calling_backend() {
    let dir = TempDir::new().unwrap();
    let backend = StubBackend::accepting();
    let ledger = Arc::new(MemoryAuditSink::new());
    let sync = pipeline(config(no_jitter()), &backend, &ledger);
    let (cancel, workers) = spawn_workers(&sync, 1);

    let task = sync.enqueue(dir.path().join("missing.jpg")).await.unwrap();
    sync.wait_idle().await;

    assert_eq!(backend.call_count(), 0);
    let task = sync.task(task.id).unwrap();
    assert_eq!(task.status, UploadStatus::Failed);
    assert_eq!(task.attempt, 1);
    let record = ledger
        .records()
        .into_iter()
        .find(|r| r.kind == AuditKind::UploadAttempt)
        .unwrap();
    assert_eq!(record.detail_str("error_class"), Some("fatal_local"));

    cancel.cancel();
    workers.await.unwrap();
}

#[tokio::test]
async fn audit_records_are_forwarded_to_backend() {
    let dir = TempDir::new().unwrap();
    let frame = write_frames(dir.path(), 1).remove(0);
    let backend = StubBackend::accepting();
    let ledger = Arc::new(MemoryAuditSink::new());
    let sync = pipeline(
        PipelineConfig {
            forward_audit: true,
            ..config(no_jitter())
        },
        &backend,
        &ledger,
    );
    let (cancel, workers) = spawn_workers(&sync, 1);

    sync.enqueue(&frame).await.unwrap();
    sync.wait_idle().await;
    assert!(sync.flush_audit(Duration::from_secs(5), &CancellationToken::new()).await);

    let forwarded = backend.audits.lock().unwrap().clone();
    assert_eq!(forwarded.len(), 1);
    assert_eq!(forwarded[0].kind, AuditKind::UploadAttempt);
    assert_eq!(ledger.records().len(), 1);

    cancel.cancel();
    workers.await.unwrap();
}

#[tokio::test]
async fn full_queue_is_reported_instead_of_blocking() {
    let backend = StubBackend::accepting();
    let ledger = Arc::new(MemoryAuditSink::new());
    let sync = pipeline(
        PipelineConfig {
            queue_capacity: 1,
            ..config(no_jitter())
        },
        &backend,
        &ledger,
    );

    sync.try_enqueue(&ArtifactRef::new("/tmp/a.jpg", 1)).unwrap();
    let err = sync.try_enqueue(&ArtifactRef::new("/tmp/b.jpg", 2)).unwrap_err();
    assert!(matches!(err, SyncError::QueueFull));
    assert_eq!(sync.status().pending, 1);
}

#[tokio::test(start_paused = true)]
async fn shutdown_cancels_tasks_waiting_for_retry() {
    let dir = TempDir::new().unwrap();
    let frame = write_frames(dir.path(), 1).remove(0);
    let backend = StubBackend::new(|_| Err(UploadError::transient("connection reset")));
    let ledger = Arc::new(MemoryAuditSink::new());
    let sync = pipeline(config(no_jitter()), &backend, &ledger);
    let (cancel, workers) = spawn_workers(&sync, 1);

    let task = sync.enqueue(&frame).await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(backend.call_count(), 1);

    cancel.cancel();
    workers.await.unwrap();
    sync.wait_idle().await;

    assert_eq!(sync.task(task.id).unwrap().status, UploadStatus::Cancelled);
    assert_eq!(sync.status().cancelled, 1);
    assert_eq!(backend.call_count(), 1);
}

fn fail_first(n: usize) -> impl Fn(&UploadRequest) -> Result<(), UploadError> + Send + Sync {
    move |request| {
        let index: usize = request
            .key
            .rsplit('_')
            .next()
            .and_then(|s| s.strip_suffix(".jpg"))
            .and_then(|s| s.parse().ok())
            .unwrap();
        if index < n {
            Err(UploadError::rejected(RejectReason::Quota, "HTTP 507"))
        } else {
            Ok(())
        }
    }
}

#[tokio::test]
async fn chunk_over_failure_threshold_aborts_remaining_items() {
    let dir = TempDir::new().unwrap();
    let frames = write_frames(dir.path(), 100);
    let backend = StubBackend::new(fail_first(15));
    let ledger = Arc::new(MemoryAuditSink::new());
    let sync = pipeline(config(no_jitter()), &backend, &ledger);

    let report = sync.sync_backlog(frames, 1, &CancellationToken::new()).await;

    assert!(report.systemic_failure);
    assert_eq!(report.failed, 11);
    assert_eq!(report.uploaded, 0);
    assert_eq!(report.aborted, 89);
    assert_eq!(report.deferred, 0);
    assert_eq!(backend.call_count(), 11);
    assert_eq!(ledger.count(AuditKind::ChunkAborted), 1);
    assert_eq!(sync.status().cancelled, 89);
}

#[tokio::test]
async fn systemic_failure_defers_later_chunks() {
    let dir = TempDir::new().unwrap();
    let frames = write_frames(dir.path(), 200);
    let backend = StubBackend::new(fail_first(200));
    let ledger = Arc::new(MemoryAuditSink::new());
    let policy = RetryPolicy {
        chunk_size: 50,
        ..no_jitter()
    };
    let sync = pipeline(config(policy), &backend, &ledger);

    let report = sync.sync_backlog(frames, 2, &CancellationToken::new()).await;

    assert!(report.systemic_failure);
    assert_eq!(report.chunks_run, 1);
    assert_eq!(report.deferred, 150);
    assert!(backend.call_count() < 50);
}

#[tokio::test]
async fn failures_at_threshold_do_not_abort() {
    let dir = TempDir::new().unwrap();
    let frames = write_frames(dir.path(), 100);
    let backend = StubBackend::new(fail_first(10));
    let ledger = Arc::new(MemoryAuditSink::new());
    let sync = pipeline(config(no_jitter()), &backend, &ledger);

    let report = sync.sync_backlog(frames, 4, &CancellationToken::new()).await;

    assert!(!report.systemic_failure);
    assert_eq!(report.failed, 10);
    assert_eq!(report.uploaded, 90);
    assert_eq!(report.aborted, 0);
    assert_eq!(ledger.count(AuditKind::ChunkAborted), 0);
}

#[tokio::test]
async fn local_read_failures_do_not_trip_fail_fast() {
    let dir = TempDir::new().unwrap();
    let mut frames = write_frames(dir.path(), 80);
    frames.extend((0..20).map(|i| dir.path().join(format!("gone_{i}.jpg"))));
    let backend = StubBackend::accepting();
    let ledger = Arc::new(MemoryAuditSink::new());
    let sync = pipeline(config(no_jitter()), &backend, &ledger);

    let report = sync.sync_backlog(frames, 2, &CancellationToken::new()).await;

    assert!(!report.systemic_failure);
    assert_eq!(report.failed_local, 20);
    assert_eq!(report.uploaded, 80);
}

#[tokio::test]
async fn backlog_scan_skips_uploaded_and_foreign_files() {
    let dir = TempDir::new().unwrap();
    let day = dir.path().join("2025-01-02");
    std::fs::create_dir_all(&day).unwrap();
    let frames = write_frames(&day, 3);
    std::fs::write(day.join("notes.txt"), "not an image").unwrap();

    let ledger = Arc::new(MemoryAuditSink::new());
    let uploaded = content_hash(&std::fs::read(&frames[1]).unwrap());
    ledger
        .append(&AuditRecord::new(AuditKind::UploadAttempt, uploaded, AuditOutcome::Success))
        .unwrap();
    let sync = pipeline(config(no_jitter()), &StubBackend::accepting(), &ledger);

    let backlog = sync.scan_backlog(dir.path(), "jpg").await.unwrap();
    assert_eq!(backlog, vec![frames[0].clone(), frames[2].clone()]);
}

#[tokio::test]
async fn cancelling_backlog_stops_remaining_uploads() {
    let dir = TempDir::new().unwrap();
    let frames = write_frames(dir.path(), 20);
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let backend = StubBackend::new(move |_| {
        trigger.cancel();
        Ok(())
    });
    let ledger = Arc::new(MemoryAuditSink::new());
    let sync = pipeline(config(no_jitter()), &backend, &ledger);

    let report = sync.sync_backlog(frames, 1, &cancel).await;

    assert_eq!(backend.call_count(), 1);
    assert!(report.cancelled);
    assert_eq!(report.uploaded, 1);
    assert_eq!(report.cancelled_items, 19);
    assert_eq!(sync.status().cancelled, 19);
}

#[tokio::test]
async fn finished_tasks_beyond_retention_fold_into_counters() {
    let dir = TempDir::new().unwrap();
    let frames = write_frames(dir.path(), 6);
    let backend = StubBackend::new(fail_first(6));
    let ledger = Arc::new(MemoryAuditSink::new());
    let policy = RetryPolicy {
        fail_fast_threshold: 1.0,
        ..no_jitter()
    };
    let sync = pipeline(
        PipelineConfig {
            retain_finished: 3,
            ..config(policy)
        },
        &backend,
        &ledger,
    );

    let report = sync.sync_backlog(frames, 1, &CancellationToken::new()).await;

    assert_eq!(report.failed, 6);
    assert_eq!(sync.status().failed, 6);
    assert_eq!(sync.failed_tasks().len(), 3);
}
