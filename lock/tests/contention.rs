#![allow(clippy::unwrap_used, clippy::expect_used)]
//! Multi-acquirer behaviour of the device lock: mutual exclusion, stale
//! reclamation and corrupt-marker recovery.

use std::sync::Arc;
use std::time::Duration;

use cinepi_lock::{LockError, LockManager};
use cinepi_protocol::{AuditKind, AuditSink, MemoryAuditSink};
use tempfile::TempDir;

fn manager(dir: &TempDir, audit: &Arc<MemoryAuditSink>) -> LockManager {
    LockManager::new(dir.path(), audit.clone() as Arc<dyn AuditSink>)
        .with_poll_interval(Duration::from_millis(10))
}

/// PID of a process that has exited and been reaped.
fn dead_pid() -> u32 {
    let mut child = std::process::Command::new("true").spawn().unwrap();
    let pid = child.id();
    child.wait().unwrap();
    pid
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_acquirers_get_exactly_one_handle() {
    let dir = TempDir::new().unwrap();
    let audit = Arc::new(MemoryAuditSink::new());
    let barrier = Arc::new(tokio::sync::Barrier::new(8));

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let mgr = manager(&dir, &audit);
        let barrier = Arc::clone(&barrier);
        tasks.push(tokio::spawn(async move {
            barrier.wait().await;
            mgr.acquire("camera0", Duration::ZERO).await
        }));
    }

    let mut handles = Vec::new();
    let mut busy = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(handle) => handles.push(handle),
            Err(e) if e.is_in_use() => busy += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    assert_eq!(handles.len(), 1, "exactly one acquirer may win");
    assert_eq!(busy, 7);
    assert_eq!(audit.count(AuditKind::LockAcquired), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn two_acquirers_within_100ms_one_is_busy() {
    let dir = TempDir::new().unwrap();
    let audit = Arc::new(MemoryAuditSink::new());
    let first = manager(&dir, &audit);
    let second = manager(&dir, &audit);

    let a = tokio::spawn(async move {
        let handle = first.acquire("camera0", Duration::from_millis(300)).await;
        // Hold it past the other caller's wait.
        tokio::time::sleep(Duration::from_millis(500)).await;
        handle
    });
    let b = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        second.acquire("camera0", Duration::from_millis(300)).await
    });

    let (a, b) = (a.await.unwrap(), b.await.unwrap());
    let winners = [a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count();
    assert_eq!(winners, 1);
    let loser = if a.is_ok() { b } else { a };
    assert!(matches!(loser, Err(LockError::Busy { .. })));
}

#[tokio::test]
async fn stale_marker_is_reclaimed_without_intervention() {
    let dir = TempDir::new().unwrap();
    let audit = Arc::new(MemoryAuditSink::new());
    let mgr = manager(&dir, &audit);

    let stale = dead_pid();
    std::fs::write(mgr.lock_path("camera0"), format!("{stale}\n")).unwrap();
    assert!(!mgr.is_held("camera0").unwrap().held);

    let handle = mgr.acquire("camera0", Duration::from_secs(1)).await.unwrap();
    assert_eq!(handle.holder_id(), std::process::id());
    assert_eq!(audit.count(AuditKind::LockReclaimed), 1);

    let reclaimed = audit
        .records()
        .into_iter()
        .find(|r| r.kind == AuditKind::LockReclaimed)
        .unwrap();
    assert_eq!(reclaimed.subject_id, stale.to_string());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_reclaimers_leave_a_single_owner() {
    let dir = TempDir::new().unwrap();
    let audit = Arc::new(MemoryAuditSink::new());
    let path = manager(&dir, &audit).lock_path("camera0");
    std::fs::write(&path, format!("{}\n", dead_pid())).unwrap();

    let barrier = Arc::new(tokio::sync::Barrier::new(6));
    let mut tasks = Vec::new();
    for _ in 0..6 {
        let mgr = manager(&dir, &audit);
        let barrier = Arc::clone(&barrier);
        tasks.push(tokio::spawn(async move {
            barrier.wait().await;
            mgr.acquire("camera0", Duration::from_millis(50)).await
        }));
    }

    let mut winners = Vec::new();
    for task in tasks {
        if let Ok(handle) = task.await.unwrap() {
            winners.push(handle);
        }
    }
    assert_eq!(winners.len(), 1);
    assert!(winners[0].is_valid());
}

#[tokio::test]
async fn corrupt_marker_is_treated_as_absent() {
    let dir = TempDir::new().unwrap();
    let audit = Arc::new(MemoryAuditSink::new());
    let mgr = manager(&dir, &audit);
    std::fs::write(mgr.lock_path("camera0"), "garbage that is not a pid").unwrap();

    let handle = mgr.acquire("camera0", Duration::ZERO).await.unwrap();
    assert!(handle.is_valid());
    assert_eq!(audit.count(AuditKind::LockCorrupt), 1);
}

#[tokio::test]
async fn waiting_acquirer_gets_the_lock_once_released() {
    let dir = TempDir::new().unwrap();
    let audit = Arc::new(MemoryAuditSink::new());
    let holder = manager(&dir, &audit);
    let waiter = manager(&dir, &audit);

    let handle = holder.acquire("camera0", Duration::ZERO).await.unwrap();
    let release = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.release().unwrap();
    });

    let second = waiter.acquire("camera0", Duration::from_secs(2)).await;
    release.await.unwrap();
    assert!(second.is_ok());
}
