//! SQLite-backed audit ledger.
//!
//! The ledger is the durable side of the upload idempotency rule: an
//! `upload_attempt` row with outcome `success` for a content hash means that
//! content is on the remote and must not be sent again, regardless of what
//! any in-memory queue believes.
//!
//! ## Tables
//!
//! - `audit_records`: one row per [`AuditRecord`]; UPDATE and DELETE are
//!   rejected by triggers.

use cinepi_protocol::{AuditError, AuditKind, AuditOutcome, AuditRecord, AuditSink, UploadLedger};
use rusqlite::{Connection, OptionalExtension, params};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

const SCHEMA_SQL: &str = include_str!("../AUDIT_SCHEMA.sql");

/// Per-kind/outcome tallies, logged when a capture or backlog run ends.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditSummary {
    pub total: u64,
    pub by_kind: BTreeMap<String, BTreeMap<String, u64>>,
}

impl AuditSummary {
    pub fn count(&self, kind: AuditKind, outcome: AuditOutcome) -> u64 {
        self.by_kind
            .get(kind.as_str())
            .and_then(|m| m.get(outcome.as_str()))
            .copied()
            .unwrap_or(0)
    }
}

pub struct SqliteAuditLog {
    conn: Mutex<Connection>,
}

fn storage_err(context: &str, e: rusqlite::Error) -> AuditError {
    AuditError::Storage(format!("{context}: {e}"))
}

impl SqliteAuditLog {
    /// Open (creating if needed) the ledger at `path`.
    pub fn open(path: &Path) -> Result<Self, AuditError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)
            .map_err(|e| storage_err(&format!("failed to open {}", path.display()), e))?;
        // WAL keeps readers (status queries) from blocking the appending workers.
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| storage_err("failed to enable WAL", e))?;
        Self::init(conn, Some(path))
    }

    pub fn open_in_memory() -> Result<Self, AuditError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| storage_err("failed to open in-memory db", e))?;
        Self::init(conn, None)
    }

    fn init(conn: Connection, path: Option<&Path>) -> Result<Self, AuditError> {
        conn.execute_batch(SCHEMA_SQL)
            .map_err(|e| storage_err("failed to apply schema", e))?;
        if let Some(path) = path {
            tracing::debug!(path = %path.display(), "Audit ledger initialized");
        }
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Per-kind/outcome counts over the whole ledger.
    pub fn summary(&self) -> Result<AuditSummary, AuditError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT kind, outcome, COUNT(*) FROM audit_records GROUP BY kind, outcome",
            )
            .map_err(|e| storage_err("failed to prepare summary", e))?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })
            .map_err(|e| storage_err("failed to summarize", e))?;

        let mut summary = AuditSummary::default();
        for row in rows {
            let (kind, outcome, count) = row.map_err(|e| storage_err("failed to read row", e))?;
            let count = u64::try_from(count).unwrap_or(0);
            summary.total += count;
            *summary
                .by_kind
                .entry(kind)
                .or_default()
                .entry(outcome)
                .or_default() += count;
        }
        Ok(summary)
    }
}

impl AuditSink for SqliteAuditLog {
    fn append(&self, record: &AuditRecord) -> Result<(), AuditError> {
        let details_json = serde_json::to_string(&record.details)?;
        self.conn()
            .execute(
                r#"
                INSERT INTO audit_records (timestamp, kind, subject_id, outcome, details_json)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
                params![
                    record.timestamp.to_rfc3339(),
                    record.kind.as_str(),
                    record.subject_id,
                    record.outcome.as_str(),
                    details_json,
                ],
            )
            .map_err(|e| storage_err("failed to append audit record", e))?;

        tracing::trace!(
            kind = record.kind.as_str(),
            subject = %record.subject_id,
            outcome = record.outcome.as_str(),
            "Audit record appended"
        );
        Ok(())
    }
}

impl UploadLedger for SqliteAuditLog {
    fn has_successful_upload(&self, content_hash: &str) -> Result<bool, AuditError> {
        let found: Option<i64> = self
            .conn()
            .query_row(
                r#"
                SELECT id FROM audit_records
                WHERE kind = ?1 AND subject_id = ?2 AND outcome = ?3
                LIMIT 1
                "#,
                params![
                    AuditKind::UploadAttempt.as_str(),
                    content_hash,
                    AuditOutcome::Success.as_str(),
                ],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| storage_err("failed to query upload ledger", e))?;
        Ok(found.is_some())
    }
}
