//! Record store: one terminal record per document plus its audit trail.
//!
//! ## Why one transaction?
//!
//! A record and the audit rows that explain it must never disagree. Both are
//! written in a single SQLite transaction; if anything fails the whole
//! write is rolled back and the message is redelivered.
//!
//! ## Idempotency
//!
//! The record is keyed by document id and audit rows by
//! `(document_id, sequence)`. A commit for a document that already has a
//! record writes nothing and returns [`CommitOutcome::AlreadyRecorded`], so a
//! redelivered message can never duplicate audit rows or overwrite a result.
//!
//! Audit rows may also be appended without a record
//! ([`RecordStore::append_audit`]); a converted PDF leaves such a trail
//! naming its pages. Re-appending rows that already exist is a no-op.
//!
//! Money is stored as decimal text, never as a SQLite REAL.

use crate::error::StorageError;
use crate::types::{AuditEntry, ProcessingRecord};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Transaction};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};

/// Result of [`RecordStore::commit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitOutcome {
    Committed,
    AlreadyRecorded,
}

/// Durable store for processing records and audit rows.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Atomically write the record and all its audit rows.
    async fn commit(
        &self,
        record: &ProcessingRecord,
        audit: &[AuditEntry],
    ) -> Result<CommitOutcome, StorageError>;

    async fn get_record(
        &self,
        document_id: &str,
    ) -> Result<Option<ProcessingRecord>, StorageError>;

    /// Audit rows for a document, ordered by sequence.
    async fn audit_trail(&self, document_id: &str) -> Result<Vec<AuditEntry>, StorageError>;

    /// Insert audit rows that have no terminal record of their own.
    ///
    /// Rows whose `(document_id, sequence)` already exists are skipped;
    /// returns how many were inserted.
    async fn append_audit(&self, audit: &[AuditEntry]) -> Result<usize, StorageError>;

    /// Records completed at or after `since`, oldest first.
    async fn records_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<ProcessingRecord>, StorageError>;
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS processing_records (
    document_id  TEXT PRIMARY KEY,
    bucket       TEXT NOT NULL,
    object_key   TEXT NOT NULL,
    state        TEXT NOT NULL,
    total_cost   TEXT NOT NULL,
    record_json  TEXT NOT NULL,
    completed_at TEXT NOT NULL,
    expires_at   TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS audit_trail (
    document_id TEXT NOT NULL,
    sequence    INTEGER NOT NULL,
    stage       TEXT NOT NULL,
    tier        TEXT,
    confidence  REAL,
    cost        TEXT NOT NULL,
    outcome     TEXT NOT NULL,
    entry_json  TEXT NOT NULL,
    recorded_at TEXT NOT NULL,
    expires_at  TEXT NOT NULL,
    PRIMARY KEY (document_id, sequence)
);
CREATE INDEX IF NOT EXISTS idx_records_expires ON processing_records(expires_at);
CREATE INDEX IF NOT EXISTS idx_audit_expires ON audit_trail(expires_at);
";

/// [`RecordStore`] on a single SQLite database.
#[derive(Clone)]
pub struct SqliteRecordStore {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for SqliteRecordStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteRecordStore").finish_non_exhaustive()
    }
}

fn sql_err(e: rusqlite::Error) -> StorageError {
    match &e {
        rusqlite::Error::SqliteFailure(f, _)
            if matches!(f.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) =>
        {
            StorageError::Throttled {
                operation: "record store".into(),
                detail: e.to_string(),
            }
        }
        _ => StorageError::Database(e.to_string()),
    }
}

fn timestamp(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

impl SqliteRecordStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::Io {
                operation: "open record store".into(),
                detail: format!("{}: {e}", parent.display()),
            })?;
        }
        let conn = Connection::open(path).map_err(sql_err)?;
        info!("Record store opened at {}", path.display());
        Self::init(conn)
    }

    pub fn in_memory() -> Result<Self, StorageError> {
        Self::init(Connection::open_in_memory().map_err(sql_err)?)
    }

    fn init(conn: Connection) -> Result<Self, StorageError> {
        conn.busy_timeout(Duration::from_secs(5)).map_err(sql_err)?;
        conn.execute_batch(SCHEMA).map_err(sql_err)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StorageError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| StorageError::Database("connection mutex poisoned".into()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| StorageError::Database(format!("record store task failed: {e}")))?
    }

    /// Delete records and audit rows whose retention has lapsed.
    ///
    /// Returns `(records, audit_rows)` deleted.
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> Result<(usize, usize), StorageError> {
        let cutoff = timestamp(&now);
        self.with_conn(move |conn| {
            let tx = conn.transaction().map_err(sql_err)?;
            let records = tx
                .execute("DELETE FROM processing_records WHERE expires_at < ?1", params![cutoff])
                .map_err(sql_err)?;
            let audit = tx
                .execute("DELETE FROM audit_trail WHERE expires_at < ?1", params![cutoff])
                .map_err(sql_err)?;
            tx.commit().map_err(sql_err)?;
            Ok((records, audit))
        })
        .await
    }
}

/// Owned, pre-serialised row data so the blocking closure is `'static`.
struct AuditRow {
    document_id: String,
    sequence: u32,
    stage: &'static str,
    tier: Option<&'static str>,
    confidence: Option<f64>,
    cost: String,
    outcome: String,
    entry_json: String,
    recorded_at: String,
    expires_at: String,
}

impl AuditRow {
    fn from_entries(audit: &[AuditEntry]) -> Result<Vec<Self>, StorageError> {
        audit
            .iter()
            .map(|a| {
                Ok(AuditRow {
                    document_id: a.document_id.clone(),
                    sequence: a.sequence,
                    stage: a.stage.as_str(),
                    tier: a.tier.map(|t| t.as_str()),
                    confidence: a.confidence,
                    cost: a.cost.to_string(),
                    outcome: a.outcome.clone(),
                    entry_json: serde_json::to_string(a)?,
                    recorded_at: timestamp(&a.recorded_at),
                    expires_at: timestamp(&a.expires_at),
                })
            })
            .collect()
    }

    /// `INSERT OR IGNORE`; returns 1 when the row was new.
    fn insert(&self, tx: &Transaction<'_>) -> Result<usize, StorageError> {
        tx.execute(
            "INSERT OR IGNORE INTO audit_trail
             (document_id, sequence, stage, tier, confidence, cost, outcome,
              entry_json, recorded_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                self.document_id,
                self.sequence,
                self.stage,
                self.tier,
                self.confidence,
                self.cost,
                self.outcome,
                self.entry_json,
                self.recorded_at,
                self.expires_at,
            ],
        )
        .map_err(sql_err)
    }
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    async fn commit(
        &self,
        record: &ProcessingRecord,
        audit: &[AuditEntry],
    ) -> Result<CommitOutcome, StorageError> {
        let document_id = record.document_id.clone();
        let bucket = record.bucket.clone();
        let key = record.key.clone();
        let state = record.state.as_str();
        let total_cost = record.costs.total.to_string();
        let record_json = serde_json::to_string(record)?;
        let completed_at = timestamp(&record.completed_at);
        let expires_at = timestamp(&record.expires_at);
        let rows = AuditRow::from_entries(audit)?;

        self.with_conn(move |conn| {
            let tx = conn.transaction().map_err(sql_err)?;
            let exists = tx
                .query_row(
                    "SELECT 1 FROM processing_records WHERE document_id = ?1",
                    params![document_id],
                    |_| Ok(()),
                )
                .optional()
                .map_err(sql_err)?
                .is_some();
            if exists {
                debug!("Record for {} already present, nothing written", document_id);
                return Ok(CommitOutcome::AlreadyRecorded);
            }

            for row in &rows {
                row.insert(&tx)?;
            }

            tx.execute(
                "INSERT INTO processing_records
                 (document_id, bucket, object_key, state, total_cost, record_json,
                  completed_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    document_id,
                    bucket,
                    key,
                    state,
                    total_cost,
                    record_json,
                    completed_at,
                    expires_at,
                ],
            )
            .map_err(sql_err)?;

            tx.commit().map_err(sql_err)?;
            debug!("Committed {} ({}) with {} audit rows", document_id, state, rows.len());
            Ok(CommitOutcome::Committed)
        })
        .await
    }

    async fn get_record(
        &self,
        document_id: &str,
    ) -> Result<Option<ProcessingRecord>, StorageError> {
        let document_id = document_id.to_string();
        let json: Option<String> = self
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT record_json FROM processing_records WHERE document_id = ?1",
                    params![document_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(sql_err)
            })
            .await?;
        json.map(|j| serde_json::from_str(&j).map_err(StorageError::from))
            .transpose()
    }

    async fn audit_trail(&self, document_id: &str) -> Result<Vec<AuditEntry>, StorageError> {
        let document_id = document_id.to_string();
        let rows: Vec<String> = self
            .with_conn(move |conn| {
                let mut stmt = conn
                    .prepare(
                        "SELECT entry_json FROM audit_trail
                         WHERE document_id = ?1
                         ORDER BY sequence ASC",
                    )
                    .map_err(sql_err)?;
                let rows = stmt
                    .query_map(params![document_id], |row| row.get::<_, String>(0))
                    .map_err(sql_err)?;
                rows.collect::<Result<Vec<_>, _>>().map_err(sql_err)
            })
            .await?;
        rows.iter()
            .map(|j| serde_json::from_str(j).map_err(StorageError::from))
            .collect()
    }

    async fn append_audit(&self, audit: &[AuditEntry]) -> Result<usize, StorageError> {
        let rows = AuditRow::from_entries(audit)?;
        self.with_conn(move |conn| {
            let tx = conn.transaction().map_err(sql_err)?;
            let mut inserted = 0;
            for row in &rows {
                inserted += row.insert(&tx)?;
            }
            tx.commit().map_err(sql_err)?;
            debug!("Appended {} of {} audit rows", inserted, rows.len());
            Ok(inserted)
        })
        .await
    }

    async fn records_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<ProcessingRecord>, StorageError> {
        let cutoff = timestamp(&since);
        let rows: Vec<String> = self
            .with_conn(move |conn| {
                let mut stmt = conn
                    .prepare(
                        "SELECT record_json FROM processing_records
                         WHERE completed_at >= ?1
                         ORDER BY completed_at ASC",
                    )
                    .map_err(sql_err)?;
                let rows = stmt
                    .query_map(params![cutoff], |row| row.get::<_, String>(0))
                    .map_err(sql_err)?;
                rows.collect::<Result<Vec<_>, _>>().map_err(sql_err)
            })
            .await?;
        rows.iter()
            .map(|j| serde_json::from_str(j).map_err(StorageError::from))
            .collect()
    }
}
