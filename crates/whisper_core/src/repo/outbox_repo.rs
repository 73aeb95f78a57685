//! Index outbox contracts and SQLite implementation.
//!
//! # Responsibility
//! - Persist graph projections that could not be applied inline.
//! - Hand pending jobs back in enqueue order and track retry attempts.
//!
//! # Invariants
//! - Jobs are returned ordered by `seq ASC` (enqueue order).
//! - A completed job is deleted; a job that exhausts its attempts becomes
//!   `dead` and is never returned by `pending` again.
//! - Payloads are JSON-encoded `IndexJob` values.

use crate::db::{DbError, DbResult};
use crate::model::whisper::{now_epoch_ms, WhisperId};
use crate::store::WhisperNode;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

const OUTBOX_SELECT_SQL: &str = "SELECT
    seq,
    job_id,
    whisper_id,
    payload,
    attempts,
    last_error,
    status,
    enqueued_at,
    updated_at
FROM index_outbox";

/// Stable identifier of one queued projection.
pub type JobId = Uuid;

/// One graph projection, replayable any number of times.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum IndexJob {
    /// Upsert the whisper node and make its edge set exactly `tags`.
    Upsert { node: WhisperNode, tags: Vec<String> },
    /// Replace the edge set of an existing whisper node.
    ReplaceTags { id: WhisperId, tags: Vec<String> },
    /// Remove the whisper node and its edges.
    Remove { id: WhisperId },
}

impl IndexJob {
    pub fn whisper_id(&self) -> &str {
        match self {
            Self::Upsert { node, .. } => node.id.as_str(),
            Self::ReplaceTags { id, .. } | Self::Remove { id } => id.as_str(),
        }
    }

    /// Short operation name used in log events.
    pub fn op(&self) -> &'static str {
        match self {
            Self::Upsert { .. } => "upsert",
            Self::ReplaceTags { .. } => "replace_tags",
            Self::Remove { .. } => "remove",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboxStatus {
    Pending,
    Dead,
}

/// Persisted outbox row.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxEntry {
    pub seq: i64,
    pub job_id: JobId,
    pub whisper_id: WhisperId,
    pub job: IndexJob,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub status: OutboxStatus,
    /// Epoch ms when the job was queued.
    pub enqueued_at: i64,
    /// Epoch ms of the last state change (queued or failed attempt).
    pub updated_at: i64,
}

/// Row counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutboxCounts {
    pub pending: u64,
    pub dead: u64,
}

/// Repository interface for the index outbox.
pub trait OutboxRepository {
    /// Appends a job and returns its id.
    fn enqueue(&self, job: &IndexJob) -> DbResult<JobId>;
    /// Returns up to `limit` pending jobs in enqueue order.
    fn pending(&self, limit: u32) -> DbResult<Vec<OutboxEntry>>;
    /// Returns whether any pending job targets `whisper_id`.
    fn has_pending_for(&self, whisper_id: &str) -> DbResult<bool>;
    /// Deletes a job after it was applied.
    fn complete(&self, job_id: JobId) -> DbResult<()>;
    /// Records a failed attempt; returns the resulting status.
    fn record_failure(&self, job_id: JobId, error: &str, max_attempts: u32)
        -> DbResult<OutboxStatus>;
    /// Returns dead jobs in enqueue order.
    fn dead_letters(&self) -> DbResult<Vec<OutboxEntry>>;
    /// Returns row counts by status.
    fn counts(&self) -> DbResult<OutboxCounts>;
}

/// SQLite-backed outbox owning its connection.
///
/// The connection sits behind a mutex so the service and the projection
/// worker can share one repository.
pub struct SqliteOutboxRepository {
    conn: Mutex<Connection>,
}

impl SqliteOutboxRepository {
    /// Wraps a connection returned by `db::open_db` / `db::open_db_in_memory`.
    pub fn new(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }

    fn lock(&self) -> DbResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| DbError::LockPoisoned)
    }

    fn select(&self, status: OutboxStatus, limit: Option<u32>) -> DbResult<Vec<OutboxEntry>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "{OUTBOX_SELECT_SQL}
             WHERE status = ?1
             ORDER BY seq ASC
             LIMIT ?2;"
        ))?;
        let limit = limit.map_or(-1, i64::from);
        let mut rows = stmt.query(params![status_to_db(status), limit])?;
        let mut entries = Vec::new();
        while let Some(row) = rows.next()? {
            entries.push(parse_outbox_row(row)?);
        }
        Ok(entries)
    }
}

impl OutboxRepository for SqliteOutboxRepository {
    fn enqueue(&self, job: &IndexJob) -> DbResult<JobId> {
        let job_id = Uuid::new_v4();
        let payload = serde_json::to_string(job)?;
        let now = now_epoch_ms();
        self.lock()?.execute(
            "INSERT INTO index_outbox (
                job_id,
                whisper_id,
                payload,
                enqueued_at,
                updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?4);",
            params![job_id.to_string(), job.whisper_id(), payload, now],
        )?;
        Ok(job_id)
    }

    fn pending(&self, limit: u32) -> DbResult<Vec<OutboxEntry>> {
        self.select(OutboxStatus::Pending, Some(limit))
    }

    fn has_pending_for(&self, whisper_id: &str) -> DbResult<bool> {
        let exists: i64 = self.lock()?.query_row(
            "SELECT EXISTS(
                SELECT 1
                FROM index_outbox
                WHERE whisper_id = ?1
                  AND status = 'pending'
            );",
            [whisper_id],
            |row| row.get(0),
        )?;
        Ok(exists == 1)
    }

    fn complete(&self, job_id: JobId) -> DbResult<()> {
        self.lock()?.execute(
            "DELETE FROM index_outbox WHERE job_id = ?1;",
            [job_id.to_string()],
        )?;
        Ok(())
    }

    fn record_failure(
        &self,
        job_id: JobId,
        error: &str,
        max_attempts: u32,
    ) -> DbResult<OutboxStatus> {
        let conn = self.lock()?;
        let status: Option<String> = conn
            .query_row(
                "UPDATE index_outbox
                 SET
                    attempts = attempts + 1,
                    last_error = ?2,
                    status = CASE WHEN attempts + 1 >= ?3 THEN 'dead' ELSE status END,
                    updated_at = ?4
                 WHERE job_id = ?1
                 RETURNING status;",
                params![job_id.to_string(), error, i64::from(max_attempts), now_epoch_ms()],
                |row| row.get(0),
            )
            .optional()?;

        match status.as_deref() {
            Some(value) => parse_status(value),
            None => Err(DbError::InvalidPayload(format!(
                "outbox job {job_id} no longer exists"
            ))),
        }
    }

    fn dead_letters(&self) -> DbResult<Vec<OutboxEntry>> {
        self.select(OutboxStatus::Dead, None)
    }

    fn counts(&self) -> DbResult<OutboxCounts> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT status, COUNT(*) FROM index_outbox GROUP BY status;")?;
        let mut rows = stmt.query([])?;
        let mut counts = OutboxCounts::default();
        while let Some(row) = rows.next()? {
            let status: String = row.get(0)?;
            let count: i64 = row.get(1)?;
            let count = u64::try_from(count).unwrap_or(0);
            match parse_status(&status)? {
                OutboxStatus::Pending => counts.pending = count,
                OutboxStatus::Dead => counts.dead = count,
            }
        }
        Ok(counts)
    }
}

fn parse_outbox_row(row: &Row<'_>) -> DbResult<OutboxEntry> {
    let job_id_text: String = row.get("job_id")?;
    let job_id = Uuid::parse_str(&job_id_text).map_err(|_| {
        DbError::InvalidPayload(format!("invalid job_id `{job_id_text}` in index_outbox"))
    })?;
    let payload: String = row.get("payload")?;
    let job: IndexJob = serde_json::from_str(&payload)?;
    let status_text: String = row.get("status")?;
    let attempts: i64 = row.get("attempts")?;

    Ok(OutboxEntry {
        seq: row.get("seq")?,
        job_id,
        whisper_id: row.get("whisper_id")?,
        job,
        attempts: u32::try_from(attempts).unwrap_or(u32::MAX),
        last_error: row.get("last_error")?,
        status: parse_status(&status_text)?,
        enqueued_at: row.get("enqueued_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn status_to_db(status: OutboxStatus) -> &'static str {
    match status {
        OutboxStatus::Pending => "pending",
        OutboxStatus::Dead => "dead",
    }
}

fn parse_status(value: &str) -> DbResult<OutboxStatus> {
    match value {
        "pending" => Ok(OutboxStatus::Pending),
        "dead" => Ok(OutboxStatus::Dead),
        other => Err(DbError::InvalidPayload(format!(
            "invalid status `{other}` in index_outbox"
        ))),
    }
}
