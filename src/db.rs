use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, types::Type, Connection, Row, TransactionBehavior};

use crate::ledger;
use crate::policy::RetryDecision;
use crate::types::{NewQueueItem, OutputCounts, QueueItem, QueueItemStatus, QueueStats};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS documents (
    id              TEXT PRIMARY KEY,
    family_id       TEXT NOT NULL,
    file_name       TEXT NOT NULL,
    created_at      DATETIME DEFAULT CURRENT_TIMESTAMP
);

CREATE TABLE IF NOT EXISTS analysis_jobs (
    id                  TEXT PRIMARY KEY,
    family_id           TEXT NOT NULL,
    status              TEXT NOT NULL CHECK(status IN
                            ('running', 'completed', 'completed_with_errors', 'failed')),
    total_documents     INTEGER NOT NULL DEFAULT 0,
    processed_documents INTEGER NOT NULL DEFAULT 0,
    failed_documents    INTEGER NOT NULL DEFAULT 0,
    avg_minutes_per_doc REAL,
    estimated_minutes   INTEGER,
    error_message       TEXT,
    created_at          DATETIME DEFAULT CURRENT_TIMESTAMP,
    started_at          DATETIME,
    completed_at        DATETIME
);

CREATE TABLE IF NOT EXISTS analysis_queue (
    id                  TEXT PRIMARY KEY,
    job_id              TEXT NOT NULL,
    family_id           TEXT NOT NULL,
    document_id         TEXT NOT NULL,
    status              TEXT NOT NULL
                        CHECK(status IN ('pending', 'processing', 'completed', 'failed')),
    retry_count         INTEGER NOT NULL DEFAULT 0,
    max_retries         INTEGER NOT NULL DEFAULT 3,
    estimated_tokens    INTEGER,
    error_message       TEXT,
    processing_time_ms  INTEGER,
    created_at          DATETIME DEFAULT CURRENT_TIMESTAMP,
    started_at          DATETIME,
    completed_at        DATETIME,
    updated_at          DATETIME
);

CREATE INDEX IF NOT EXISTS idx_queue_family_status ON analysis_queue(family_id, status);
CREATE INDEX IF NOT EXISTS idx_queue_job_status ON analysis_queue(job_id, status);

CREATE TABLE IF NOT EXISTS document_analysis_status (
    id                  INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id              TEXT NOT NULL,
    document_id         TEXT NOT NULL,
    family_id           TEXT NOT NULL,
    document_name       TEXT NOT NULL,
    status              TEXT NOT NULL
                        CHECK(status IN ('extracting', 'analyzing', 'complete', 'failed')),
    status_message      TEXT,
    metrics_extracted   INTEGER,
    insights_extracted  INTEGER,
    error_message       TEXT,
    started_at          DATETIME NOT NULL,
    completed_at        DATETIME
);

CREATE INDEX IF NOT EXISTS idx_status_document ON document_analysis_status(document_id);
CREATE INDEX IF NOT EXISTS idx_status_job ON document_analysis_status(job_id);
"#;

const ITEM_COLUMNS: &str = "id, job_id, family_id, document_id, status, retry_count, max_retries,
     estimated_tokens, error_message, processing_time_ms, started_at, completed_at";

pub(crate) const MISSING_DOCUMENT: &str = "Document not found (may have been deleted)";

/// Open (or create) the queue database. Pass `None` for an in-memory database.
pub fn open_database(path: Option<&std::path::Path>) -> Result<Connection> {
    let conn = match path {
        Some(p) => Connection::open(p).context("Failed to open queue database")?,
        None => Connection::open_in_memory().context("Failed to open in-memory database")?,
    };

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;",
    )
    .context("Failed to set PRAGMA options")?;

    conn.execute_batch(SCHEMA)
        .context("Failed to create queue schema")?;

    Ok(conn)
}

/// Fixed-width UTC timestamps, so stored values order correctly as text.
pub(crate) fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn now() -> String {
    timestamp(Utc::now())
}

fn status_from_row(row: &Row, idx: usize) -> rusqlite::Result<QueueItemStatus> {
    let raw: String = row.get(idx)?;
    QueueItemStatus::parse(&raw)
        .ok_or_else(|| rusqlite::Error::InvalidColumnType(idx, "status".to_string(), Type::Text))
}

fn item_from_row(row: &Row) -> rusqlite::Result<QueueItem> {
    Ok(QueueItem {
        id: row.get(0)?,
        job_id: row.get(1)?,
        family_id: row.get(2)?,
        document_id: row.get(3)?,
        status: status_from_row(row, 4)?,
        retry_count: row.get::<_, i64>(5)? as u32,
        max_retries: row.get::<_, i64>(6)? as u32,
        estimated_tokens: row.get::<_, Option<i64>>(7)?.map(|t| t.max(0) as u64),
        error_message: row.get(8)?,
        processing_time_ms: row.get::<_, Option<i64>>(9)?.map(|t| t.max(0) as u64),
        started_at: row.get(10)?,
        completed_at: row.get(11)?,
    })
}

// ── Document catalog ────────────────────────────────────────────────

/// Register (or rename) a document in the catalog.
pub fn upsert_document(
    conn: &Connection,
    document_id: &str,
    family_id: &str,
    file_name: &str,
) -> Result<()> {
    conn.execute(
        "INSERT INTO documents (id, family_id, file_name) VALUES (?1, ?2, ?3)
         ON CONFLICT(id) DO UPDATE
         SET family_id = excluded.family_id, file_name = excluded.file_name",
        params![document_id, family_id, file_name],
    )
    .context("Failed to upsert document")?;
    Ok(())
}

/// Look up a document's display name. `None` if it no longer exists.
pub fn document_name(conn: &Connection, document_id: &str) -> Result<Option<String>> {
    let mut stmt = conn
        .prepare("SELECT file_name FROM documents WHERE id = ?1")
        .context("Failed to prepare document_name query")?;
    let mut rows = stmt.query(params![document_id])?;
    match rows.next().context("Failed to read document row")? {
        Some(row) => Ok(Some(row.get(0)?)),
        None => Ok(None),
    }
}

// ── Queue items ─────────────────────────────────────────────────────

/// Insert a new pending item. `default_max_retries` applies when the item
/// does not carry its own.
pub fn insert_item(conn: &Connection, item: &NewQueueItem, default_max_retries: u32) -> Result<()> {
    let now = now();
    conn.execute(
        "INSERT INTO analysis_queue
            (id, job_id, family_id, document_id, status, retry_count, max_retries,
             estimated_tokens, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, 'pending', 0, ?5, ?6, ?7, ?7)",
        params![
            item.id,
            item.job_id,
            item.family_id,
            item.document_id,
            item.max_retries.unwrap_or(default_max_retries) as i64,
            item.estimated_tokens.map(|t| t as i64),
            now
        ],
    )
    .context("Failed to insert queue item")?;
    Ok(())
}

/// Fetch up to `limit` pending items for a family, oldest first, and mark
/// them processing in the same transaction.
///
/// The immediate transaction takes SQLite's write lock before the read, so
/// two processors sharing a database file can never claim the same item.
pub fn claim_next_batch(
    conn: &mut Connection,
    family_id: &str,
    limit: usize,
) -> Result<Vec<QueueItem>> {
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .context("Failed to begin claim transaction")?;

    let items = {
        let sql = format!(
            "SELECT {} FROM analysis_queue
             WHERE family_id = ?1 AND status = 'pending'
             ORDER BY rowid ASC
             LIMIT ?2",
            ITEM_COLUMNS
        );
        let mut stmt = tx.prepare(&sql).context("Failed to prepare claim query")?;
        let rows = stmt
            .query_map(params![family_id, limit as i64], item_from_row)
            .context("Failed to query pending items")?;
        let mut items = Vec::new();
        for row in rows {
            items.push(row.context("Failed to read pending item")?);
        }
        items
    };

    let now = now();
    let mut claimed = Vec::with_capacity(items.len());
    for mut item in items {
        tx.execute(
            "UPDATE analysis_queue SET status = 'processing', started_at = ?1, updated_at = ?1
             WHERE id = ?2 AND status = 'pending'",
            params![now, item.id],
        )
        .context("Failed to mark item as processing")?;
        item.status = QueueItemStatus::Processing;
        item.started_at = Some(now.clone());
        claimed.push(item);
    }

    tx.commit().context("Failed to commit claim")?;
    Ok(claimed)
}

/// Hand claimed-but-unselected items back to the queue.
pub fn release_items(conn: &Connection, item_ids: &[String]) -> Result<u32> {
    let now = now();
    let mut released = 0;
    for id in item_ids {
        released += conn
            .execute(
                "UPDATE analysis_queue SET status = 'pending', started_at = NULL, updated_at = ?1
                 WHERE id = ?2 AND status = 'processing'",
                params![now, id],
            )
            .context("Failed to release queue item")?;
    }
    Ok(released as u32)
}

/// Get a single item by ID.
pub fn get_item(conn: &Connection, item_id: &str) -> Result<Option<QueueItem>> {
    let sql = format!("SELECT {} FROM analysis_queue WHERE id = ?1", ITEM_COLUMNS);
    let mut stmt = conn.prepare(&sql).context("Failed to prepare get_item query")?;
    let mut rows = stmt.query(params![item_id])?;
    match rows.next()? {
        Some(row) => Ok(Some(item_from_row(row)?)),
        None => Ok(None),
    }
}

/// List a family's items in queue order.
pub fn list_items(conn: &Connection, family_id: &str) -> Result<Vec<QueueItem>> {
    let sql = format!(
        "SELECT {} FROM analysis_queue WHERE family_id = ?1 ORDER BY rowid ASC",
        ITEM_COLUMNS
    );
    let mut stmt = conn.prepare(&sql).context("Failed to prepare list_items query")?;
    let rows = stmt
        .query_map(params![family_id], item_from_row)
        .context("Failed to execute list_items query")?;

    let mut items = Vec::new();
    for row in rows {
        items.push(row.context("Failed to read item row")?);
    }
    Ok(items)
}

/// Mark an item failed without an attempt record (e.g. its document is gone).
pub fn fail_item(
    conn: &Connection,
    item_id: &str,
    error: &str,
    processing_time_ms: u64,
) -> Result<()> {
    let now = now();
    conn.execute(
        "UPDATE analysis_queue
         SET status = 'failed', error_message = ?1, processing_time_ms = ?2,
             completed_at = ?3, updated_at = ?3
         WHERE id = ?4",
        params![error, processing_time_ms as i64, now, item_id],
    )
    .context("Failed to mark item as failed")?;
    Ok(())
}

/// Successful attempt: status record `complete` with counts, then the item
/// `completed`. Both writes commit together; the ledger write goes first.
pub fn record_success(
    conn: &mut Connection,
    item_id: &str,
    record_id: i64,
    counts: OutputCounts,
    processing_time_ms: u64,
) -> Result<()> {
    let tx = conn.transaction().context("Failed to begin success transaction")?;
    ledger::mark_complete(&tx, record_id, counts)?;

    let now = now();
    tx.execute(
        "UPDATE analysis_queue
         SET status = 'completed', processing_time_ms = ?1, completed_at = ?2, updated_at = ?2
         WHERE id = ?3",
        params![processing_time_ms as i64, now, item_id],
    )
    .context("Failed to mark item as completed")?;

    tx.commit().context("Failed to commit success")?;
    Ok(())
}

/// Failed attempt: status record `failed`, then the item either requeued or
/// failed terminally according to `decision`.
pub fn record_failure(
    conn: &mut Connection,
    item_id: &str,
    record_id: i64,
    decision: &RetryDecision,
    processing_time_ms: u64,
) -> Result<()> {
    let tx = conn.transaction().context("Failed to begin failure transaction")?;
    ledger::mark_failed(&tx, record_id, &decision.ledger_message)?;

    let now = now();
    match decision.status {
        QueueItemStatus::Pending => {
            tx.execute(
                "UPDATE analysis_queue
                 SET status = 'pending', retry_count = ?1, error_message = ?2,
                     processing_time_ms = ?3, started_at = NULL, updated_at = ?4
                 WHERE id = ?5",
                params![
                    decision.retry_count as i64,
                    decision.queue_message,
                    processing_time_ms as i64,
                    now,
                    item_id
                ],
            )
            .context("Failed to requeue item")?;
        }
        _ => {
            tx.execute(
                "UPDATE analysis_queue
                 SET status = 'failed', retry_count = ?1, error_message = ?2,
                     processing_time_ms = ?3, completed_at = ?4, updated_at = ?4
                 WHERE id = ?5",
                params![
                    decision.retry_count as i64,
                    decision.queue_message,
                    processing_time_ms as i64,
                    now,
                    item_id
                ],
            )
            .context("Failed to mark item as failed")?;
        }
    }

    tx.commit().context("Failed to commit failure")?;
    Ok(())
}

/// Re-queue items whose processor died mid-attempt.
///
/// Only claims older than `stale_after` are touched; a younger claim may
/// belong to a processor that is still running against the same file.
/// Returns the number of items requeued.
pub fn requeue_interrupted(conn: &Connection, stale_after: Duration) -> Result<u32> {
    let cutoff = chrono::Duration::from_std(stale_after)
        .ok()
        .and_then(|age| Utc::now().checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC);
    let count = conn
        .execute(
            "UPDATE analysis_queue SET status = 'pending', started_at = NULL, updated_at = ?1
             WHERE status = 'processing' AND (started_at IS NULL OR started_at < ?2)",
            params![now(), timestamp(cutoff)],
        )
        .context("Failed to requeue interrupted items")?;
    Ok(count as u32)
}

/// Reset a job's in-flight items to pending after a fatal processor error.
pub fn reset_processing_for_job(conn: &Connection, job_id: &str, message: &str) -> Result<u32> {
    let count = conn
        .execute(
            "UPDATE analysis_queue
             SET status = 'pending', started_at = NULL, error_message = ?1, updated_at = ?2
             WHERE job_id = ?3 AND status = 'processing'",
            params![message, now(), job_id],
        )
        .context("Failed to reset processing items")?;
    Ok(count as u32)
}

/// Move a failed item back to pending and clear its error.
/// Returns `false` if the item is not currently failed.
pub fn retry_failed_item(conn: &Connection, item_id: &str) -> Result<bool> {
    let count = conn
        .execute(
            "UPDATE analysis_queue
             SET status = 'pending', error_message = NULL, completed_at = NULL, updated_at = ?1
             WHERE id = ?2 AND status = 'failed'",
            params![now(), item_id],
        )
        .context("Failed to retry queue item")?;
    Ok(count > 0)
}

/// Per-status counts for a family, plus the average duration of completed items.
pub fn queue_stats(conn: &Connection, family_id: &str) -> Result<QueueStats> {
    let mut stmt = conn
        .prepare(
            "SELECT status, COUNT(*) FROM analysis_queue
             WHERE family_id = ?1
             GROUP BY status",
        )
        .context("Failed to prepare queue_stats query")?;
    let rows = stmt
        .query_map(params![family_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })
        .context("Failed to execute queue_stats query")?;

    let mut stats = QueueStats::default();
    for row in rows {
        let (status, count) = row.context("Failed to read stats row")?;
        let count = count.max(0) as u64;
        match QueueItemStatus::parse(&status) {
            Some(QueueItemStatus::Pending) => stats.pending = count,
            Some(QueueItemStatus::Processing) => stats.processing = count,
            Some(QueueItemStatus::Completed) => stats.completed = count,
            Some(QueueItemStatus::Failed) => stats.failed = count,
            None => {}
        }
    }

    stats.avg_processing_time_ms = conn
        .query_row(
            "SELECT AVG(processing_time_ms) FROM analysis_queue
             WHERE family_id = ?1 AND status = 'completed' AND processing_time_ms IS NOT NULL",
            params![family_id],
            |row| row.get::<_, Option<f64>>(0),
        )
        .context("Failed to compute average processing time")?;

    Ok(stats)
}

/// Delete completed/failed items finished more than `days` ago.
/// Returns the number of items deleted.
pub fn prune_finished_items(conn: &Connection, days: u32) -> Result<u32> {
    let cutoff = Utc::now() - chrono::Duration::days(days as i64);
    let count = conn
        .execute(
            "DELETE FROM analysis_queue
             WHERE status IN ('completed', 'failed')
             AND completed_at < ?1",
            params![timestamp(cutoff)],
        )
        .context("Failed to prune finished queue items")?;
    Ok(count as u32)
}
