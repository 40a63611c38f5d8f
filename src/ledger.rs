//! Status ledger: one row per processing attempt.
//!
//! Rows start at `extracting`, may move to `analyzing`, and end with a single
//! terminal write (`complete` or `failed`). Every update is guarded on the
//! current phase, so a terminal row is never rewritten.

use anyhow::{Context, Result};
use rusqlite::{params, types::Type, Connection, Row};

use crate::db::now;
use crate::types::{AnalysisStatus, AnalysisStatusRecord, OutputCounts, QueueItem};

const RECORD_COLUMNS: &str = "id, job_id, document_id, family_id, document_name, status,
     status_message, started_at, completed_at, metrics_extracted, insights_extracted,
     error_message";

fn record_from_row(row: &Row) -> rusqlite::Result<AnalysisStatusRecord> {
    let raw: String = row.get(5)?;
    let status = AnalysisStatus::parse(&raw)
        .ok_or_else(|| rusqlite::Error::InvalidColumnType(5, "status".to_string(), Type::Text))?;
    Ok(AnalysisStatusRecord {
        id: row.get(0)?,
        job_id: row.get(1)?,
        document_id: row.get(2)?,
        family_id: row.get(3)?,
        document_name: row.get(4)?,
        status,
        status_message: row.get(6)?,
        started_at: row.get(7)?,
        completed_at: row.get(8)?,
        metrics_extracted: row.get::<_, Option<i64>>(9)?.map(|n| n.max(0) as u64),
        insights_extracted: row.get::<_, Option<i64>>(10)?.map(|n| n.max(0) as u64),
        error_message: row.get(11)?,
    })
}

/// Open a new attempt record at `extracting`. Returns its row id.
pub fn begin_attempt(conn: &Connection, item: &QueueItem, document_name: &str) -> Result<i64> {
    conn.execute(
        "INSERT INTO document_analysis_status
            (job_id, document_id, family_id, document_name, status, started_at)
         VALUES (?1, ?2, ?3, ?4, 'extracting', ?5)",
        params![
            item.job_id,
            item.document_id,
            item.family_id,
            document_name,
            now()
        ],
    )
    .context("Failed to insert status record")?;
    Ok(conn.last_insert_rowid())
}

/// Extraction succeeded; the attempt moves on to analysis.
pub fn mark_analyzing(conn: &Connection, record_id: i64) -> Result<bool> {
    let count = conn
        .execute(
            "UPDATE document_analysis_status
             SET status = 'analyzing', status_message = 'Running AI analysis...'
             WHERE id = ?1 AND status = 'extracting'",
            params![record_id],
        )
        .context("Failed to mark status record as analyzing")?;
    Ok(count > 0)
}

/// Terminal success with the counts read back from the analysis service.
pub fn mark_complete(conn: &Connection, record_id: i64, counts: OutputCounts) -> Result<bool> {
    let count = conn
        .execute(
            "UPDATE document_analysis_status
             SET status = 'complete', status_message = NULL,
                 metrics_extracted = ?1, insights_extracted = ?2, completed_at = ?3
             WHERE id = ?4 AND status IN ('extracting', 'analyzing')",
            params![counts.metrics as i64, counts.insights as i64, now(), record_id],
        )
        .context("Failed to mark status record as complete")?;
    Ok(count > 0)
}

/// Terminal failure with the reason shown to users.
pub fn mark_failed(conn: &Connection, record_id: i64, error: &str) -> Result<bool> {
    let count = conn
        .execute(
            "UPDATE document_analysis_status
             SET status = 'failed', status_message = NULL, error_message = ?1, completed_at = ?2
             WHERE id = ?3 AND status IN ('extracting', 'analyzing')",
            params![error, now(), record_id],
        )
        .context("Failed to mark status record as failed")?;
    Ok(count > 0)
}

pub fn get_record(conn: &Connection, record_id: i64) -> Result<Option<AnalysisStatusRecord>> {
    let sql = format!(
        "SELECT {} FROM document_analysis_status WHERE id = ?1",
        RECORD_COLUMNS
    );
    let mut stmt = conn.prepare(&sql).context("Failed to prepare get_record query")?;
    let mut rows = stmt.query(params![record_id])?;
    match rows.next()? {
        Some(row) => Ok(Some(record_from_row(row)?)),
        None => Ok(None),
    }
}

/// All attempts for a document, oldest first.
pub fn records_for_document(
    conn: &Connection,
    document_id: &str,
) -> Result<Vec<AnalysisStatusRecord>> {
    query_records(conn, "document_id", document_id)
}

/// All attempts recorded under a job, oldest first.
pub fn records_for_job(conn: &Connection, job_id: &str) -> Result<Vec<AnalysisStatusRecord>> {
    query_records(conn, "job_id", job_id)
}

fn query_records(
    conn: &Connection,
    column: &str,
    value: &str,
) -> Result<Vec<AnalysisStatusRecord>> {
    let sql = format!(
        "SELECT {} FROM document_analysis_status WHERE {} = ?1 ORDER BY id ASC",
        RECORD_COLUMNS, column
    );
    let mut stmt = conn.prepare(&sql).context("Failed to prepare status record query")?;
    let rows = stmt
        .query_map(params![value], record_from_row)
        .context("Failed to query status records")?;

    let mut records = Vec::new();
    for row in rows {
        records.push(row.context("Failed to read status record")?);
    }
    Ok(records)
}
