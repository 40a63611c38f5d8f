//! Job aggregation: live progress counters between batches and the
//! one-time transition to a terminal status once the family's queue drains.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, types::Type, Connection, Row};

use crate::db::now;
use crate::types::{Job, JobStatus, QueueStats};

/// Minutes per document assumed before anything has completed.
const DEFAULT_MINUTES_PER_DOC: f64 = 2.0;

const JOB_COLUMNS: &str = "id, family_id, status, total_documents, processed_documents,
     failed_documents, avg_minutes_per_doc, estimated_minutes, error_message,
     started_at, completed_at";

/// What a finalization attempt did.
#[derive(Debug, Clone, PartialEq)]
pub enum Finalization {
    /// This call moved the job to its terminal status.
    Finalized(JobStatus),
    /// The job was already terminal; nothing was written.
    AlreadyTerminal(JobStatus),
    /// Items are still waiting or in flight.
    Deferred { pending: u64, processing: u64 },
    /// No job with that id.
    Missing,
}

/// Progress estimate stored alongside the counters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JobEta {
    pub avg_minutes_per_doc: f64,
    pub estimated_minutes: u64,
}

fn job_from_row(row: &Row) -> rusqlite::Result<Job> {
    let raw: String = row.get(2)?;
    let status = JobStatus::parse(&raw)
        .ok_or_else(|| rusqlite::Error::InvalidColumnType(2, "status".to_string(), Type::Text))?;
    Ok(Job {
        id: row.get(0)?,
        family_id: row.get(1)?,
        status,
        total_documents: row.get::<_, i64>(3)?.max(0) as u64,
        processed_documents: row.get::<_, i64>(4)?.max(0) as u64,
        failed_documents: row.get::<_, i64>(5)?.max(0) as u64,
        avg_minutes_per_doc: row.get(6)?,
        estimated_minutes: row.get::<_, Option<i64>>(7)?.map(|m| m.max(0) as u64),
        error_message: row.get(8)?,
        started_at: row.get(9)?,
        completed_at: row.get(10)?,
    })
}

/// Create a running job for a family.
pub fn create_job(
    conn: &Connection,
    job_id: &str,
    family_id: &str,
    total_documents: u64,
) -> Result<()> {
    conn.execute(
        "INSERT INTO analysis_jobs (id, family_id, status, total_documents, started_at)
         VALUES (?1, ?2, 'running', ?3, ?4)",
        params![job_id, family_id, total_documents as i64, now()],
    )
    .context("Failed to insert job")?;
    Ok(())
}

pub fn get_job(conn: &Connection, job_id: &str) -> Result<Option<Job>> {
    let sql = format!("SELECT {} FROM analysis_jobs WHERE id = ?1", JOB_COLUMNS);
    let mut stmt = conn.prepare(&sql).context("Failed to prepare get_job query")?;
    let mut rows = stmt.query(params![job_id])?;
    match rows.next()? {
        Some(row) => Ok(Some(job_from_row(row)?)),
        None => Ok(None),
    }
}

/// Estimate time per document and time remaining.
///
/// Uses whole elapsed minutes over processed documents, falling back to
/// [`DEFAULT_MINUTES_PER_DOC`] until something has been processed.
pub fn estimate_eta(elapsed_minutes: u64, processed: u64, remaining: u64) -> JobEta {
    let avg = if processed > 0 {
        elapsed_minutes as f64 / processed as f64
    } else {
        DEFAULT_MINUTES_PER_DOC
    };
    JobEta {
        avg_minutes_per_doc: (avg * 10.0).round() / 10.0,
        estimated_minutes: (avg * remaining as f64).ceil() as u64,
    }
}

/// Add one batch's outcomes to the job's counters and refresh its ETA.
///
/// Returns the updated job, or `None` if the job does not exist.
pub fn record_batch(
    conn: &Connection,
    job_id: &str,
    processed: u64,
    failed: u64,
    at: DateTime<Utc>,
) -> Result<Option<Job>> {
    let updated = conn
        .execute(
            "UPDATE analysis_jobs
             SET processed_documents = processed_documents + ?1,
                 failed_documents = failed_documents + ?2
             WHERE id = ?3",
            params![processed as i64, failed as i64, job_id],
        )
        .context("Failed to update job counters")?;
    if updated == 0 {
        return Ok(None);
    }

    let Some(job) = get_job(conn, job_id)? else {
        return Ok(None);
    };

    let elapsed_minutes = job
        .started_at
        .as_deref()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|start| (at - start.with_timezone(&Utc)).num_minutes().max(0) as u64)
        .unwrap_or(0);
    let remaining = job
        .total_documents
        .saturating_sub(job.processed_documents + job.failed_documents);
    let eta = estimate_eta(elapsed_minutes, job.processed_documents, remaining);

    conn.execute(
        "UPDATE analysis_jobs SET avg_minutes_per_doc = ?1, estimated_minutes = ?2 WHERE id = ?3",
        params![eta.avg_minutes_per_doc, eta.estimated_minutes as i64, job_id],
    )
    .context("Failed to update job estimate")?;

    Ok(Some(Job {
        avg_minutes_per_doc: Some(eta.avg_minutes_per_doc),
        estimated_minutes: Some(eta.estimated_minutes),
        ..job
    }))
}

/// Move a running job to its terminal status if the family's queue is drained.
///
/// The write is conditional on the job still running, so concurrent or
/// repeated finalization leaves an already-terminal job untouched.
pub fn finalize(conn: &Connection, job_id: &str, stats: &QueueStats) -> Result<Finalization> {
    if !stats.is_drained() {
        return Ok(Finalization::Deferred {
            pending: stats.pending,
            processing: stats.processing,
        });
    }

    let Some(job) = get_job(conn, job_id)? else {
        return Ok(Finalization::Missing);
    };
    if job.status.is_terminal() {
        return Ok(Finalization::AlreadyTerminal(job.status));
    }

    let status = if job.failed_documents == 0 {
        JobStatus::Completed
    } else {
        JobStatus::CompletedWithErrors
    };
    let updated = conn
        .execute(
            "UPDATE analysis_jobs SET status = ?1, completed_at = ?2, estimated_minutes = 0
             WHERE id = ?3 AND status = 'running'",
            params![status.as_str(), now(), job_id],
        )
        .context("Failed to finalize job")?;

    if updated == 0 {
        // Lost a race with another finalizer
        let current = get_job(conn, job_id)?.map(|j| j.status).unwrap_or(status);
        return Ok(Finalization::AlreadyTerminal(current));
    }
    Ok(Finalization::Finalized(status))
}

/// Halt a running job with an explanatory message.
/// Returns `false` if the job was missing or already terminal.
pub fn fail_job(conn: &Connection, job_id: &str, message: &str) -> Result<bool> {
    let updated = conn
        .execute(
            "UPDATE analysis_jobs SET status = 'failed', error_message = ?1, completed_at = ?2
             WHERE id = ?3 AND status = 'running'",
            params![message, now(), job_id],
        )
        .context("Failed to mark job as failed")?;
    Ok(updated > 0)
}
