use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::Connection;
use serde_json::json;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::{
    aggregator::{self, Finalization},
    config::ProcessorConfig,
    db,
    error::QueueError,
    events::ProcessorEvent,
    executor::QueueExecutor,
    ledger,
    types::{
        AnalysisStatusRecord, InvocationResponse, Job, NewQueueItem, ProcessRequest,
        ProcessSummary, QueueItem, QueueStats,
    },
    AnalysisService, ExtractionService,
};

/// Public entry point: owns the store and the scheduler.
///
/// Register documents, create a job, enqueue items, then call
/// [`process()`](Self::process) (typed) or [`invoke()`](Self::invoke)
/// (JSON payload in, status code and JSON body out) to drain a family's queue.
///
/// # Example
///
/// ```ignore
/// let config = ProcessorConfig::builder()
///     .with_db_path(PathBuf::from("analysis.db"))
///     .build();
///
/// let client = HttpServiceClient::new("https://project.example.co")
///     .with_api_key(key);
/// let processor = QueueProcessor::new(config, client.clone(), client)?;
///
/// processor.register_document("doc-1", "fam-1", "w2.pdf")?;
/// let job_id = processor.create_job("fam-1", 1)?;
/// processor.enqueue(NewQueueItem::new(&job_id, "fam-1", "doc-1"))?;
///
/// let summary = processor
///     .process(&ProcessRequest::new("fam-1").with_job_id(job_id))
///     .await?;
/// ```
pub struct QueueProcessor<E, A> {
    db: Arc<Mutex<Connection>>,
    executor: QueueExecutor<E, A>,
    events: broadcast::Sender<ProcessorEvent>,
}

impl<E, A> QueueProcessor<E, A>
where
    E: ExtractionService,
    A: AnalysisService,
{
    /// Open (or create) the database and requeue items interrupted by a
    /// previous crash.
    ///
    /// Claims younger than [`ProcessorConfig::stale_claim_after`] are left
    /// alone, so a second processor opened on a live database file does not
    /// steal work that is still in flight.
    pub fn new(config: ProcessorConfig, extraction: E, analysis: A) -> Result<Self, QueueError> {
        let conn = db::open_database(config.db_path.as_deref())?;

        let requeued = db::requeue_interrupted(&conn, config.stale_claim_after)?;
        if requeued > 0 {
            info!(requeued, "Requeued interrupted items");
        }

        let db = Arc::new(Mutex::new(conn));
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let executor = QueueExecutor::new(
            config,
            Arc::clone(&db),
            extraction,
            analysis,
            events.clone(),
        );

        Ok(Self {
            db,
            executor,
            events,
        })
    }

    /// Receive progress events from every subsequent run.
    pub fn subscribe(&self) -> broadcast::Receiver<ProcessorEvent> {
        self.events.subscribe()
    }

    pub fn config(&self) -> &ProcessorConfig {
        self.executor.config()
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, QueueError> {
        self.db.lock().map_err(|e| QueueError::Other(e.to_string()))
    }

    /// Add or rename a document in the catalog.
    pub fn register_document(
        &self,
        document_id: &str,
        family_id: &str,
        file_name: &str,
    ) -> Result<(), QueueError> {
        let conn = self.conn()?;
        db::upsert_document(&conn, document_id, family_id, file_name)?;
        Ok(())
    }

    /// Create a running job for a family. Returns the job ID.
    pub fn create_job(&self, family_id: &str, total_documents: u64) -> Result<String, QueueError> {
        let job_id = uuid::Uuid::new_v4().to_string();
        let conn = self.conn()?;
        aggregator::create_job(&conn, &job_id, family_id, total_documents)?;
        Ok(job_id)
    }

    /// Add an item to the queue. Returns the item ID.
    pub fn enqueue(&self, item: NewQueueItem) -> Result<String, QueueError> {
        let conn = self.conn()?;
        db::insert_item(&conn, &item, self.config().default_max_retries)?;
        Ok(item.id)
    }

    pub fn get_item(&self, item_id: &str) -> Result<Option<QueueItem>, QueueError> {
        let conn = self.conn()?;
        Ok(db::get_item(&conn, item_id)?)
    }

    /// All items of a family in enqueue order.
    pub fn list_items(&self, family_id: &str) -> Result<Vec<QueueItem>, QueueError> {
        let conn = self.conn()?;
        Ok(db::list_items(&conn, family_id)?)
    }

    pub fn get_job(&self, job_id: &str) -> Result<Option<Job>, QueueError> {
        let conn = self.conn()?;
        Ok(aggregator::get_job(&conn, job_id)?)
    }

    /// Every attempt recorded for a document, oldest first.
    pub fn status_records_for_document(
        &self,
        document_id: &str,
    ) -> Result<Vec<AnalysisStatusRecord>, QueueError> {
        let conn = self.conn()?;
        Ok(ledger::records_for_document(&conn, document_id)?)
    }

    pub fn status_records_for_job(
        &self,
        job_id: &str,
    ) -> Result<Vec<AnalysisStatusRecord>, QueueError> {
        let conn = self.conn()?;
        Ok(ledger::records_for_job(&conn, job_id)?)
    }

    pub fn queue_stats(&self, family_id: &str) -> Result<QueueStats, QueueError> {
        let conn = self.conn()?;
        Ok(db::queue_stats(&conn, family_id)?)
    }

    /// Move a failed item back to `pending`.
    ///
    /// Returns `false` if the item exists but is not `failed`.
    pub fn retry_item(&self, item_id: &str) -> Result<bool, QueueError> {
        let conn = self.conn()?;
        if db::get_item(&conn, item_id)?.is_none() {
            return Err(QueueError::NotFound(item_id.to_string()));
        }
        Ok(db::retry_failed_item(&conn, item_id)?)
    }

    /// Delete completed and failed items finished more than `days` ago.
    /// Returns the number of items deleted.
    pub fn prune(&self, days: u32) -> Result<u32, QueueError> {
        let conn = self.conn()?;
        Ok(db::prune_finished_items(&conn, days)?)
    }

    /// Drain a family's queue and finalize its job.
    ///
    /// Per-document failures are recorded and counted, never returned. An
    /// `Err` means the store failed; in that case items of the job still in
    /// flight are reset to `pending` and the job is marked `failed` before
    /// the error is returned.
    pub async fn process(&self, request: &ProcessRequest) -> Result<ProcessSummary, QueueError> {
        let family_id = request.family_id.trim();
        if family_id.is_empty() {
            return Err(QueueError::InvalidRequest("family_id is required".to_string()));
        }
        let job_id = request.job_id.as_deref();
        info!(family_id, job_id, "Starting queue processing");

        match self.drain(family_id, job_id).await {
            Ok(summary) => Ok(summary),
            Err(e) => {
                error!(family_id, job_id, error = %e, "Fatal error");
                if let Some(job_id) = job_id {
                    self.cleanup_after_fatal(job_id, &e);
                }
                Err(e)
            }
        }
    }

    async fn drain(
        &self,
        family_id: &str,
        job_id: Option<&str>,
    ) -> Result<ProcessSummary, QueueError> {
        let totals = self.executor.run(family_id, job_id).await?;

        let finalization = match job_id {
            Some(job_id) => Some(self.executor.finalize(family_id, job_id)?),
            None => None,
        };

        let mut message = format!(
            "Queue processing complete: {} succeeded, {} failed",
            totals.processed, totals.failed
        );
        if let Some(reason) = &totals.halted {
            message.push_str(&format!(". Halted: {}", reason.job_message()));
        } else if let Some(Finalization::AlreadyTerminal(status)) = finalization {
            message.push_str(&format!(". Job already {}", status.as_str()));
        }
        info!(family_id, processed = totals.processed, failed = totals.failed, "{}", message);

        Ok(ProcessSummary {
            success: true,
            processed: totals.processed,
            failed: totals.failed,
            message,
        })
    }

    fn cleanup_after_fatal(&self, job_id: &str, err: &QueueError) {
        let conn = match self.conn() {
            Ok(conn) => conn,
            Err(e) => {
                error!(job_id, error = %e, "Cleanup failed: store unavailable");
                return;
            }
        };

        let message = format!("Fatal error: {}. Reset for retry.", err);
        match db::reset_processing_for_job(&conn, job_id, &message) {
            Ok(reset) => info!(job_id, reset, "Reset in-flight items to pending"),
            Err(e) => {
                error!(job_id, error = %format!("{:#}", e), "Cleanup failed: could not reset items")
            }
        }
        if let Err(e) = aggregator::fail_job(&conn, job_id, &err.to_string()) {
            error!(
                job_id,
                error = %format!("{:#}", e),
                "Cleanup failed: could not mark job failed"
            );
        }
    }

    /// JSON invocation boundary.
    ///
    /// Takes `{"family_id": ..., "job_id": ...}`. Returns 200 with
    /// `{success, processed, failed, message}`, or 500 with
    /// `{error, success: false, recovery_available: true}` on a malformed
    /// payload or a fatal error.
    pub async fn invoke(&self, payload: serde_json::Value) -> InvocationResponse {
        let result = match serde_json::from_value::<ProcessRequest>(payload) {
            Ok(request) => self.process(&request).await,
            Err(e) => {
                warn!(error = %e, "Malformed invocation payload");
                Err(QueueError::InvalidRequest(e.to_string()))
            }
        };

        match result {
            Ok(summary) => InvocationResponse {
                status: 200,
                body: json!({
                    "success": summary.success,
                    "processed": summary.processed,
                    "failed": summary.failed,
                    "message": summary.message,
                }),
            },
            Err(e) => InvocationResponse {
                status: 500,
                body: json!({
                    "error": e.to_string(),
                    "success": false,
                    "recovery_available": true,
                }),
            },
        }
    }
}
