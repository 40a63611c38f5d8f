use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::future::join_all;
use rusqlite::Connection;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::{
    aggregator::{self, Finalization},
    config::ProcessorConfig,
    db,
    error::{QueueError, ServiceError, ServiceErrorKind},
    events::*,
    ledger,
    policy::{self, BatchPlan, RateLimitTracker, RetryDecision},
    types::{OutputCounts, QueueItem},
    AnalysisService, ExtractionService,
};

/// Why a run stopped before the queue drained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HaltReason {
    PaymentRequired,
    PersistentRateLimiting { consecutive: u32 },
}

impl HaltReason {
    /// Message stored on the halted job.
    pub fn job_message(&self) -> &'static str {
        match self {
            HaltReason::PaymentRequired => {
                "Analysis paused: Insufficient AI credits. Add credits and retry."
            }
            HaltReason::PersistentRateLimiting { .. } => {
                "Persistent rate limiting detected. API may be unavailable. Please try again later."
            }
        }
    }
}

impl fmt::Display for HaltReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HaltReason::PaymentRequired => write!(f, "payment required"),
            HaltReason::PersistentRateLimiting { consecutive } => {
                write!(f, "{} consecutive rate limits", consecutive)
            }
        }
    }
}

/// Outcome totals of one drain of a family's queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunTotals {
    pub processed: u64,
    pub failed: u64,
    pub batches: u64,
    pub halted: Option<HaltReason>,
}

#[derive(Debug, Clone, Copy, Default)]
struct BatchCounts {
    processed: u64,
    failed: u64,
}

impl BatchCounts {
    fn tally(&mut self, outcome: &ItemOutcome) {
        match outcome {
            ItemOutcome::Completed => self.processed += 1,
            ItemOutcome::Failed { .. } => self.failed += 1,
            ItemOutcome::Retrying { .. } => {}
        }
    }
}

/// What happened to one item in one attempt.
#[derive(Debug, Clone, PartialEq)]
enum ItemOutcome {
    Completed,
    Retrying { kind: ServiceErrorKind },
    /// `kind` is `None` when the attempt never reached a service.
    Failed { kind: Option<ServiceErrorKind> },
}

impl ItemOutcome {
    fn kind(&self) -> Option<ServiceErrorKind> {
        match self {
            ItemOutcome::Completed => None,
            ItemOutcome::Retrying { kind } => Some(*kind),
            ItemOutcome::Failed { kind } => *kind,
        }
    }
}

/// State carried across the batches of a single run.
#[derive(Debug, Default)]
struct RunState {
    rate_limits: RateLimitTracker,
    totals: RunTotals,
}

impl RunState {
    /// Fold an item outcome into the rate-limit counter and report whether
    /// the run must stop.
    fn observe(&mut self, outcome: &ItemOutcome, config: &ProcessorConfig) -> Option<HaltReason> {
        match outcome.kind() {
            Some(ServiceErrorKind::RateLimited) => {
                self.rate_limits.record_rate_limit();
                warn!(
                    consecutive = self.rate_limits.consecutive(),
                    "Rate limit hit"
                );
            }
            Some(ServiceErrorKind::PaymentRequired) => return Some(HaltReason::PaymentRequired),
            _ => {}
        }
        if matches!(outcome, ItemOutcome::Completed) {
            self.rate_limits.record_success();
        }
        if self
            .rate_limits
            .limit_reached(config.max_consecutive_rate_limits)
        {
            return Some(HaltReason::PersistentRateLimiting {
                consecutive: self.rate_limits.consecutive(),
            });
        }
        None
    }
}

#[derive(Debug, Clone, Copy)]
enum Stage {
    Extraction,
    Analysis,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Extraction => write!(f, "Extraction"),
            Stage::Analysis => write!(f, "Analysis"),
        }
    }
}

enum AttemptError {
    Service(Stage, ServiceError),
    Store(QueueError),
}

impl From<QueueError> for AttemptError {
    fn from(err: QueueError) -> Self {
        AttemptError::Store(err)
    }
}

impl From<anyhow::Error> for AttemptError {
    fn from(err: anyhow::Error) -> Self {
        AttemptError::Store(err.into())
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

/// The batch scheduler.
///
/// Drains one family's pending items batch by batch: claims a batch,
/// picks sequential or parallel execution from its estimated cost, drives
/// each item through extraction and analysis, records the outcome, and
/// paces itself with per-item delays and per-batch cooldowns.
pub struct QueueExecutor<E, A> {
    config: ProcessorConfig,
    db: Arc<Mutex<Connection>>,
    extraction: E,
    analysis: A,
    events: broadcast::Sender<ProcessorEvent>,
}

impl<E, A> QueueExecutor<E, A>
where
    E: ExtractionService,
    A: AnalysisService,
{
    pub fn new(
        config: ProcessorConfig,
        db: Arc<Mutex<Connection>>,
        extraction: E,
        analysis: A,
        events: broadcast::Sender<ProcessorEvent>,
    ) -> Self {
        Self {
            config,
            db,
            extraction,
            analysis,
            events,
        }
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, QueueError> {
        self.db.lock().map_err(|e| QueueError::Other(e.to_string()))
    }

    fn emit(&self, event: ProcessorEvent) {
        let _ = self.events.send(event);
    }

    /// Drain the family's queue until a fetch comes back empty or a halt
    /// condition stops the run.
    ///
    /// Per-item failures are recorded and never returned; an `Err` means the
    /// store itself failed.
    pub async fn run(
        &self,
        family_id: &str,
        job_id: Option<&str>,
    ) -> Result<RunTotals, QueueError> {
        let mut state = RunState::default();

        loop {
            let fetched = {
                let mut conn = self.conn()?;
                db::claim_next_batch(&mut conn, family_id, self.config.batch_limit())?
            };
            if fetched.is_empty() {
                info!(family_id, "No more items in queue");
                break;
            }

            let plan = BatchPlan::from_fetched(fetched, &self.config);
            if !plan.deferred.is_empty() {
                let ids: Vec<String> = plan.deferred.iter().map(|i| i.id.clone()).collect();
                let conn = self.conn()?;
                db::release_items(&conn, &ids)?;
            }

            let sequential = plan.is_sequential();
            info!(
                family_id,
                size = plan.selected.len(),
                class = ?plan.class,
                avg_tokens = plan.avg_tokens.round() as u64,
                sequential,
                "Processing batch"
            );
            self.emit(ProcessorEvent::BatchStarted(BatchStartedEvent {
                family_id: family_id.to_string(),
                class: plan.class,
                sequential,
                item_ids: plan.selected.iter().map(|i| i.id.clone()).collect(),
                avg_tokens: plan.avg_tokens,
            }));

            let batch = if sequential {
                self.run_sequential(&plan, &mut state).await?
            } else {
                self.run_parallel(&plan, &mut state).await?
            };

            state.totals.processed += batch.processed;
            state.totals.failed += batch.failed;
            state.totals.batches += 1;
            info!(
                family_id,
                succeeded = batch.processed,
                failed = batch.failed,
                "Batch complete"
            );

            if let Some(job_id) = job_id {
                self.record_progress(job_id, batch)?;
            }

            if let Some(reason) = state.totals.halted.clone() {
                self.halt(family_id, job_id, &reason)?;
                break;
            }

            let cooldown =
                policy::batch_cooldown(&self.config, plan.class, state.rate_limits.consecutive());
            self.pause(BackoffKind::BatchCooldown, cooldown, state.rate_limits.consecutive())
                .await;
        }

        Ok(state.totals)
    }

    /// One item at a time, with an inter-item delay between items.
    async fn run_sequential(
        &self,
        plan: &BatchPlan,
        state: &mut RunState,
    ) -> Result<BatchCounts, QueueError> {
        let mut counts = BatchCounts::default();

        for (idx, item) in plan.selected.iter().enumerate() {
            let outcome = self.process_item(item).await?;
            counts.tally(&outcome);

            if let Some(reason) = state.observe(&outcome, &self.config) {
                let rest: Vec<String> = plan.selected[idx + 1..]
                    .iter()
                    .map(|i| i.id.clone())
                    .collect();
                if !rest.is_empty() {
                    let conn = self.conn()?;
                    db::release_items(&conn, &rest)?;
                }
                state.totals.halted = Some(reason);
                break;
            }

            if idx + 1 < plan.selected.len() {
                let consecutive = state.rate_limits.consecutive();
                let delay = policy::inter_item_delay(&self.config, plan.class, consecutive);
                self.pause(BackoffKind::InterItem, delay, consecutive).await;
            }
        }

        Ok(counts)
    }

    /// All items at once; waits for every sibling to settle.
    async fn run_parallel(
        &self,
        plan: &BatchPlan,
        state: &mut RunState,
    ) -> Result<BatchCounts, QueueError> {
        debug!(size = plan.selected.len(), "Processing small documents in parallel");
        let results = join_all(plan.selected.iter().map(|item| self.process_item(item))).await;

        let mut counts = BatchCounts::default();
        let mut fatal = None;
        for result in results {
            match result {
                Ok(outcome) => {
                    counts.tally(&outcome);
                    if let Some(reason) = state.observe(&outcome, &self.config) {
                        state.totals.halted.get_or_insert(reason);
                    }
                }
                Err(e) => {
                    error!(error = %e, "Store failure during parallel batch");
                    fatal.get_or_insert(e);
                }
            }
        }

        match fatal {
            Some(e) => Err(e),
            None => Ok(counts),
        }
    }

    /// Run one attempt for one claimed item and persist its outcome.
    async fn process_item(&self, item: &QueueItem) -> Result<ItemOutcome, QueueError> {
        let started = Instant::now();

        let document_name = {
            let conn = self.conn()?;
            db::document_name(&conn, &item.document_id)?
        };
        let Some(document_name) = document_name else {
            warn!(
                item_id = %item.id,
                document_id = %item.document_id,
                "Document not found (may have been deleted)"
            );
            {
                let conn = self.conn()?;
                db::fail_item(&conn, &item.id, db::MISSING_DOCUMENT, elapsed_ms(started))?;
            }
            self.emit(ProcessorEvent::ItemFailed(ItemFailedEvent {
                item_id: item.id.clone(),
                document_id: item.document_id.clone(),
                kind: None,
                retry_count: item.retry_count,
                will_retry: false,
                error: db::MISSING_DOCUMENT.to_string(),
            }));
            return Ok(ItemOutcome::Failed { kind: None });
        };

        let record_id = {
            let conn = self.conn()?;
            ledger::begin_attempt(&conn, item, &document_name)?
        };
        self.emit(ProcessorEvent::ItemStarted(ItemStartedEvent {
            item_id: item.id.clone(),
            document_id: item.document_id.clone(),
            record_id,
        }));

        match self.run_stages(item, record_id).await {
            Ok(counts) => {
                let processing_time_ms = elapsed_ms(started);
                {
                    let mut conn = self.conn()?;
                    db::record_success(&mut conn, &item.id, record_id, counts, processing_time_ms)?;
                }
                info!(
                    item_id = %item.id,
                    document_id = %item.document_id,
                    processing_time_ms,
                    "Completed"
                );
                self.emit(ProcessorEvent::ItemCompleted(ItemCompletedEvent {
                    item_id: item.id.clone(),
                    document_id: item.document_id.clone(),
                    counts,
                    processing_time_ms,
                }));
                Ok(ItemOutcome::Completed)
            }
            Err(AttemptError::Store(e)) => Err(e),
            Err(AttemptError::Service(stage, err)) => {
                let processing_time_ms = elapsed_ms(started);
                let message = format!("{} failed: {}", stage, err);
                let decision = RetryDecision::for_failure(item, &err, &message);
                {
                    let mut conn = self.conn()?;
                    db::record_failure(
                        &mut conn,
                        &item.id,
                        record_id,
                        &decision,
                        processing_time_ms,
                    )?;
                }

                if decision.will_retry() {
                    info!(
                        item_id = %item.id,
                        kind = ?err.kind,
                        attempt = decision.retry_count,
                        max_retries = item.max_retries,
                        "Queued for retry"
                    );
                } else {
                    warn!(
                        item_id = %item.id,
                        kind = ?err.kind,
                        error = %decision.queue_message,
                        "Marking as permanently failed"
                    );
                }
                self.emit(ProcessorEvent::ItemFailed(ItemFailedEvent {
                    item_id: item.id.clone(),
                    document_id: item.document_id.clone(),
                    kind: Some(err.kind),
                    retry_count: decision.retry_count,
                    will_retry: decision.will_retry(),
                    error: decision.queue_message.clone(),
                }));

                Ok(if decision.will_retry() {
                    ItemOutcome::Retrying { kind: err.kind }
                } else {
                    ItemOutcome::Failed {
                        kind: Some(err.kind),
                    }
                })
            }
        }
    }

    async fn run_stages(
        &self,
        item: &QueueItem,
        record_id: i64,
    ) -> Result<OutputCounts, AttemptError> {
        debug!(document_id = %item.document_id, "Extracting");
        self.extraction
            .extract(&item.document_id, self.config.force_re_extract)
            .await
            .map_err(|e| AttemptError::Service(Stage::Extraction, e))?;

        {
            let conn = self.conn()?;
            ledger::mark_analyzing(&conn, record_id)?;
        }

        debug!(document_id = %item.document_id, "Analyzing");
        self.analysis
            .analyze(&item.document_id, self.config.bypass_limit)
            .await
            .map_err(|e| AttemptError::Service(Stage::Analysis, e))?;

        match self.analysis.output_counts(&item.document_id).await {
            Ok(counts) => Ok(counts),
            Err(e) => {
                warn!(
                    document_id = %item.document_id,
                    error = %e,
                    "Could not read output counts, recording zero"
                );
                Ok(OutputCounts::default())
            }
        }
    }

    fn record_progress(&self, job_id: &str, batch: BatchCounts) -> Result<(), QueueError> {
        let job = {
            let conn = self.conn()?;
            aggregator::record_batch(
                &conn,
                job_id,
                batch.processed,
                batch.failed,
                chrono::Utc::now(),
            )?
        };
        match job {
            Some(job) => self.emit(ProcessorEvent::JobProgress(JobProgressEvent {
                job_id: job.id,
                processed_documents: job.processed_documents,
                failed_documents: job.failed_documents,
                total_documents: job.total_documents,
                estimated_minutes: job.estimated_minutes,
            })),
            None => warn!(job_id, "Job not found; progress not recorded"),
        }
        Ok(())
    }

    fn halt(
        &self,
        family_id: &str,
        job_id: Option<&str>,
        reason: &HaltReason,
    ) -> Result<(), QueueError> {
        warn!(family_id, reason = %reason, "Stopping run");
        if let Some(job_id) = job_id {
            let conn = self.conn()?;
            aggregator::fail_job(&conn, job_id, reason.job_message())?;
        }
        self.emit(ProcessorEvent::RunHalted(RunHaltedEvent {
            family_id: family_id.to_string(),
            job_id: job_id.map(str::to_string),
            reason: reason.to_string(),
        }));
        Ok(())
    }

    /// Finalize the job if the family's queue is drained.
    pub fn finalize(&self, family_id: &str, job_id: &str) -> Result<Finalization, QueueError> {
        let result = {
            let conn = self.conn()?;
            let stats = db::queue_stats(&conn, family_id)?;
            aggregator::finalize(&conn, job_id, &stats)?
        };

        match &result {
            Finalization::Finalized(status) => {
                info!(job_id, status = status.as_str(), "Job complete");
                self.emit(ProcessorEvent::JobFinalized(JobFinalizedEvent {
                    job_id: job_id.to_string(),
                    status: *status,
                }));
            }
            Finalization::AlreadyTerminal(status) => {
                info!(job_id, status = status.as_str(), "Job already finalized, leaving as is");
            }
            Finalization::Deferred {
                pending,
                processing,
            } => {
                debug!(job_id, pending, processing, "Items remain, job stays running");
            }
            Finalization::Missing => warn!(job_id, "Job not found; nothing to finalize"),
        }
        Ok(result)
    }

    async fn pause(&self, kind: BackoffKind, delay: Duration, consecutive_rate_limits: u32) {
        if delay.is_zero() {
            return;
        }
        info!(?kind, delay_secs = delay.as_secs_f64(), "Backing off");
        self.emit(ProcessorEvent::BackoffApplied(BackoffEvent {
            kind,
            delay_ms: delay.as_millis() as u64,
            consecutive_rate_limits,
        }));
        tokio::time::sleep(delay).await;
    }
}
