use serde::{Deserialize, Serialize};

use crate::error::ServiceErrorKind;
use crate::policy::BatchClass;
use crate::types::{JobStatus, OutputCounts};

/// Emitted when a batch has been selected and is about to run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchStartedEvent {
    pub family_id: String,
    pub class: BatchClass,
    pub sequential: bool,
    pub item_ids: Vec<String>,
    pub avg_tokens: f64,
}

/// Emitted when an attempt opens its status record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemStartedEvent {
    pub item_id: String,
    pub document_id: String,
    pub record_id: i64,
}

/// Emitted when an item completes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemCompletedEvent {
    pub item_id: String,
    pub document_id: String,
    pub counts: OutputCounts,
    pub processing_time_ms: u64,
}

/// Emitted when an attempt fails, whether or not the item will be retried.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemFailedEvent {
    pub item_id: String,
    pub document_id: String,
    pub kind: Option<ServiceErrorKind>,
    pub retry_count: u32,
    pub will_retry: bool,
    pub error: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BackoffKind {
    InterItem,
    BatchCooldown,
}

/// Emitted before the scheduler sleeps.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackoffEvent {
    pub kind: BackoffKind,
    pub delay_ms: u64,
    pub consecutive_rate_limits: u32,
}

/// Emitted after a batch's outcomes are added to the job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobProgressEvent {
    pub job_id: String,
    pub processed_documents: u64,
    pub failed_documents: u64,
    pub total_documents: u64,
    pub estimated_minutes: Option<u64>,
}

/// Emitted when a job reaches a terminal status.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobFinalizedEvent {
    pub job_id: String,
    pub status: JobStatus,
}

/// Emitted when a run stops before the queue drained.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunHaltedEvent {
    pub family_id: String,
    pub job_id: Option<String>,
    pub reason: String,
}

/// Every event the processor broadcasts to subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ProcessorEvent {
    BatchStarted(BatchStartedEvent),
    ItemStarted(ItemStartedEvent),
    ItemCompleted(ItemCompletedEvent),
    ItemFailed(ItemFailedEvent),
    BackoffApplied(BackoffEvent),
    JobProgress(JobProgressEvent),
    JobFinalized(JobFinalizedEvent),
    RunHalted(RunHaltedEvent),
}
