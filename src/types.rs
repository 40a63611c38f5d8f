use serde::{Deserialize, Serialize};

/// Queue item lifecycle: Pending -> Processing -> Completed/Failed.
///
/// A retryable failure moves a Processing item back to Pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueItemStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl QueueItemStatus {
    pub fn as_str(&self) -> &str {
        match self {
            QueueItemStatus::Pending => "pending",
            QueueItemStatus::Processing => "processing",
            QueueItemStatus::Completed => "completed",
            QueueItemStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(QueueItemStatus::Pending),
            "processing" => Some(QueueItemStatus::Processing),
            "completed" => Some(QueueItemStatus::Completed),
            "failed" => Some(QueueItemStatus::Failed),
            _ => None,
        }
    }
}

/// One document's unit of extraction + analysis work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: String,
    pub job_id: String,
    pub family_id: String,
    pub document_id: String,
    pub status: QueueItemStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub estimated_tokens: Option<u64>,
    pub error_message: Option<String>,
    pub processing_time_ms: Option<u64>,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
}

/// An item waiting to be enqueued.
///
/// Unset fields fall back to the processor configuration at enqueue time.
#[derive(Debug, Clone)]
pub struct NewQueueItem {
    pub id: String,
    pub job_id: String,
    pub family_id: String,
    pub document_id: String,
    pub estimated_tokens: Option<u64>,
    pub max_retries: Option<u32>,
}

impl NewQueueItem {
    /// Create a new item with a generated UUID.
    pub fn new(
        job_id: impl Into<String>,
        family_id: impl Into<String>,
        document_id: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            job_id: job_id.into(),
            family_id: family_id.into(),
            document_id: document_id.into(),
            estimated_tokens: None,
            max_retries: None,
        }
    }

    pub fn with_estimated_tokens(mut self, tokens: u64) -> Self {
        self.estimated_tokens = Some(tokens);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }
}

/// Phase of a single processing attempt, as recorded in the status ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisStatus {
    Extracting,
    Analyzing,
    Complete,
    Failed,
}

impl AnalysisStatus {
    pub fn as_str(&self) -> &str {
        match self {
            AnalysisStatus::Extracting => "extracting",
            AnalysisStatus::Analyzing => "analyzing",
            AnalysisStatus::Complete => "complete",
            AnalysisStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "extracting" => Some(AnalysisStatus::Extracting),
            "analyzing" => Some(AnalysisStatus::Analyzing),
            "complete" => Some(AnalysisStatus::Complete),
            "failed" => Some(AnalysisStatus::Failed),
            _ => None,
        }
    }
}

/// One row per processing attempt. A retried item produces a new record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisStatusRecord {
    pub id: i64,
    pub job_id: String,
    pub document_id: String,
    pub family_id: String,
    pub document_name: String,
    pub status: AnalysisStatus,
    pub status_message: Option<String>,
    pub started_at: String,
    pub completed_at: Option<String>,
    pub metrics_extracted: Option<u64>,
    pub insights_extracted: Option<u64>,
    pub error_message: Option<String>,
}

/// Aggregate job status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Completed,
    CompletedWithErrors,
    /// Halted before the queue drained (exhausted credits, persistent
    /// rate limiting, or a fatal processor error).
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &str {
        match self {
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::CompletedWithErrors => "completed_with_errors",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(JobStatus::Running),
            "completed" => Some(JobStatus::Completed),
            "completed_with_errors" => Some(JobStatus::CompletedWithErrors),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Running)
    }
}

/// The aggregate unit for "process all of family X's current backlog".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub family_id: String,
    pub status: JobStatus,
    pub total_documents: u64,
    pub processed_documents: u64,
    pub failed_documents: u64,
    pub avg_minutes_per_doc: Option<f64>,
    pub estimated_minutes: Option<u64>,
    pub error_message: Option<String>,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
}

/// Per-status item counts for one family.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub avg_processing_time_ms: Option<f64>,
}

impl QueueStats {
    /// True when nothing is waiting or in flight.
    pub fn is_drained(&self) -> bool {
        self.pending == 0 && self.processing == 0
    }
}

/// Counts read back from the analysis service's storage after a success.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputCounts {
    pub metrics: u64,
    pub insights: u64,
}

/// Invocation payload: which family to drain, and optionally which job to
/// report progress against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessRequest {
    pub family_id: String,
    #[serde(default)]
    pub job_id: Option<String>,
}

impl ProcessRequest {
    pub fn new(family_id: impl Into<String>) -> Self {
        Self {
            family_id: family_id.into(),
            job_id: None,
        }
    }

    pub fn with_job_id(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }
}

/// Successful invocation result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessSummary {
    pub success: bool,
    pub processed: u64,
    pub failed: u64,
    pub message: String,
}

/// Status code and JSON body returned at the invocation boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationResponse {
    pub status: u16,
    pub body: serde_json::Value,
}

impl InvocationResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}
