//! # Analysis Queue
//!
//! Rate-limit aware processor that drains a family's document queue through
//! two external services: text extraction, then AI analysis.
//!
//! ## Features
//!
//! - SQLite persistence with atomic claim-on-fetch and crash recovery
//! - Cost-aware batching: cheap documents run concurrently, expensive ones
//!   run one at a time with slower pacing
//! - Typed retry classification (rate limit, timeout, payment required)
//! - Linear backoff keyed off consecutive rate limits, reset on success
//! - Per-attempt status ledger and live job progress with ETA
//! - Exactly-once job finalization
//!
//! ## Quick Start
//!
//! 1. Implement [`ExtractionService`] and [`AnalysisService`] (or use
//!    [`HttpServiceClient`])
//! 2. Create a [`QueueProcessor`] with a [`ProcessorConfig`]
//! 3. Register documents, create a job and enqueue items
//! 4. Call [`QueueProcessor::process()`] or [`QueueProcessor::invoke()`]
//!
//! See the `demos/` directory for complete usage examples.

pub mod aggregator;
pub mod client;
pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod executor;
pub mod ledger;
pub mod policy;
pub mod processor;
pub mod telemetry;
pub mod types;

pub use client::HttpServiceClient;
pub use config::{ProcessorConfig, ProcessorConfigBuilder};
pub use error::{QueueError, ServiceError, ServiceErrorKind};
pub use events::{BackoffKind, ProcessorEvent};
pub use policy::BatchClass;
pub use processor::QueueProcessor;
pub use types::{
    AnalysisStatus, AnalysisStatusRecord, InvocationResponse, Job, JobStatus, NewQueueItem,
    OutputCounts, ProcessRequest, ProcessSummary, QueueItem, QueueItemStatus, QueueStats,
};

use std::future::Future;

/// The text extraction stage.
///
/// Success means the service persisted the extracted text on its side; the
/// processor never sees it. Failures must carry a [`ServiceErrorKind`] so
/// the scheduler can decide whether to retry.
///
/// # Example
///
/// ```ignore
/// use analysis_queue::*;
///
/// struct LocalOcr;
///
/// impl ExtractionService for LocalOcr {
///     async fn extract(&self, document_id: &str, _force: bool) -> Result<(), ServiceError> {
///         run_ocr(document_id).map_err(|e| ServiceError::other(e.to_string()))
///     }
/// }
/// ```
pub trait ExtractionService: Send + Sync {
    fn extract(
        &self,
        document_id: &str,
        force_re_extract: bool,
    ) -> impl Future<Output = Result<(), ServiceError>> + Send;
}

/// The AI analysis stage.
pub trait AnalysisService: Send + Sync {
    /// Analyze a document whose text has been extracted.
    fn analyze(
        &self,
        document_id: &str,
        bypass_limit: bool,
    ) -> impl Future<Output = Result<(), ServiceError>> + Send;

    /// Count the metrics and insights stored for a document.
    ///
    /// Read after a successful [`analyze`](Self::analyze); a failure here
    /// does not fail the item, the counts are recorded as zero.
    fn output_counts(
        &self,
        document_id: &str,
    ) -> impl Future<Output = Result<OutputCounts, ServiceError>> + Send;
}
