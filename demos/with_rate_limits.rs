//! Show retry and backoff behaviour with an analysis service that throttles.
//!
//! Every third analysis call is rejected with a rate limit and one document
//! always times out, so the run ends `completed_with_errors`.
//!
//! ```sh
//! cargo run --example with_rate_limits
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use analysis_queue::telemetry::init_tracing;
use analysis_queue::*;

struct Extraction;

impl ExtractionService for Extraction {
    async fn extract(
        &self,
        document_id: &str,
        _force_re_extract: bool,
    ) -> Result<(), ServiceError> {
        if document_id == "scanned-fax" {
            return Err(ServiceError::timeout("vision model did not answer in time"));
        }
        Ok(())
    }
}

#[derive(Default)]
struct ThrottledAnalysis {
    calls: AtomicUsize,
}

impl AnalysisService for ThrottledAnalysis {
    async fn analyze(&self, _document_id: &str, _bypass_limit: bool) -> Result<(), ServiceError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if n % 3 == 0 {
            return Err(ServiceError::rate_limited("429 Too Many Requests"));
        }
        Ok(())
    }

    async fn output_counts(&self, _document_id: &str) -> Result<OutputCounts, ServiceError> {
        Ok(OutputCounts {
            metrics: 5,
            insights: 1,
        })
    }
}

#[tokio::main]
async fn main() -> Result<(), QueueError> {
    init_tracing();

    let config = ProcessorConfig::builder()
        .with_item_delays(Duration::from_millis(50), Duration::from_millis(100))
        .with_batch_cooldowns(Duration::from_millis(150), Duration::from_millis(50))
        .with_rate_limit_backoff(Duration::from_millis(250), Duration::from_millis(250))
        .with_max_backoff(Duration::from_secs(1))
        .with_default_max_retries(2)
        .with_large_batch_size(2)
        .build();
    let processor = QueueProcessor::new(config, Extraction, ThrottledAnalysis::default())?;

    let family_id = "family-throttled";
    let docs = ["k1-partnership", "scanned-fax", "property-tax", "hsa-5498", "charity-receipts"];
    let job_id = processor.create_job(family_id, docs.len() as u64)?;
    for document_id in docs {
        processor.register_document(document_id, family_id, &format!("{}.pdf", document_id))?;
        processor.enqueue(NewQueueItem::new(&job_id, family_id, document_id))?;
    }

    let response = processor
        .invoke(serde_json::json!({ "family_id": family_id, "job_id": job_id }))
        .await;
    println!("{} {}", response.status, response.body);

    for item in processor.list_items(family_id)? {
        println!(
            "{:<18} {:<10} retries={} {}",
            item.document_id,
            item.status.as_str(),
            item.retry_count,
            item.error_message.unwrap_or_default()
        );
    }
    Ok(())
}
