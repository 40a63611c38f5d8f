//! Drain a small family queue against in-process fake services.
//!
//! ```sh
//! RUST_LOG=debug cargo run --example basic_run
//! ```

use std::time::Duration;

use analysis_queue::telemetry::init_tracing;
use analysis_queue::*;

struct FakeExtraction;

impl ExtractionService for FakeExtraction {
    async fn extract(
        &self,
        _document_id: &str,
        _force_re_extract: bool,
    ) -> Result<(), ServiceError> {
        tokio::time::sleep(Duration::from_millis(200)).await;
        Ok(())
    }
}

struct FakeAnalysis;

impl AnalysisService for FakeAnalysis {
    async fn analyze(&self, _document_id: &str, _bypass_limit: bool) -> Result<(), ServiceError> {
        tokio::time::sleep(Duration::from_millis(300)).await;
        Ok(())
    }

    async fn output_counts(&self, document_id: &str) -> Result<OutputCounts, ServiceError> {
        Ok(OutputCounts {
            metrics: document_id.len() as u64,
            insights: 2,
        })
    }
}

#[tokio::main]
async fn main() -> Result<(), QueueError> {
    init_tracing();

    let config = ProcessorConfig::builder()
        .with_item_delays(Duration::from_millis(100), Duration::from_millis(200))
        .with_batch_cooldowns(Duration::from_millis(300), Duration::from_millis(100))
        .build();
    let processor = QueueProcessor::new(config, FakeExtraction, FakeAnalysis)?;
    let mut events = processor.subscribe();

    let family_id = "family-demo";
    let docs = [
        ("w2-2023", 1200),
        ("1099-int", 900),
        ("brokerage-statement", 14000),
        ("mortgage-1098", 1500),
    ];
    let job_id = processor.create_job(family_id, docs.len() as u64)?;
    for (document_id, tokens) in docs {
        processor.register_document(document_id, family_id, &format!("{}.pdf", document_id))?;
        processor.enqueue(
            NewQueueItem::new(&job_id, family_id, document_id).with_estimated_tokens(tokens),
        )?;
    }

    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let Ok(line) = serde_json::to_string(&event) {
                println!("{}", line);
            }
        }
    });

    let summary = processor
        .process(&ProcessRequest::new(family_id).with_job_id(&job_id))
        .await?;
    println!("{}", summary.message);

    if let Some(job) = processor.get_job(&job_id)? {
        println!(
            "job {} -> {} ({} processed, {} failed)",
            job.id,
            job.status.as_str(),
            job.processed_documents,
            job.failed_documents
        );
    }

    drop(processor);
    let _ = printer.await;
    Ok(())
}
