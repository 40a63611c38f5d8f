
use analysis_queue::*;
use serde_json::json;
use tempfile::tempdir;
use test_helpers::*;

const FAMILY: &str = "family-1";

fn request(job_id: &str) -> ProcessRequest {
    ProcessRequest::new(FAMILY).with_job_id(job_id)
}

#[test]
fn test_processor_creation_in_memory() {
    let services = ScriptedServices::new();
    let processor = QueueProcessor::new(ProcessorConfig::default(), services.clone(), services);
    assert!(processor.is_ok());
}

#[test]
fn test_processor_creation_with_db() {
    let temp = tempdir().unwrap();
    let config = ProcessorConfig::builder()
        .with_db_path(temp.path().join("analysis.db"))
        .build();
    let services = ScriptedServices::new();
    assert!(QueueProcessor::new(config, services.clone(), services).is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_drains_every_pending_item() {
    let services = ScriptedServices::new();
    let processor = processor(ProcessorConfig::default(), &services);
    let docs: Vec<(String, Option<u64>)> =
        (1..=5).map(|n| (format!("doc-{}", n), Some(100))).collect();
    let docs: Vec<(&str, Option<u64>)> = docs.iter().map(|(d, t)| (d.as_str(), *t)).collect();
    let job_id = seed(&processor, FAMILY, &docs);
    services.set_counts("doc-1", 4, 2);

    let summary = processor.process(&request(&job_id)).await.unwrap();
    assert!(summary.success);
    assert_eq!(summary.processed, 5);
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.message, "Queue processing complete: 5 succeeded, 0 failed");

    for item in processor.list_items(FAMILY).unwrap() {
        assert_eq!(item.status, QueueItemStatus::Completed);
        assert_eq!(item.retry_count, 0);
        assert!(item.completed_at.is_some());
        assert!(item.processing_time_ms.is_some());
    }

    let job = processor.get_job(&job_id).unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.processed_documents, 5);
    assert_eq!(job.estimated_minutes, Some(0));

    let records = processor.status_records_for_document("doc-1").unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, AnalysisStatus::Complete);
    assert_eq!(records[0].document_name, "doc-1.pdf");
    assert_eq!(records[0].metrics_extracted, Some(4));
    assert_eq!(records[0].insights_extracted, Some(2));
    assert_eq!(processor.status_records_for_job(&job_id).unwrap().len(), 5);
    assert!(processor.queue_stats(FAMILY).unwrap().is_drained());
}

#[tokio::test(start_paused = true)]
async fn test_small_batch_runs_concurrently() {
    let services = ScriptedServices::new().with_latency(secs(5));
    let processor = processor(ProcessorConfig::default(), &services);
    let job_id = seed(
        &processor,
        FAMILY,
        &[("a", Some(1000)), ("b", Some(1200)), ("c", Some(900))],
    );
    let mut rx = processor.subscribe();

    let summary = processor.process(&request(&job_id)).await.unwrap();
    assert_eq!(summary.processed, 3);
    assert_eq!(services.max_in_flight(), 3);

    let events = drain_events(&mut rx);
    let started: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            ProcessorEvent::BatchStarted(b) => Some(b),
            _ => None,
        })
        .collect();
    assert_eq!(started.len(), 1);
    assert_eq!(started[0].class, BatchClass::Small);
    assert!(!started[0].sequential);
    assert_eq!(started[0].item_ids, vec!["item-a", "item-b", "item-c"]);

    // One cooldown after the single small batch, no per-item pacing
    assert_eq!(backoffs(&events), vec![(BackoffKind::BatchCooldown, secs(30))]);

    let job = processor.get_job(&job_id).unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.processed_documents, 3);
}

#[tokio::test(start_paused = true)]
async fn test_large_batch_runs_strictly_sequentially() {
    let services = ScriptedServices::new().with_latency(secs(5));
    let config = ProcessorConfig::builder().with_large_batch_size(3).build();
    let processor = processor(config, &services);
    let job_id = seed(
        &processor,
        FAMILY,
        &[("a", Some(8000)), ("b", Some(9000)), ("c", Some(7000))],
    );
    let mut rx = processor.subscribe();

    processor.process(&request(&job_id)).await.unwrap();
    assert_eq!(services.max_in_flight(), 1);
    assert_eq!(services.extract_calls(), 3);

    let events = drain_events(&mut rx);
    assert_eq!(
        backoffs(&events),
        vec![
            (BackoffKind::InterItem, secs(20)),
            (BackoffKind::InterItem, secs(20)),
            (BackoffKind::BatchCooldown, secs(10)),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_single_large_item_runs_alone() {
    let services = ScriptedServices::new();
    let processor = processor(ProcessorConfig::default(), &services);
    let job_id = seed(&processor, FAMILY, &[("big", Some(8000))]);
    let mut rx = processor.subscribe();

    let summary = processor.process(&request(&job_id)).await.unwrap();
    assert_eq!(summary.processed, 1);

    let events = drain_events(&mut rx);
    let batch = events.iter().find_map(|e| match e {
        ProcessorEvent::BatchStarted(b) => Some(b),
        _ => None,
    });
    let batch = batch.unwrap();
    assert_eq!(batch.class, BatchClass::Large);
    assert!(batch.sequential);
    // No next item, so no inter-item delay
    assert_eq!(backoffs(&events), vec![(BackoffKind::BatchCooldown, secs(10))]);
    assert_eq!(
        processor.get_job(&job_id).unwrap().unwrap().status,
        JobStatus::Completed
    );
}

#[tokio::test(start_paused = true)]
async fn test_large_batch_defers_the_rest() {
    let services = ScriptedServices::new();
    let processor = processor(ProcessorConfig::default(), &services);
    let job_id = seed(&processor, FAMILY, &[("a", Some(9000)), ("b", Some(9000))]);
    let mut rx = processor.subscribe();

    processor.process(&request(&job_id)).await.unwrap();

    let batches: Vec<Vec<String>> = drain_events(&mut rx)
        .into_iter()
        .filter_map(|e| match e {
            ProcessorEvent::BatchStarted(b) => Some(b.item_ids),
            _ => None,
        })
        .collect();
    assert_eq!(batches, vec![vec!["item-a".to_string()], vec!["item-b".to_string()]]);
}

#[tokio::test(start_paused = true)]
async fn test_retryable_failure_is_bounded_by_max_retries() {
    let services = ScriptedServices::new();
    let processor = processor(ProcessorConfig::default(), &services);
    let job_id = seed(&processor, FAMILY, &[("slow", Some(100))]);
    services.fail_extract_always("slow", ServiceError::timeout("deadline exceeded"));
    let mut rx = processor.subscribe();

    let summary = processor.process(&request(&job_id)).await.unwrap();
    assert_eq!(summary.processed, 0);
    assert_eq!(summary.failed, 1);

    // One first attempt plus max_retries retries
    assert_eq!(services.extract_calls(), 4);
    assert_eq!(services.analyze_calls(), 0);

    let failures: Vec<_> = drain_events(&mut rx)
        .into_iter()
        .filter_map(|e| match e {
            ProcessorEvent::ItemFailed(f) => Some(f),
            _ => None,
        })
        .collect();
    assert_eq!(failures.len(), 4);
    for f in failures.iter().filter(|f| f.will_retry) {
        assert!(f.retry_count <= 3);
    }
    assert_eq!(failures.iter().filter(|f| f.will_retry).count(), 3);
    assert_eq!(failures[0].error, "Timeout. Will retry (1/3)");

    let item = processor.get_item("item-slow").unwrap().unwrap();
    assert_eq!(item.status, QueueItemStatus::Failed);
    assert_eq!(
        item.error_message.as_deref(),
        Some("Max retries (3) exceeded: Extraction failed: deadline exceeded")
    );

    let job = processor.get_job(&job_id).unwrap().unwrap();
    assert_eq!(job.status, JobStatus::CompletedWithErrors);
    assert_eq!(job.failed_documents, 1);
}

#[tokio::test(start_paused = true)]
async fn test_rate_limited_item_with_two_retries() {
    let services = ScriptedServices::new();
    let processor = processor(ProcessorConfig::default(), &services);
    let job_id = processor.create_job(FAMILY, 1).unwrap();
    processor.register_document("doc", FAMILY, "1099.pdf").unwrap();
    processor
        .enqueue(
            NewQueueItem::new(&job_id, FAMILY, "doc")
                .with_id("item-doc")
                .with_max_retries(2),
        )
        .unwrap();
    services.fail_analyze_always("doc", ServiceError::rate_limited("429 Too Many Requests"));
    let mut rx = processor.subscribe();

    processor.process(&request(&job_id)).await.unwrap();

    let events = drain_events(&mut rx);
    let trail: Vec<(u32, bool)> = events
        .iter()
        .filter_map(|e| match e {
            ProcessorEvent::ItemFailed(f) => Some((f.retry_count, f.will_retry)),
            _ => None,
        })
        .collect();
    assert_eq!(trail, vec![(1, true), (2, true), (3, false)]);

    let item = processor.get_item("item-doc").unwrap().unwrap();
    assert_eq!(item.status, QueueItemStatus::Failed);

    let messages: Vec<_> = processor
        .status_records_for_document("doc")
        .unwrap()
        .into_iter()
        .map(|r| (r.status, r.error_message.unwrap_or_default()))
        .collect();
    assert_eq!(
        messages,
        vec![
            (AnalysisStatus::Failed, "Rate limited (429). Auto-retry 1/2".to_string()),
            (AnalysisStatus::Failed, "Rate limited (429). Auto-retry 2/2".to_string()),
            (AnalysisStatus::Failed, "Rate limited (429). Retries exhausted".to_string()),
        ]
    );

    // Every cooldown in a rate-limited run is the rate-limit cooldown
    assert_eq!(
        backoffs(&events),
        vec![(BackoffKind::BatchCooldown, secs(60)); 3]
    );

    assert_eq!(
        processor.get_job(&job_id).unwrap().unwrap().status,
        JobStatus::CompletedWithErrors
    );
}

#[tokio::test(start_paused = true)]
async fn test_rate_limit_backoff_escalates_and_resets() {
    let services = ScriptedServices::new();
    let config = ProcessorConfig::builder()
        .with_max_batch_size(4)
        .with_large_batch_size(4)
        .build();
    let processor = processor(config, &services);
    let job_id = seed(
        &processor,
        FAMILY,
        &[("a", Some(9000)), ("b", Some(9000)), ("c", Some(9000)), ("d", Some(9000))],
    );
    for doc in ["a", "b", "c"] {
        services.script_analyze(doc, vec![Err(ServiceError::rate_limited("429"))]);
    }
    let mut rx = processor.subscribe();

    let summary = processor.process(&request(&job_id)).await.unwrap();
    assert_eq!(summary.processed, 4);
    assert_eq!(summary.failed, 0);

    let events = drain_events(&mut rx);
    assert_eq!(
        backoffs(&events),
        vec![
            (BackoffKind::InterItem, secs(60)),
            (BackoffKind::InterItem, secs(120)),
            (BackoffKind::InterItem, secs(180)),
            // "d" succeeded, back to baseline
            (BackoffKind::BatchCooldown, secs(10)),
            (BackoffKind::InterItem, secs(20)),
            (BackoffKind::InterItem, secs(20)),
            (BackoffKind::BatchCooldown, secs(10)),
        ]
    );

    let item = processor.get_item("item-a").unwrap().unwrap();
    assert_eq!(item.status, QueueItemStatus::Completed);
    assert_eq!(item.retry_count, 1);
}

#[tokio::test(start_paused = true)]
async fn test_rate_limit_delay_is_capped() {
    let services = ScriptedServices::new();
    let config = ProcessorConfig::builder()
        .with_max_batch_size(3)
        .with_large_batch_size(3)
        .with_max_backoff(secs(90))
        .build();
    let processor = processor(config, &services);
    let job_id = seed(
        &processor,
        FAMILY,
        &[("a", Some(9000)), ("b", Some(9000)), ("c", Some(9000))],
    );
    for doc in ["a", "b"] {
        services.script_analyze(doc, vec![Err(ServiceError::rate_limited("429"))]);
    }
    let mut rx = processor.subscribe();

    processor.process(&request(&job_id)).await.unwrap();

    let delays = backoffs(&drain_events(&mut rx));
    assert_eq!(delays[0], (BackoffKind::InterItem, secs(60)));
    assert_eq!(delays[1], (BackoffKind::InterItem, secs(90)));
    assert!(delays.iter().all(|(_, d)| *d <= secs(90)));
}

#[tokio::test(start_paused = true)]
async fn test_reinvocation_leaves_terminal_job_untouched() {
    let services = ScriptedServices::new();
    let processor = processor(ProcessorConfig::default(), &services);
    let job_id = seed(&processor, FAMILY, &[("a", Some(100)), ("b", Some(100))]);

    processor.process(&request(&job_id)).await.unwrap();
    let first = processor.get_job(&job_id).unwrap().unwrap();
    assert_eq!(first.status, JobStatus::Completed);
    let records_before = processor.status_records_for_job(&job_id).unwrap().len();

    let mut rx = processor.subscribe();
    let summary = processor.process(&request(&job_id)).await.unwrap();
    assert_eq!(summary.processed, 0);
    assert_eq!(summary.failed, 0);
    assert!(summary.message.ends_with("Job already completed"));

    let second = processor.get_job(&job_id).unwrap().unwrap();
    assert_eq!(second.status, JobStatus::Completed);
    assert_eq!(second.completed_at, first.completed_at);
    assert_eq!(second.processed_documents, 2);
    assert_eq!(
        processor.status_records_for_job(&job_id).unwrap().len(),
        records_before
    );
    assert!(!drain_events(&mut rx)
        .iter()
        .any(|e| matches!(e, ProcessorEvent::JobFinalized(_))));
}

#[tokio::test(start_paused = true)]
async fn test_sibling_failure_does_not_cancel_parallel_batch() {
    let services = ScriptedServices::new();
    let processor = processor(ProcessorConfig::default(), &services);
    let job_id = seed(&processor, FAMILY, &[("a", Some(100)), ("b", Some(100)), ("c", Some(100))]);
    services.fail_extract_always("b", ServiceError::other("unsupported file type"));

    let summary = processor.process(&request(&job_id)).await.unwrap();
    assert_eq!(summary.processed, 2);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.message, "Queue processing complete: 2 succeeded, 1 failed");

    let b = processor.get_item("item-b").unwrap().unwrap();
    assert_eq!(b.status, QueueItemStatus::Failed);
    assert_eq!(b.retry_count, 1);
    assert_eq!(b.error_message.as_deref(), Some("Extraction failed: unsupported file type"));
    for id in ["item-a", "item-c"] {
        assert_eq!(
            processor.get_item(id).unwrap().unwrap().status,
            QueueItemStatus::Completed
        );
    }

    let job = processor.get_job(&job_id).unwrap().unwrap();
    assert_eq!(job.status, JobStatus::CompletedWithErrors);
    assert_eq!(job.processed_documents, 2);
    assert_eq!(job.failed_documents, 1);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_then_success() {
    let services = ScriptedServices::new();
    let processor = processor(ProcessorConfig::default(), &services);
    let job_id = seed(&processor, FAMILY, &[("doc", Some(100))]);
    services.script_extract("doc", vec![Err(ServiceError::timeout("gateway timeout"))]);

    let summary = processor.process(&request(&job_id)).await.unwrap();
    assert_eq!(summary.processed, 1);
    assert_eq!(summary.failed, 0);

    let item = processor.get_item("item-doc").unwrap().unwrap();
    assert_eq!(item.status, QueueItemStatus::Completed);
    assert_eq!(item.retry_count, 1);

    let statuses: Vec<_> = processor
        .status_records_for_document("doc")
        .unwrap()
        .into_iter()
        .map(|r| r.status)
        .collect();
    assert_eq!(statuses, vec![AnalysisStatus::Failed, AnalysisStatus::Complete]);
    assert_eq!(
        processor.get_job(&job_id).unwrap().unwrap().status,
        JobStatus::Completed
    );
}

#[tokio::test(start_paused = true)]
async fn test_missing_document_fails_without_status_record() {
    let services = ScriptedServices::new();
    let processor = processor(ProcessorConfig::default(), &services);
    let job_id = processor.create_job(FAMILY, 1).unwrap();
    processor
        .enqueue(NewQueueItem::new(&job_id, FAMILY, "deleted-doc").with_id("item-gone"))
        .unwrap();

    let summary = processor.process(&request(&job_id)).await.unwrap();
    assert_eq!(summary.failed, 1);
    assert_eq!(services.extract_calls(), 0);

    let item = processor.get_item("item-gone").unwrap().unwrap();
    assert_eq!(item.status, QueueItemStatus::Failed);
    assert_eq!(
        item.error_message.as_deref(),
        Some("Document not found (may have been deleted)")
    );
    assert!(processor.status_records_for_document("deleted-doc").unwrap().is_empty());
    assert_eq!(
        processor.get_job(&job_id).unwrap().unwrap().status,
        JobStatus::CompletedWithErrors
    );
}

#[tokio::test(start_paused = true)]
async fn test_unavailable_counts_record_zero() {
    let services = ScriptedServices::new();
    services.make_counts_unavailable();
    let processor = processor(ProcessorConfig::default(), &services);
    let job_id = seed(&processor, FAMILY, &[("doc", Some(100))]);

    let summary = processor.process(&request(&job_id)).await.unwrap();
    assert_eq!(summary.processed, 1);

    let record = &processor.status_records_for_document("doc").unwrap()[0];
    assert_eq!(record.status, AnalysisStatus::Complete);
    assert_eq!(record.metrics_extracted, Some(0));
    assert_eq!(record.insights_extracted, Some(0));
}

#[tokio::test(start_paused = true)]
async fn test_payment_required_halts_the_run() {
    let services = ScriptedServices::new();
    let config = ProcessorConfig::builder().with_large_batch_size(3).build();
    let processor = processor(config, &services);
    let job_id = seed(
        &processor,
        FAMILY,
        &[("a", Some(9000)), ("b", Some(9000)), ("c", Some(9000))],
    );
    services.fail_analyze_always("a", ServiceError::payment_required("402 Payment Required"));
    let mut rx = processor.subscribe();

    let summary = processor.process(&request(&job_id)).await.unwrap();
    assert_eq!(summary.processed, 0);
    assert_eq!(summary.failed, 1);
    assert!(summary.message.contains("Insufficient AI credits"));
    assert_eq!(services.extract_calls(), 1);

    let a = processor.get_item("item-a").unwrap().unwrap();
    assert_eq!(a.status, QueueItemStatus::Failed);
    assert_eq!(
        a.error_message.as_deref(),
        Some("Insufficient AI credits. Please add credits to continue.")
    );
    for id in ["item-b", "item-c"] {
        assert_eq!(
            processor.get_item(id).unwrap().unwrap().status,
            QueueItemStatus::Pending
        );
    }

    let record = &processor.status_records_for_document("a").unwrap()[0];
    assert_eq!(
        record.error_message.as_deref(),
        Some("Insufficient AI credits. Please add credits.")
    );

    let job = processor.get_job(&job_id).unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(
        job.error_message.as_deref(),
        Some("Analysis paused: Insufficient AI credits. Add credits and retry.")
    );
    assert_eq!(job.failed_documents, 1);

    let events = drain_events(&mut rx);
    assert!(events.iter().any(|e| matches!(e, ProcessorEvent::RunHalted(_))));
    assert!(!events.iter().any(|e| matches!(e, ProcessorEvent::JobFinalized(_))));
    assert!(backoffs(&events).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_persistent_rate_limiting_halts_the_run() {
    let services = ScriptedServices::new();
    let config = ProcessorConfig::builder()
        .with_default_max_retries(5)
        .with_max_consecutive_rate_limits(2)
        .build();
    let processor = processor(config, &services);
    let job_id = seed(&processor, FAMILY, &[("doc", Some(100))]);
    services.fail_analyze_always("doc", ServiceError::rate_limited("429"));

    let summary = processor.process(&request(&job_id)).await.unwrap();
    assert_eq!(summary.processed, 0);
    assert_eq!(summary.failed, 0);
    assert_eq!(services.analyze_calls(), 2);

    let item = processor.get_item("item-doc").unwrap().unwrap();
    assert_eq!(item.status, QueueItemStatus::Pending);
    assert_eq!(item.retry_count, 2);

    let job = processor.get_job(&job_id).unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(
        job.error_message.as_deref(),
        Some("Persistent rate limiting detected. API may be unavailable. Please try again later.")
    );
}

#[tokio::test(start_paused = true)]
async fn test_progress_events_track_job_counters() {
    let services = ScriptedServices::new();
    let processor = processor(ProcessorConfig::default(), &services);
    let job_id = seed(&processor, FAMILY, &[("a", Some(9000)), ("b", Some(9000))]);
    let mut rx = processor.subscribe();

    processor.process(&request(&job_id)).await.unwrap();

    let progress: Vec<(u64, u64)> = drain_events(&mut rx)
        .into_iter()
        .filter_map(|e| match e {
            ProcessorEvent::JobProgress(p) => Some((p.processed_documents, p.total_documents)),
            _ => None,
        })
        .collect();
    assert_eq!(progress, vec![(1, 2), (2, 2)]);
}

#[tokio::test(start_paused = true)]
async fn test_invoke_returns_summary_payload() {
    let services = ScriptedServices::new();
    let processor = processor(ProcessorConfig::default(), &services);
    let job_id = seed(&processor, FAMILY, &[("doc", Some(100))]);

    let response = processor
        .invoke(json!({ "family_id": FAMILY, "job_id": job_id }))
        .await;
    assert_eq!(response.status, 200);
    assert!(response.is_success());
    assert_eq!(response.body["success"], json!(true));
    assert_eq!(response.body["processed"], json!(1));
    assert_eq!(response.body["failed"], json!(0));
}

#[tokio::test(start_paused = true)]
async fn test_invoke_rejects_malformed_payload() {
    let services = ScriptedServices::new();
    let processor = processor(ProcessorConfig::default(), &services);

    let response = processor.invoke(json!({ "job_id": 5 })).await;
    assert_eq!(response.status, 500);
    assert_eq!(response.body["success"], json!(false));
    assert_eq!(response.body["recovery_available"], json!(true));
    assert!(response.body["error"].as_str().is_some());

    let response = processor.invoke(json!({ "family_id": "  " })).await;
    assert_eq!(response.status, 500);
}

#[tokio::test(start_paused = true)]
async fn test_fatal_store_error_resets_items_and_fails_job() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("analysis.db");
    let config = ProcessorConfig::builder().with_db_path(path.clone()).build();
    let services = ScriptedServices::new();
    let processor = processor(config, &services);
    let job_id = seed(&processor, FAMILY, &[("doc", Some(100))]);

    {
        let conn = rusqlite::Connection::open(&path).unwrap();
        conn.execute_batch("DROP TABLE document_analysis_status").unwrap();
    }

    let response = processor
        .invoke(json!({ "family_id": FAMILY, "job_id": job_id }))
        .await;
    assert_eq!(response.status, 500);
    assert_eq!(response.body["success"], json!(false));
    assert_eq!(response.body["recovery_available"], json!(true));

    let item = processor.get_item("item-doc").unwrap().unwrap();
    assert_eq!(item.status, QueueItemStatus::Pending);
    assert!(item
        .error_message
        .as_deref()
        .unwrap()
        .starts_with("Fatal error: "));

    let job = processor.get_job(&job_id).unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(services.extract_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_interrupted_items_are_requeued_on_startup() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("analysis.db");
    let config = ProcessorConfig::builder().with_db_path(path.clone()).build();
    let services = ScriptedServices::new();

    let first = processor(config.clone(), &services);
    let job_id = seed(&first, FAMILY, &[("a", Some(100)), ("b", Some(100))]);
    {
        // A run that claimed a batch and died
        let mut conn = db::open_database(Some(path.as_path())).unwrap();
        let claimed = db::claim_next_batch(&mut conn, FAMILY, 3).unwrap();
        assert_eq!(claimed.len(), 2);
        conn.execute_batch(
            "UPDATE analysis_queue SET started_at = '2020-01-01T00:00:00.000000Z'",
        )
        .unwrap();
    }
    assert_eq!(first.queue_stats(FAMILY).unwrap().processing, 2);
    drop(first);

    let second = processor(config, &services);
    let stats = second.queue_stats(FAMILY).unwrap();
    assert_eq!(stats.pending, 2);
    assert_eq!(stats.processing, 0);

    let summary = second.process(&request(&job_id)).await.unwrap();
    assert_eq!(summary.processed, 2);
    assert_eq!(
        second.get_job(&job_id).unwrap().unwrap().status,
        JobStatus::Completed
    );
}

#[tokio::test(start_paused = true)]
async fn test_second_processor_leaves_live_claims_alone() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("analysis.db");
    let config = ProcessorConfig::builder().with_db_path(path).build();
    let busy = ScriptedServices::new().with_latency(secs(5));
    let idle = ScriptedServices::new();

    let first = processor(config.clone(), &busy);
    let job_id = seed(&first, FAMILY, &[("doc", Some(100))]);

    let first_request = request(&job_id);
    let (first_summary, second_summary) = tokio::join!(first.process(&first_request), async {
        // Start a second processor while the first is inside extraction
        tokio::time::sleep(secs(1)).await;
        let second = processor(config.clone(), &idle);
        assert_eq!(
            second.get_item("item-doc").unwrap().unwrap().status,
            QueueItemStatus::Processing
        );
        second.process(&request(&job_id)).await.unwrap()
    });

    assert_eq!(first_summary.unwrap().processed, 1);
    assert_eq!(second_summary.processed, 0);
    assert_eq!(busy.extract_calls(), 1);
    assert_eq!(idle.extract_calls(), 0);
    assert_eq!(first.status_records_for_document("doc").unwrap().len(), 1);

    let job = first.get_job(&job_id).unwrap().unwrap();
    assert_eq!(job.processed_documents, 1);
    assert_eq!(job.status, JobStatus::Completed);
}

#[tokio::test(start_paused = true)]
async fn test_retry_item_requeues_failed_item() {
    let services = ScriptedServices::new();
    let processor = processor(ProcessorConfig::default(), &services);
    let job_id = seed(&processor, FAMILY, &[("a", Some(100)), ("b", Some(100))]);
    services.script_extract("b", vec![Err(ServiceError::other("corrupt pdf"))]);

    processor.process(&request(&job_id)).await.unwrap();
    assert_eq!(
        processor.get_item("item-b").unwrap().unwrap().status,
        QueueItemStatus::Failed
    );

    assert!(processor.retry_item("item-b").unwrap());
    let b = processor.get_item("item-b").unwrap().unwrap();
    assert_eq!(b.status, QueueItemStatus::Pending);
    assert!(b.error_message.is_none());

    assert!(!processor.retry_item("item-a").unwrap());
    assert!(matches!(
        processor.retry_item("missing"),
        Err(QueueError::NotFound(_))
    ));

    // The family can be drained again without a job
    let summary = processor.process(&ProcessRequest::new(FAMILY)).await.unwrap();
    assert_eq!(summary.processed, 1);
    assert_eq!(
        processor.get_item("item-b").unwrap().unwrap().status,
        QueueItemStatus::Completed
    );
}

#[tokio::test(start_paused = true)]
async fn test_prune_keeps_recent_items() {
    let services = ScriptedServices::new();
    let processor = processor(ProcessorConfig::default(), &services);
    let job_id = seed(&processor, FAMILY, &[("a", Some(100))]);
    processor.process(&request(&job_id)).await.unwrap();

    assert_eq!(processor.prune(7).unwrap(), 0);
    assert_eq!(processor.list_items(FAMILY).unwrap().len(), 1);
}
