//! Job aggregation under at-least-once delivery, run against the in-memory
//! store and broker.

use async_trait::async_trait;
use bytes::Bytes;
use ndt_pipeline::{
    DetectionItem, DetectionOutcome, Detector, DetectorError, MemoryBroker, MemoryObjectStore,
    MessageBroker, ObjectStore, OutgoingMessage, ProcessingMessage, RedeliveryPolicy,
    ReportFormatRef, ReportRequest,
};
use results_service::models::NewFile;
use results_service::{
    DetectionResultHandler, DetectionWorker, FileStatus, JobStatus, JobStore, MemoryJobStore,
    ProgressBroadcaster, ReportConsumer, ReportGenerator, ReportStatus, ResultRecorder, Verdict,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Barrier;
use uuid::Uuid;

const FILE_QUEUE: &str = "ndt.file-processing";
const RESULTS_QUEUE: &str = "ndt.detection-results";
const REPORT_QUEUE: &str = "ndt.report-generation";

fn recorder(store: Arc<MemoryJobStore>, broker: Arc<MemoryBroker>) -> Arc<ResultRecorder> {
    Arc::new(
        ResultRecorder::new(store, broker, ProgressBroadcaster::new(64), REPORT_QUEUE)
            .with_transaction_retries(3, Duration::from_millis(1)),
    )
}

async fn job_with_files(store: &MemoryJobStore, n: usize) -> (Uuid, Vec<Uuid>) {
    let files = (0..n)
        .map(|i| NewFile {
            name: format!("weld-{}.png", i),
            storage_key: Some(format!("uploads/{}-weld-{}.png", 1_700_000_000_000u64 + i as u64, i)),
        })
        .collect();
    let (job, files) = store.create_job("inspector-1", files).await.unwrap();
    (job.id, files.into_iter().map(|f| f.id).collect())
}

fn outcome(job_id: Uuid, file_id: Uuid, detections: Vec<DetectionItem>) -> DetectionOutcome {
    DetectionOutcome {
        job_id: Some(job_id.to_string()),
        file_id: Some(file_id.to_string()),
        detections,
        processing_time_ms: Some(80.0),
        error: None,
    }
}

fn porosity(confidence: f64) -> DetectionItem {
    DetectionItem {
        label: Some("porosity".to_string()),
        confidence,
        ..Default::default()
    }
}

#[tokio::test]
async fn duplicate_outcome_records_one_result() {
    let store = Arc::new(MemoryJobStore::new());
    let broker = Arc::new(MemoryBroker::default());
    let recorder = recorder(store.clone(), broker.clone());
    let (job_id, files) = job_with_files(&store, 2).await;

    let message = outcome(job_id, files[0], vec![porosity(0.6)]);
    let first = recorder.record(message.clone()).await.unwrap();
    let second = recorder.record(message).await.unwrap();

    assert_eq!(first.job().processed_files, second.job().processed_files);
    assert_eq!(first.job().progress, second.job().progress);
    assert_eq!(first.job().status, second.job().status);
    assert_eq!(store.get_job_results(job_id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn arrival_order_does_not_change_the_aggregate() {
    let orders: [[usize; 3]; 6] = [
        [0, 1, 2],
        [0, 2, 1],
        [1, 0, 2],
        [1, 2, 0],
        [2, 0, 1],
        [2, 1, 0],
    ];

    for order in orders {
        let store = Arc::new(MemoryJobStore::new());
        let broker = Arc::new(MemoryBroker::default());
        let recorder = recorder(store.clone(), broker.clone());
        let (job_id, files) = job_with_files(&store, 3).await;

        let mut failed = outcome(job_id, files[2], vec![]);
        failed.error = Some("inference service returned 503".to_string());
        let outcomes = [
            outcome(job_id, files[0], vec![]),
            outcome(job_id, files[1], vec![porosity(0.91)]),
            failed,
        ];

        for index in order {
            recorder.record(outcomes[index].clone()).await.unwrap();
        }

        let job = store.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.processed_files, 2, "order {:?}", order);
        assert_eq!(job.failed_files, 1, "order {:?}", order);
        assert_eq!(job.status, JobStatus::Failed, "order {:?}", order);
        assert!((job.progress - 200.0 / 3.0).abs() < 1e-9);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_completions_all_count() {
    const N: usize = 24;
    const COPIES: usize = 3;
    let store = Arc::new(MemoryJobStore::new());
    let broker = Arc::new(MemoryBroker::default());
    let recorder = recorder(store.clone(), broker.clone());
    let (job_id, files) = job_with_files(&store, N).await;

    // Every file delivered several times, all writers released together
    let barrier = Arc::new(Barrier::new(N * COPIES));
    let mut handles = Vec::new();
    for file_id in files.iter().copied() {
        for _ in 0..COPIES {
            let recorder = recorder.clone();
            let barrier = barrier.clone();
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                recorder.record(outcome(job_id, file_id, vec![])).await
            }));
        }
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let job = store.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.processed_files, N as i32);
    assert_eq!(job.total_files, N as i32);
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.progress, 100.0);

    let results = store.get_job_results(job_id).await.unwrap();
    assert_eq!(results.len(), N);
    for file_id in &files {
        assert_eq!(results.iter().filter(|r| r.file_id == *file_id).count(), 1);
    }

    // Every writer that saw the job finish asked for the same report
    let requests: Vec<ReportRequest> = broker
        .pending(REPORT_QUEUE)
        .iter()
        .map(|m| m.decode_json().unwrap())
        .collect();
    assert!(!requests.is_empty());
    assert!(requests
        .iter()
        .all(|r| r.report_id == ReportRequest::for_completed_job(job_id, ReportFormatRef::Json).report_id));
}

#[tokio::test]
async fn three_file_job_progresses_to_completed() {
    let store = Arc::new(MemoryJobStore::new());
    let broker = Arc::new(MemoryBroker::default());
    let recorder = recorder(store.clone(), broker.clone());
    let (job_id, files) = job_with_files(&store, 3).await;

    recorder.record(outcome(job_id, files[0], vec![])).await.unwrap();
    let job = store.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Processing);
    assert!((job.progress - 33.333).abs() < 0.01);

    recorder
        .record(outcome(job_id, files[1], vec![porosity(0.91)]))
        .await
        .unwrap();
    let results = store.get_job_results(job_id).await.unwrap();
    let b = results.iter().find(|r| r.file_id == files[1]).unwrap();
    assert_eq!(b.verdict, Verdict::Fail);
    assert_eq!(b.confidence, 0.91);

    recorder.record(outcome(job_id, files[2], vec![])).await.unwrap();
    let job = store.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.progress, 100.0);
    assert!(job.completed_at.is_some());
}

/// Flags anything whose stored bytes mention "flaw"
struct KeywordDetector;

#[async_trait]
impl Detector for KeywordDetector {
    async fn detect(&self, image: Bytes) -> Result<Vec<DetectionItem>, DetectorError> {
        if image.windows(4).any(|w| w == b"flaw") {
            Ok(vec![porosity(0.88)])
        } else {
            Ok(vec![])
        }
    }
}

#[tokio::test]
async fn pipeline_runs_end_to_end_with_redelivered_outcomes() {
    let store = Arc::new(MemoryJobStore::new());
    let objects = Arc::new(MemoryObjectStore::new());
    let broker = Arc::new(MemoryBroker::new(RedeliveryPolicy::new(3), "ndt.dlq"));
    let recorder = recorder(store.clone(), broker.clone());

    let (job_id, _) = job_with_files(&store, 3).await;
    let job_files = store.get_job_files(job_id).await.unwrap();
    for (i, file) in job_files.iter().enumerate() {
        let key = file.storage_key.clone().unwrap();
        let body: &'static [u8] = if i == 1 { b"...flaw..." } else { b"clean" };
        objects
            .put_object(&key, Bytes::from_static(body), "image/png")
            .await
            .unwrap();
        let message = ProcessingMessage {
            storage_key: key,
            job_id: Some(job_id.to_string()),
            owner_id: Some("inspector-1".to_string()),
            file_id: Some(file.id.to_string()),
        };
        broker
            .publish(OutgoingMessage::new_json(FILE_QUEUE, &message).unwrap())
            .await
            .unwrap();
    }

    let worker = DetectionWorker::new(
        objects.clone(),
        Arc::new(KeywordDetector),
        store.clone(),
        broker.clone(),
        RESULTS_QUEUE,
        RedeliveryPolicy::new(3),
    );
    assert_eq!(broker.consume_pending(FILE_QUEUE, &worker).await, 3);

    // Every outcome delivered twice
    for message in broker.pending(RESULTS_QUEUE) {
        broker
            .publish(OutgoingMessage::new(RESULTS_QUEUE, message.payload.clone()))
            .await
            .unwrap();
    }
    let handler = DetectionResultHandler::new(recorder);
    assert_eq!(broker.consume_pending(RESULTS_QUEUE, &handler).await, 6);

    let job = store.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.processed_files, 3);
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(store.get_job_results(job_id).await.unwrap().len(), 3);
    assert!(store
        .get_job_files(job_id)
        .await
        .unwrap()
        .iter()
        .all(|f| f.status == FileStatus::Completed));

    let generator = Arc::new(ReportGenerator::new(store.clone(), objects.clone(), "reports"));
    let reports = ReportConsumer::new(generator);
    assert!(broker.consume_pending(REPORT_QUEUE, &reports).await >= 1);

    let report_id = ReportRequest::for_completed_job(job_id, ReportFormatRef::Json).report_id;
    let report = store.get_report(report_id).await.unwrap().unwrap();
    assert_eq!(report.status, ReportStatus::Completed);
    let summary = report.summary.unwrap();
    assert_eq!(summary["totalInspections"], 3);
    assert_eq!(summary["failedInspections"], 1);
    assert!(objects.exists(&format!("reports/{}.json", report_id)).await.unwrap());
    assert!(broker.dead_letters().is_empty());
}
