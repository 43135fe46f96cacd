//! Records per-file detection outcomes and keeps job aggregates current.
//!
//! Outcomes arrive at least once per file, over HTTP and over the
//! detection-results queue. Recording is idempotent on `(jobId, fileId)`:
//! the store inserts at most one result per pair and recomputes the job
//! from counts, so a redelivery converges on the same state.

use crate::models::NewResult;
use crate::progress::{JobProgressEvent, ProgressBroadcaster};
use crate::store::{CompletionOutcome, FailureOutcome, JobStore, StoreError};
use async_trait::async_trait;
use ndt_pipeline::{
    ConsumerError, DetectionOutcome, IncomingMessage, MessageBroker, MessageHandler,
    OutgoingMessage, ReportFormatRef, ReportRequest,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("Job ID and File ID required")]
    MissingIds,

    #[error("Failed to process detection: {0}")]
    Store(#[from] StoreError),
}

impl RecordError {
    pub fn code(&self) -> &'static str {
        match self {
            RecordError::MissingIds => "MISSING_IDS",
            RecordError::Store(_) => "PROCESS_ERROR",
        }
    }

    /// Whether redelivering the same outcome may succeed later
    pub fn is_retryable(&self) -> bool {
        match self {
            RecordError::MissingIds => false,
            RecordError::Store(e) => e.is_transient() || e.is_not_found(),
        }
    }
}

/// What recording one outcome did
#[derive(Debug, Clone)]
pub enum RecordOutcome {
    Completed(CompletionOutcome),
    Failed(FailureOutcome),
}

impl RecordOutcome {
    pub fn job(&self) -> &crate::models::Job {
        match self {
            RecordOutcome::Completed(outcome) => &outcome.job,
            RecordOutcome::Failed(outcome) => &outcome.job,
        }
    }
}

/// Ids must be present and well-formed before anything is touched
fn parse_ids(outcome: &DetectionOutcome) -> Result<(Uuid, Uuid), RecordError> {
    let parse = |value: &Option<String>| {
        value
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .and_then(|v| Uuid::parse_str(v).ok())
    };
    match (parse(&outcome.job_id), parse(&outcome.file_id)) {
        (Some(job_id), Some(file_id)) => Ok((job_id, file_id)),
        _ => Err(RecordError::MissingIds),
    }
}

pub struct ResultRecorder {
    store: Arc<dyn JobStore>,
    broker: Arc<dyn MessageBroker>,
    progress: ProgressBroadcaster,
    report_queue: String,
    report_format: ReportFormatRef,
    max_transaction_retries: u32,
    retry_backoff: Duration,
}

impl ResultRecorder {
    pub fn new(
        store: Arc<dyn JobStore>,
        broker: Arc<dyn MessageBroker>,
        progress: ProgressBroadcaster,
        report_queue: impl Into<String>,
    ) -> Self {
        Self {
            store,
            broker,
            progress,
            report_queue: report_queue.into(),
            report_format: ReportFormatRef::Json,
            max_transaction_retries: 3,
            retry_backoff: Duration::from_millis(25),
        }
    }

    pub fn with_transaction_retries(mut self, retries: u32, backoff: Duration) -> Self {
        self.max_transaction_retries = retries;
        self.retry_backoff = backoff;
        self
    }

    pub fn with_report_format(mut self, format: ReportFormatRef) -> Self {
        self.report_format = format;
        self
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Record one detection outcome.
    ///
    /// An outcome carrying `error` fails the file instead of recording a
    /// result. Either way the job aggregate is recomputed in the same unit.
    #[instrument(skip(self, outcome), fields(job_id = ?outcome.job_id, file_id = ?outcome.file_id))]
    pub async fn record(&self, outcome: DetectionOutcome) -> Result<RecordOutcome, RecordError> {
        let (job_id, file_id) = parse_ids(&outcome).map_err(|e| {
            metrics::counter!("results.outcomes.rejected", "code" => e.code()).increment(1);
            e
        })?;

        let recorded = match outcome.error {
            Some(error) => {
                let failure = self
                    .with_transaction_retries_for(|| self.store.record_failure(job_id, file_id, &error))
                    .await?;
                if failure.ignored {
                    debug!(job_id = %job_id, file_id = %file_id, "Failure for completed file ignored");
                } else {
                    metrics::counter!("results.files.failed").increment(1);
                    warn!(job_id = %job_id, file_id = %file_id, error = %error, "File failed detection");
                }
                RecordOutcome::Failed(failure)
            }
            None => {
                let draft = NewResult::evaluate(
                    job_id,
                    file_id,
                    outcome.detections,
                    outcome.processing_time_ms,
                );
                let completion = self
                    .with_transaction_retries_for(|| self.store.record_completion(draft.clone()))
                    .await?;
                if completion.duplicate {
                    metrics::counter!("results.results.duplicates").increment(1);
                    debug!(job_id = %job_id, file_id = %file_id, "Duplicate outcome absorbed");
                } else {
                    metrics::counter!("results.files.recorded", "verdict" => completion.result.verdict.as_str())
                        .increment(1);
                    metrics::histogram!("results.detection.processing_time_ms")
                        .record(completion.result.processing_time_ms);
                }
                RecordOutcome::Completed(completion)
            }
        };

        let job = recorded.job();
        info!(
            job_id = %job.id,
            file_id = %file_id,
            processed_files = job.processed_files,
            failed_files = job.failed_files,
            total_files = job.total_files,
            status = %job.status,
            "Job progress updated"
        );
        self.progress
            .publish(JobProgressEvent::from_job(job, Some(file_id)));

        if job.status == crate::models::JobStatus::Completed {
            self.request_completion_report(job.id).await;
        }

        Ok(recorded)
    }

    /// Ask for the job's report. The request id is derived from the job, so
    /// every completion of the same job lands on one report.
    async fn request_completion_report(&self, job_id: Uuid) {
        let request = ReportRequest::for_completed_job(job_id, self.report_format);
        let message = match OutgoingMessage::new_json(&self.report_queue, &request) {
            Ok(message) => message
                .with_key(job_id.to_string())
                .with_message_type(ReportRequest::MESSAGE_TYPE),
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Failed to encode report request");
                return;
            }
        };

        match self.broker.publish(message).await {
            Ok(()) => {
                metrics::counter!("results.reports.requested").increment(1);
                info!(job_id = %job_id, report_id = %request.report_id, "Report requested for completed job");
            }
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Failed to request report for completed job");
            }
        }
    }

    /// Re-run a whole store transaction while it aborts on a conflict or an
    /// inconsistent aggregate, doubling the delay each time
    async fn with_transaction_retries_for<T, F, Fut>(&self, mut op: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut retries = 0;
        let mut delay = self.retry_backoff;
        loop {
            match op().await {
                Err(e) if e.is_transaction_retryable() && retries < self.max_transaction_retries => {
                    retries += 1;
                    metrics::counter!("results.transactions.retried").increment(1);
                    warn!(retry = retries, error = %e, "Recording transaction aborted, retrying");
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                }
                other => return other,
            }
        }
    }
}

/// Feeds the detection-results queue into the recorder
pub struct DetectionResultHandler {
    recorder: Arc<ResultRecorder>,
}

impl DetectionResultHandler {
    pub fn new(recorder: Arc<ResultRecorder>) -> Self {
        Self { recorder }
    }
}

#[async_trait]
impl MessageHandler for DetectionResultHandler {
    async fn handle(&self, message: IncomingMessage) -> Result<(), ConsumerError> {
        let outcome: DetectionOutcome = message.decode_json()?;
        match self.recorder.record(outcome).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_retryable() => Err(ConsumerError::ProcessingError(e.to_string())),
            Err(e) => Err(ConsumerError::Rejected(e.to_string())),
        }
    }
}
