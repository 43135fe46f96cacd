//! Runs detection for queued uploads and forwards the outcome to the
//! detection-results queue.

use crate::store::JobStore;
use async_trait::async_trait;
use ndt_pipeline::{
    ConsumerError, DetectionItem, DetectionOutcome, Detector, DetectorError, IncomingMessage,
    MessageBroker, MessageHandler, ObjectStore, ObjectStoreError, OutgoingMessage,
    ProcessingMessage, RedeliveryPolicy,
};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
enum InvocationError {
    #[error(transparent)]
    Object(#[from] ObjectStoreError),

    #[error(transparent)]
    Detector(#[from] DetectorError),
}

impl InvocationError {
    fn is_retryable(&self) -> bool {
        match self {
            InvocationError::Object(e) => e.is_retryable(),
            InvocationError::Detector(e) => e.is_retryable(),
        }
    }
}

pub struct DetectionWorker {
    objects: Arc<dyn ObjectStore>,
    detector: Arc<dyn Detector>,
    jobs: Arc<dyn JobStore>,
    broker: Arc<dyn MessageBroker>,
    results_queue: String,
    policy: RedeliveryPolicy,
}

impl DetectionWorker {
    pub fn new(
        objects: Arc<dyn ObjectStore>,
        detector: Arc<dyn Detector>,
        jobs: Arc<dyn JobStore>,
        broker: Arc<dyn MessageBroker>,
        results_queue: impl Into<String>,
        policy: RedeliveryPolicy,
    ) -> Self {
        Self {
            objects,
            detector,
            jobs,
            broker,
            results_queue: results_queue.into(),
            policy,
        }
    }

    async fn detect(&self, storage_key: &str) -> Result<(Vec<DetectionItem>, f64), InvocationError> {
        let image = self.objects.get_object(storage_key).await?;
        let started = Instant::now();
        let detections = self.detector.detect(image).await?;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        metrics::histogram!("results.detector.latency_ms").record(elapsed_ms);
        Ok((detections, elapsed_ms))
    }

    async fn publish(&self, outcome: &DetectionOutcome) -> Result<(), ConsumerError> {
        let message = OutgoingMessage::new_json(&self.results_queue, outcome)?
            .with_key(outcome.partition_key())
            .with_message_type(DetectionOutcome::MESSAGE_TYPE);
        self.broker
            .publish(message)
            .await
            .map_err(|e| ConsumerError::ProcessingError(e.to_string()))
    }
}

fn parse_id(value: &Option<String>) -> Option<Uuid> {
    value.as_deref().and_then(|v| Uuid::parse_str(v.trim()).ok())
}

#[async_trait]
impl MessageHandler for DetectionWorker {
    #[instrument(skip(self, message), fields(offset = message.metadata.offset, attempt = message.delivery_attempt()))]
    async fn handle(&self, message: IncomingMessage) -> Result<(), ConsumerError> {
        let task: ProcessingMessage = message.decode_json()?;

        // Uploads outside a job have nowhere to record a result
        let (Some(job_id), Some(file_id)) = (parse_id(&task.job_id), parse_id(&task.file_id)) else {
            metrics::counter!("results.detection.skipped").increment(1);
            debug!(storage_key = %task.storage_key, "Upload not bound to a job, skipping detection");
            return Ok(());
        };

        self.jobs
            .mark_file_processing(job_id, file_id)
            .await
            .map_err(|e| {
                if e.is_not_found() {
                    ConsumerError::Rejected(e.to_string())
                } else {
                    ConsumerError::ProcessingError(e.to_string())
                }
            })?;

        let attempt = message.delivery_attempt();
        let outcome = match self.detect(&task.storage_key).await {
            Ok((detections, elapsed_ms)) => {
                info!(
                    job_id = %job_id,
                    file_id = %file_id,
                    defects = detections.len(),
                    elapsed_ms,
                    "Detection finished"
                );
                DetectionOutcome {
                    job_id: task.job_id,
                    file_id: task.file_id,
                    detections,
                    processing_time_ms: Some(elapsed_ms),
                    error: None,
                }
            }
            Err(e) if !e.is_retryable() || self.policy.is_final_attempt(attempt) => {
                // Settle the file as failed rather than leave the job stalled
                warn!(job_id = %job_id, file_id = %file_id, attempt, error = %e, "Detection failed for good");
                metrics::counter!("results.detection.failed").increment(1);
                DetectionOutcome {
                    job_id: task.job_id,
                    file_id: task.file_id,
                    detections: Vec::new(),
                    processing_time_ms: None,
                    error: Some(e.to_string()),
                }
            }
            Err(e) => return Err(ConsumerError::ProcessingError(e.to_string())),
        };

        self.publish(&outcome).await
    }
}
