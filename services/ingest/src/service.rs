//! Upload ingestion: normalize, store, then enqueue for detection.

use crate::normalizer::{ImageNormalizer, NormalizeError};
use bytes::Bytes;
use ndt_pipeline::{
    content_type_for, sanitize_key_component, BrokerError, MessageBroker, ObjectStore,
    ObjectStoreError, OutgoingMessage, ProcessingMessage, ProducerError,
};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, instrument, warn};

/// Errors surfaced by ingestion.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Invalid upload: {0}")]
    Validation(String),

    #[error("Failed to store upload: {0}")]
    Store(#[from] ObjectStoreError),

    #[error("Failed to enqueue upload: {0}")]
    Publish(#[from] BrokerError),

    #[error("Normalization task failed: {0}")]
    Internal(String),
}

impl From<NormalizeError> for IngestError {
    fn from(e: NormalizeError) -> Self {
        match e {
            NormalizeError::EncodeFailed(message) => IngestError::Internal(message),
            other => IngestError::Validation(other.to_string()),
        }
    }
}

impl From<ProducerError> for IngestError {
    fn from(e: ProducerError) -> Self {
        IngestError::Publish(BrokerError::Producer(e))
    }
}

impl IngestError {
    /// Storage and broker failures may succeed when the client retries
    pub fn is_retryable(&self) -> bool {
        matches!(self, IngestError::Store(_) | IngestError::Publish(_))
    }

    pub fn code(&self) -> &'static str {
        match self {
            IngestError::Validation(_) => "VALIDATION_ERROR",
            IngestError::Store(_) => "STORAGE_ERROR",
            IngestError::Publish(_) => "QUEUE_ERROR",
            IngestError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

/// One uploaded file plus the job it belongs to.
#[derive(Debug, Clone, Default)]
pub struct Upload {
    pub file_name: String,
    pub content: Bytes,
    pub job_id: Option<String>,
    pub owner_id: Option<String>,
    pub file_id: Option<String>,
}

/// Returned once an upload is stored and queued.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IngestReceipt {
    /// Kept for clients that read the storage key as `fileId`
    pub file_id: String,
    pub storage_key: String,
    pub status: &'static str,
}

/// Storage key for an upload: `uploads/{unix_millis}-{sanitized name}`.
///
/// Two uploads of the same name in the same millisecond collide; the later
/// write wins.
pub fn storage_key(unix_millis: i64, file_name: &str) -> String {
    let name = file_name.rsplit(['/', '\\']).next().unwrap_or(file_name);
    format!("uploads/{}-{}", unix_millis, sanitize_key_component(name))
}

pub struct IngestionService {
    store: Arc<dyn ObjectStore>,
    broker: Arc<dyn MessageBroker>,
    normalizer: ImageNormalizer,
    processing_queue: String,
}

impl IngestionService {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        broker: Arc<dyn MessageBroker>,
        normalizer: ImageNormalizer,
        processing_queue: impl Into<String>,
    ) -> Self {
        Self {
            store,
            broker,
            normalizer,
            processing_queue: processing_queue.into(),
        }
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// Normalize, store and enqueue one upload.
    ///
    /// The processing message is only published after the store write has
    /// succeeded, so every queued key refers to a stored object.
    #[instrument(skip(self, upload), fields(file_name = %upload.file_name, size_bytes = upload.content.len()))]
    pub async fn ingest(&self, upload: Upload) -> Result<IngestReceipt, IngestError> {
        if upload.content.is_empty() {
            metrics::counter!("ingest.uploads.rejected", "reason" => "empty").increment(1);
            return Err(IngestError::Validation("uploaded file is empty".to_string()));
        }
        if upload.file_name.trim().is_empty() {
            metrics::counter!("ingest.uploads.rejected", "reason" => "missing_name").increment(1);
            return Err(IngestError::Validation("file name is required".to_string()));
        }

        let normalizer = self.normalizer;
        let content = upload.content.clone();
        let normalized = tokio::task::spawn_blocking(move || normalizer.normalize(&content))
            .await
            .map_err(|e| IngestError::Internal(e.to_string()))?
            .map_err(|e| {
                metrics::counter!("ingest.uploads.rejected", "reason" => "undecodable").increment(1);
                IngestError::from(e)
            })?;

        let key = storage_key(chrono::Utc::now().timestamp_millis(), &upload.file_name);
        let content_type = content_type_for(&format!("image.{}", normalized.extension()));
        let stored_bytes = normalized.data.len();

        self.store
            .put_object(&key, normalized.data, content_type)
            .await
            .map_err(|e| {
                warn!(key = %key, error = %e, "Object store write failed");
                IngestError::Store(e)
            })?;

        let message = ProcessingMessage {
            storage_key: key.clone(),
            job_id: upload.job_id,
            owner_id: upload.owner_id,
            file_id: upload.file_id,
        };
        let partition_key = message.job_id.clone().unwrap_or_else(|| key.clone());
        let outgoing = OutgoingMessage::new_json(&self.processing_queue, &message)?
            .with_key(partition_key)
            .with_message_type(ProcessingMessage::MESSAGE_TYPE);

        self.broker.publish(outgoing).await.map_err(|e| {
            warn!(key = %key, error = %e, "Failed to enqueue processing message");
            IngestError::Publish(e)
        })?;

        metrics::counter!("ingest.uploads.accepted").increment(1);
        metrics::counter!("ingest.bytes.stored").increment(stored_bytes as u64);

        info!(
            key = %key,
            width = normalized.width,
            height = normalized.height,
            original_width = normalized.original_width,
            original_height = normalized.original_height,
            "Upload queued for detection"
        );

        Ok(IngestReceipt {
            file_id: key.clone(),
            storage_key: key,
            status: "queued",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalizer::tests::sample_image;
    use image::ImageFormat;
    use ndt_pipeline::{MemoryBroker, MemoryObjectStore};

    const QUEUE: &str = "ndt.file-processing";

    fn service(
        store: Arc<MemoryObjectStore>,
        broker: Arc<MemoryBroker>,
    ) -> IngestionService {
        IngestionService::new(store, broker, ImageNormalizer::new(640, 640), QUEUE)
    }

    fn png_upload() -> Upload {
        Upload {
            file_name: "weld seam 01.png".to_string(),
            content: Bytes::from(sample_image(800, 600, ImageFormat::Png)),
            job_id: Some("job-1".to_string()),
            owner_id: Some("owner-1".to_string()),
            file_id: Some("file-1".to_string()),
        }
    }

    #[test]
    fn test_storage_key_format() {
        assert_eq!(
            storage_key(1700000000000, "weld seam 01.png"),
            "uploads/1700000000000-weld_seam_01.png"
        );
        assert_eq!(
            storage_key(1, "C:\\scans\\../../x.png"),
            "uploads/1-x.png"
        );
    }

    #[tokio::test]
    async fn test_ingest_stores_then_publishes() {
        let store = Arc::new(MemoryObjectStore::new());
        let broker = Arc::new(MemoryBroker::default());
        let service = service(store.clone(), broker.clone());

        let receipt = service.ingest(png_upload()).await.unwrap();
        assert_eq!(receipt.status, "queued");
        assert_eq!(receipt.file_id, receipt.storage_key);
        assert!(receipt.storage_key.starts_with("uploads/"));
        assert!(receipt.storage_key.ends_with("-weld_seam_01.png"));

        assert_eq!(store.keys(), vec![receipt.storage_key.clone()]);
        assert_eq!(
            store.content_type(&receipt.storage_key).as_deref(),
            Some("image/png")
        );

        let queued = broker.pending(QUEUE);
        assert_eq!(queued.len(), 1);
        let message: ProcessingMessage = queued[0].decode_json().unwrap();
        assert_eq!(message.storage_key, receipt.storage_key);
        assert_eq!(message.job_id.as_deref(), Some("job-1"));
        assert_eq!(message.file_id.as_deref(), Some("file-1"));
    }

    #[tokio::test]
    async fn test_store_failure_publishes_nothing() {
        let store = Arc::new(MemoryObjectStore::new());
        let broker = Arc::new(MemoryBroker::default());
        store.set_offline(true);
        let service = service(store.clone(), broker.clone());

        let err = service.ingest(png_upload()).await.unwrap_err();
        assert!(matches!(err, IngestError::Store(_)));
        assert!(err.is_retryable());
        assert!(broker.pending(QUEUE).is_empty());
    }

    #[tokio::test]
    async fn test_broker_failure_is_retryable() {
        let store = Arc::new(MemoryObjectStore::new());
        let broker = Arc::new(MemoryBroker::default());
        broker.set_offline(true);
        let service = service(store, broker);

        let err = tokio_test::assert_err!(service.ingest(png_upload()).await);
        assert!(matches!(err, IngestError::Publish(_)));
        assert_eq!(err.code(), "QUEUE_ERROR");
    }

    #[tokio::test]
    async fn test_invalid_content_is_validation_error() {
        let store = Arc::new(MemoryObjectStore::new());
        let broker = Arc::new(MemoryBroker::default());
        let service = service(store.clone(), broker);

        let mut upload = png_upload();
        upload.content = Bytes::from_static(b"not an image");
        let err = service.ingest(upload).await.unwrap_err();
        assert!(matches!(err, IngestError::Validation(_)));
        assert!(!err.is_retryable());

        let mut empty = png_upload();
        empty.content = Bytes::new();
        assert!(matches!(
            service.ingest(empty).await,
            Err(IngestError::Validation(_))
        ));
        assert!(store.keys().is_empty());
    }
}
