//! NDT Pipeline - queue, object store and detector plumbing for the
//! defect-detection job pipeline.
//!
//! Ingestion, detection, result recording and reporting run as independent
//! workers that only share durable queues and storage. This library provides:
//!
//! - A [`MessageBroker`] abstraction with at-least-once delivery, bounded
//!   redelivery and dead-lettering (Kafka and in-memory implementations)
//! - The JSON payloads carried on each queue
//! - An [`ObjectStore`] gateway (S3 and in-memory implementations)
//! - The [`Detector`] capability and its HTTP inference client
//!
//! # Example
//!
//! ```rust,no_run
//! use ndt_pipeline::{KafkaBroker, KafkaConfig, MessageBroker, OutgoingMessage, ProcessingMessage};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = KafkaConfig::default();
//!     let broker = KafkaBroker::new(config.clone())?;
//!
//!     let message = ProcessingMessage {
//!         storage_key: "uploads/1700000000000-weld.png".to_string(),
//!         job_id: None,
//!         owner_id: None,
//!         file_id: None,
//!     };
//!     broker
//!         .publish(OutgoingMessage::new_json(&config.queues.file_processing, &message)?)
//!         .await?;
//!
//!     Ok(())
//! }
//! ```

pub mod broker;
pub mod config;
pub mod consumer;
pub mod detector;
pub mod memory;
pub mod messages;
pub mod object_store;
pub mod producer;

pub use broker::{BrokerError, Disposition, KafkaBroker, MessageBroker, RedeliveryPolicy};
pub use config::{
    ConfigError, ConsumerConfig, InferenceConfig, KafkaConfig, ProducerConfig, QueueConfig,
    ReliabilityConfig, S3Config, SaslConfig, SaslMechanism, SecurityProtocol, SslConfig,
};
pub use consumer::{
    ConsumerError, FnHandler, IncomingMessage, MessageHandler, MessageMetadata, NdtConsumer,
};
pub use detector::{Detector, DetectorError, HttpDetector, ModelInventory};
pub use memory::{MemoryBroker, MemoryObjectStore};
pub use messages::{
    DetectionItem, DetectionOutcome, ProcessingMessage, ReportFormatRef, ReportRequest,
    ReportScopeRef,
};
pub use object_store::{
    content_type_for, sanitize_key_component, ObjectStore, ObjectStoreError, S3ObjectStore,
};
pub use producer::{DeadLetter, DeliveryResult, NdtProducer, OutgoingMessage, ProducerError};
