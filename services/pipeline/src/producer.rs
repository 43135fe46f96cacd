//! Kafka producer wrapper for the NDT pipeline.
//!
//! Provides a typed interface for publishing JSON messages to the pipeline
//! queues with headers, keys and dead-letter support.

use crate::config::KafkaConfig;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Header carrying the 1-based delivery attempt of a message
pub const DELIVERY_ATTEMPT_HEADER: &str = "delivery-attempt";
/// Header carrying the logical message type
pub const MESSAGE_TYPE_HEADER: &str = "message-type";

/// Errors that can occur during message production
#[derive(Error, Debug)]
pub enum ProducerError {
    #[error("Failed to create producer: {0}")]
    CreationError(String),

    #[error("Failed to serialize message: {0}")]
    SerializationError(String),

    #[error("Failed to send message to topic {topic}: {message}")]
    SendError { topic: String, message: String },

    #[error("Producer timeout after {0:?}")]
    Timeout(Duration),

    #[error("Failed to fetch cluster metadata: {0}")]
    Metadata(String),
}

/// Result of a successful message delivery
#[derive(Debug, Clone)]
pub struct DeliveryResult {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
}

/// Message to be sent to a queue
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    /// Topic to send the message to
    pub topic: String,
    /// Optional message key for partitioning
    pub key: Option<String>,
    /// Serialized message payload
    pub payload: Vec<u8>,
    /// Optional headers
    pub headers: Vec<(String, String)>,
}

impl OutgoingMessage {
    /// Create a new outgoing message with a raw payload
    pub fn new(topic: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            topic: topic.into(),
            key: None,
            payload,
            headers: Vec::new(),
        }
    }

    /// Create a new outgoing message with a JSON payload
    pub fn new_json<T: Serialize>(
        topic: impl Into<String>,
        message: &T,
    ) -> Result<Self, ProducerError> {
        let payload = serde_json::to_vec(message)
            .map_err(|e| ProducerError::SerializationError(e.to_string()))?;
        Ok(Self::new(topic, payload))
    }

    /// Set the message key
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Add a header to the message, replacing an existing header of the same name
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let key = key.into();
        self.headers.retain(|(k, _)| *k != key);
        self.headers.push((key, value.into()));
        self
    }

    /// Add a message type header
    pub fn with_message_type(self, msg_type: impl Into<String>) -> Self {
        self.with_header(MESSAGE_TYPE_HEADER, msg_type)
    }

    /// Stamp the delivery attempt this message represents
    pub fn with_delivery_attempt(self, attempt: u32) -> Self {
        self.with_header(DELIVERY_ATTEMPT_HEADER, attempt.to_string())
    }

    /// Look up a header value
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    fn owned_headers(&self) -> OwnedHeaders {
        self.headers
            .iter()
            .fold(OwnedHeaders::new(), |headers, (key, value)| {
                headers.insert(Header {
                    key,
                    value: Some(value.as_bytes()),
                })
            })
    }
}

/// Envelope written to the dead letter queue
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeadLetter {
    pub original_topic: String,
    pub original_message_base64: String,
    pub error: String,
    pub timestamp: String,
}

impl DeadLetter {
    pub fn new(original_topic: &str, original_message: &[u8], error: &str) -> Self {
        Self {
            original_topic: original_topic.to_string(),
            original_message_base64: BASE64.encode(original_message),
            error: error.to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// Recover the original payload bytes
    pub fn original_message(&self) -> Option<Vec<u8>> {
        BASE64.decode(&self.original_message_base64).ok()
    }

    /// Build the queue message carrying this envelope
    pub fn into_message(self, dlq_topic: &str) -> Result<OutgoingMessage, ProducerError> {
        let original_topic = self.original_topic.clone();
        let error = self.error.clone();
        Ok(OutgoingMessage::new_json(dlq_topic, &self)?
            .with_key(Uuid::new_v4().to_string())
            .with_message_type("dead_letter")
            .with_header("original-topic", original_topic)
            .with_header("error-reason", error))
    }
}

/// High-level Kafka producer wrapper
pub struct NdtProducer {
    producer: FutureProducer,
    config: Arc<KafkaConfig>,
    default_timeout: Duration,
}

impl NdtProducer {
    /// Create a new producer with the given configuration
    pub fn new(config: KafkaConfig) -> Result<Self, ProducerError> {
        info!("Creating Kafka producer for {}", config.bootstrap_servers);

        let producer: FutureProducer = config
            .build_producer_config()
            .create()
            .map_err(|e| ProducerError::CreationError(e.to_string()))?;

        let default_timeout = config.request_timeout();

        Ok(Self {
            producer,
            config: Arc::new(config),
            default_timeout,
        })
    }

    pub fn config(&self) -> &KafkaConfig {
        &self.config
    }

    /// Send a message and wait for the broker acknowledgment
    #[instrument(skip(self, message), fields(topic = %message.topic, key = ?message.key))]
    pub async fn send(&self, message: OutgoingMessage) -> Result<DeliveryResult, ProducerError> {
        self.send_with_timeout(message, self.default_timeout).await
    }

    /// Send a message with a custom timeout
    pub async fn send_with_timeout(
        &self,
        message: OutgoingMessage,
        timeout: Duration,
    ) -> Result<DeliveryResult, ProducerError> {
        let topic = message.topic.clone();
        let key = message.key.clone();

        let mut record = FutureRecord::to(&topic)
            .payload(&message.payload)
            .headers(message.owned_headers());

        if let Some(ref k) = key {
            record = record.key(k);
        }

        debug!(
            "Sending message to topic {} (size: {} bytes)",
            topic,
            message.payload.len()
        );

        let (partition, offset) = self
            .producer
            .send(record, Timeout::After(timeout))
            .await
            .map_err(|(e, _)| ProducerError::SendError {
                topic: topic.clone(),
                message: e.to_string(),
            })?;

        debug!("Message delivered to partition {} at offset {}", partition, offset);

        Ok(DeliveryResult {
            topic,
            partition,
            offset,
            key,
        })
    }

    /// Send a message to the dead letter queue
    pub async fn send_to_dlq(
        &self,
        original_topic: &str,
        original_message: &[u8],
        error: &str,
    ) -> Result<DeliveryResult, ProducerError> {
        let message = DeadLetter::new(original_topic, original_message, error)
            .into_message(&self.config.queues.dead_letter_queue)?;
        self.send(message).await
    }

    /// Flush all pending messages
    pub fn flush(&self, timeout: Duration) -> Result<(), ProducerError> {
        self.producer
            .flush(Timeout::After(timeout))
            .map_err(|_| ProducerError::Timeout(timeout))
    }

    /// Fetch cluster metadata to prove the brokers are reachable.
    ///
    /// Blocking; call from `spawn_blocking`.
    pub fn probe(&self, timeout: Duration) -> Result<usize, ProducerError> {
        let metadata = self
            .producer
            .client()
            .fetch_metadata(None, Timeout::After(timeout))
            .map_err(|e| ProducerError::Metadata(e.to_string()))?;
        Ok(metadata.brokers().len())
    }
}

impl Drop for NdtProducer {
    fn drop(&mut self) {
        info!("Shutting down Kafka producer");
        if let Err(e) = self.flush(Duration::from_secs(5)) {
            warn!("Failed to flush producer on shutdown: {}", e);
        }
    }
}
