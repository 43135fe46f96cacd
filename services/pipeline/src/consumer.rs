//! Kafka consumer wrapper for the NDT pipeline.
//!
//! Delivers messages to a [`MessageHandler`] and settles each one according to
//! a [`RedeliveryPolicy`]: acknowledged on success, re-published with the next
//! delivery attempt on a transient failure, or dead-lettered. The offset is
//! committed only after the message has been settled.

use crate::broker::{settlement_message, Disposition, RedeliveryPolicy};
use crate::config::KafkaConfig;
use crate::producer::{NdtProducer, OutgoingMessage, ProducerError, DELIVERY_ATTEMPT_HEADER};
use backoff::ExponentialBackoffBuilder;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{Headers, Message as KafkaMessage};
use rdkafka::util::Timeout;
use rdkafka::{Offset, TopicPartitionList};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Errors that can occur during message consumption
#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("Failed to create consumer: {0}")]
    CreationError(String),

    #[error("Failed to subscribe to topics: {0}")]
    SubscriptionError(String),

    #[error("Failed to deserialize message: {0}")]
    DeserializationError(String),

    #[error("Message rejected: {0}")]
    Rejected(String),

    #[error("Failed to commit offset: {0}")]
    CommitError(String),

    #[error("Consumer poll error: {0}")]
    PollError(String),

    #[error("Message processing error: {0}")]
    ProcessingError(String),

    #[error("Failed to settle message: {0}")]
    Settlement(#[from] ProducerError),
}

impl ConsumerError {
    /// Whether redelivering the same message could succeed.
    ///
    /// Undecodable and rejected messages will fail the same way every time.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            ConsumerError::DeserializationError(_) | ConsumerError::Rejected(_)
        )
    }
}

/// Metadata about a received message
#[derive(Debug, Clone, Default)]
pub struct MessageMetadata {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub timestamp: Option<i64>,
    pub headers: HashMap<String, String>,
}

/// A received message with payload and metadata
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub payload: Vec<u8>,
    pub metadata: MessageMetadata,
}

impl IncomingMessage {
    /// Deserialize the payload as JSON
    pub fn decode_json<T: serde::de::DeserializeOwned>(&self) -> Result<T, ConsumerError> {
        serde_json::from_slice(&self.payload)
            .map_err(|e| ConsumerError::DeserializationError(e.to_string()))
    }

    /// Get the message key as a string
    pub fn key_str(&self) -> Option<String> {
        self.metadata
            .key
            .as_ref()
            .and_then(|k| String::from_utf8(k.clone()).ok())
    }

    /// Get a header value
    pub fn header(&self, key: &str) -> Option<&str> {
        self.metadata.headers.get(key).map(|s| s.as_str())
    }

    pub fn message_type(&self) -> Option<&str> {
        self.header("message-type")
    }

    /// 1-based delivery attempt; messages without the header are first deliveries
    pub fn delivery_attempt(&self) -> u32 {
        self.header(DELIVERY_ATTEMPT_HEADER)
            .and_then(|v| v.parse().ok())
            .filter(|attempt| *attempt > 0)
            .unwrap_or(1)
    }

    /// The same message, addressed back to its queue as the given attempt
    pub fn redelivery(&self, next_attempt: u32) -> OutgoingMessage {
        let mut message = OutgoingMessage::new(&self.metadata.topic, self.payload.clone());
        message.key = self.key_str();
        for (key, value) in &self.metadata.headers {
            message = message.with_header(key.clone(), value.clone());
        }
        message.with_delivery_attempt(next_attempt)
    }
}

/// Handler trait for processing messages
#[async_trait::async_trait]
pub trait MessageHandler: Send + Sync {
    /// Process a single message
    async fn handle(&self, message: IncomingMessage) -> Result<(), ConsumerError>;

    /// Called when message processing fails
    async fn on_error(&self, message: &IncomingMessage, error: &ConsumerError) {
        warn!(
            topic = %message.metadata.topic,
            partition = message.metadata.partition,
            offset = message.metadata.offset,
            attempt = message.delivery_attempt(),
            "Message processing failed: {}",
            error
        );
    }
}

/// Function-based message handler
pub struct FnHandler<F>
where
    F: Fn(IncomingMessage) -> Result<(), ConsumerError> + Send + Sync,
{
    handler: F,
}

impl<F> FnHandler<F>
where
    F: Fn(IncomingMessage) -> Result<(), ConsumerError> + Send + Sync,
{
    pub fn new(handler: F) -> Self {
        Self { handler }
    }
}

#[async_trait::async_trait]
impl<F> MessageHandler for FnHandler<F>
where
    F: Fn(IncomingMessage) -> Result<(), ConsumerError> + Send + Sync,
{
    async fn handle(&self, message: IncomingMessage) -> Result<(), ConsumerError> {
        (self.handler)(message)
    }
}

/// Run `handler` on one message and decide what happens to it
pub async fn dispatch(
    handler: &dyn MessageHandler,
    policy: &RedeliveryPolicy,
    incoming: &IncomingMessage,
) -> Disposition {
    let attempt = incoming.delivery_attempt();
    let outcome = handler.handle(incoming.clone()).await;
    if let Err(ref e) = outcome {
        handler.on_error(incoming, e).await;
    }
    policy.decide(attempt, outcome.as_ref().err())
}

/// High-level Kafka consumer for one queue
pub struct NdtConsumer {
    consumer: StreamConsumer,
    config: Arc<KafkaConfig>,
    producer: Arc<NdtProducer>,
    policy: RedeliveryPolicy,
}

impl NdtConsumer {
    /// Create a consumer that settles messages through `producer`
    pub fn new(config: KafkaConfig, producer: Arc<NdtProducer>) -> Result<Self, ConsumerError> {
        info!(
            "Creating Kafka consumer for {} with group {}",
            config.bootstrap_servers, config.consumer.group_id
        );

        let consumer: StreamConsumer = config
            .build_consumer_config()
            .create()
            .map_err(|e| ConsumerError::CreationError(e.to_string()))?;

        let policy = RedeliveryPolicy::new(config.reliability.max_delivery_attempts);

        Ok(Self {
            consumer,
            config: Arc::new(config),
            producer,
            policy,
        })
    }

    pub fn config(&self) -> &KafkaConfig {
        &self.config
    }

    /// Subscribe to the specified topics
    pub fn subscribe(&self, topics: &[&str]) -> Result<(), ConsumerError> {
        info!("Subscribing to topics: {:?}", topics);
        self.consumer
            .subscribe(topics)
            .map_err(|e| ConsumerError::SubscriptionError(e.to_string()))
    }

    /// Consume until `shutdown` is cancelled.
    ///
    /// Returns an error only when a message could not be settled; its offset
    /// is left uncommitted so the group redelivers it after a restart.
    #[instrument(skip(self, handler, shutdown))]
    pub async fn run(
        &self,
        handler: Arc<dyn MessageHandler>,
        shutdown: CancellationToken,
    ) -> Result<(), ConsumerError> {
        use tokio_stream::StreamExt;

        let stream = self.consumer.stream();
        tokio::pin!(stream);

        info!("Starting message consumption loop");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Received shutdown signal");
                    break;
                }
                message_result = stream.next() => {
                    match message_result {
                        Some(Ok(borrowed_message)) => {
                            let incoming = convert_message(&borrowed_message);

                            debug!(
                                topic = %incoming.metadata.topic,
                                partition = incoming.metadata.partition,
                                offset = incoming.metadata.offset,
                                "Received message"
                            );

                            let disposition = dispatch(handler.as_ref(), &self.policy, &incoming).await;
                            self.settle(&incoming, &disposition).await?;

                            if let Err(e) = self
                                .consumer
                                .commit_message(&borrowed_message, CommitMode::Async)
                            {
                                warn!("Failed to commit offset: {}", e);
                            }
                        }
                        Some(Err(e)) => {
                            error!("Kafka error: {}", e);
                        }
                        None => {
                            debug!("Stream ended");
                            break;
                        }
                    }
                }
            }
        }

        if let Err(e) = self.consumer.commit_consumer_state(CommitMode::Sync) {
            warn!("Failed to commit on shutdown: {}", e);
        }

        Ok(())
    }

    /// Publish the redelivery or dead letter for a message, retrying with backoff
    async fn settle(
        &self,
        incoming: &IncomingMessage,
        disposition: &Disposition,
    ) -> Result<(), ConsumerError> {
        let Some(message) =
            settlement_message(disposition, incoming, &self.config.queues.dead_letter_queue)?
        else {
            return Ok(());
        };

        let backoff = ExponentialBackoffBuilder::new()
            .with_max_elapsed_time(Some(self.config.republish_max_elapsed()))
            .build();

        backoff::future::retry(backoff, || async {
            self.producer.send(message.clone()).await.map_err(|e| {
                warn!("Settlement publish failed, retrying: {}", e);
                backoff::Error::transient(e)
            })
        })
        .await?;

        Ok(())
    }
}

/// Convert a borrowed Kafka message to our IncomingMessage type
fn convert_message<M: KafkaMessage>(msg: &M) -> IncomingMessage {
    let payload = msg.payload().unwrap_or(&[]).to_vec();
    let key = msg.key().map(|k| k.to_vec());

    let mut headers = HashMap::new();
    if let Some(h) = msg.headers() {
        for header in h.iter() {
            if let Some(value) = header.value {
                if let Ok(v) = String::from_utf8(value.to_vec()) {
                    headers.insert(header.key.to_string(), v);
                }
            }
        }
    }

    IncomingMessage {
        payload,
        metadata: MessageMetadata {
            topic: msg.topic().to_string(),
            partition: msg.partition(),
            offset: msg.offset(),
            key,
            timestamp: msg.timestamp().to_millis(),
            headers,
        },
    }
}

/// Messages of `topic` not yet committed by the configured consumer group.
///
/// Blocking; call from `spawn_blocking`.
pub fn consumer_lag(
    config: &KafkaConfig,
    topic: &str,
    timeout: Duration,
) -> Result<u64, ConsumerError> {
    let consumer: BaseConsumer = config
        .build_consumer_config()
        .create()
        .map_err(|e| ConsumerError::CreationError(e.to_string()))?;

    let metadata = consumer
        .fetch_metadata(Some(topic), Timeout::After(timeout))
        .map_err(|e| ConsumerError::PollError(e.to_string()))?;

    let mut partitions = TopicPartitionList::new();
    let mut watermarks = HashMap::new();
    for topic_metadata in metadata.topics() {
        for partition in topic_metadata.partitions() {
            let (low, high) = consumer
                .fetch_watermarks(topic, partition.id(), Timeout::After(timeout))
                .map_err(|e| ConsumerError::PollError(e.to_string()))?;
            partitions.add_partition(topic, partition.id());
            watermarks.insert(partition.id(), (low, high));
        }
    }

    if partitions.count() == 0 {
        return Ok(0);
    }

    let committed = consumer
        .committed_offsets(partitions, Timeout::After(timeout))
        .map_err(|e| ConsumerError::PollError(e.to_string()))?;

    let lag = committed
        .elements()
        .iter()
        .map(|element| {
            let (low, high) = watermarks
                .get(&element.partition())
                .copied()
                .unwrap_or((0, 0));
            let position = match element.offset() {
                Offset::Offset(offset) => offset,
                _ => low,
            };
            (high - position).max(0) as u64
        })
        .sum();

    Ok(lag)
}
