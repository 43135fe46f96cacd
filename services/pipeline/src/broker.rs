//! Durable, acknowledged queues connecting the pipeline stages.
//!
//! A [`MessageBroker`] publishes payloads durably and delivers them to a
//! [`MessageHandler`] at least once. What happens after a delivery is decided
//! by the [`RedeliveryPolicy`]; every handler must therefore be idempotent.

use crate::config::KafkaConfig;
use crate::consumer::{consumer_lag, ConsumerError, IncomingMessage, MessageHandler, NdtConsumer};
use crate::producer::{DeadLetter, NdtProducer, OutgoingMessage, ProducerError};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error(transparent)]
    Producer(#[from] ProducerError),

    #[error(transparent)]
    Consumer(#[from] ConsumerError),

    #[error("Broker unavailable: {0}")]
    Unavailable(String),
}

/// What to do with a message after its handler ran
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Handled; acknowledge it
    Ack,
    /// Transient failure; deliver again as `next_attempt`
    Redeliver { next_attempt: u32 },
    /// Give up and move it to the dead letter queue
    DeadLetter { reason: String },
}

/// Bounded redelivery: transient failures are retried until `max_attempts`
/// deliveries have been made, permanent failures are dead-lettered at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedeliveryPolicy {
    pub max_attempts: u32,
}

impl Default for RedeliveryPolicy {
    fn default() -> Self {
        Self { max_attempts: 5 }
    }
}

impl RedeliveryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }

    /// Decide the fate of delivery number `attempt` (1-based)
    pub fn decide(&self, attempt: u32, failure: Option<&ConsumerError>) -> Disposition {
        match failure {
            None => Disposition::Ack,
            Some(e) if !e.is_retryable() => Disposition::DeadLetter {
                reason: e.to_string(),
            },
            Some(e) if attempt >= self.max_attempts => Disposition::DeadLetter {
                reason: format!("gave up after {} attempts: {}", attempt, e),
            },
            Some(_) => Disposition::Redeliver {
                next_attempt: attempt + 1,
            },
        }
    }

    /// Whether delivery number `attempt` is the last one before dead-lettering
    pub fn is_final_attempt(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }
}

/// The message that carries out a disposition, if any needs publishing
pub fn settlement_message(
    disposition: &Disposition,
    incoming: &IncomingMessage,
    dead_letter_queue: &str,
) -> Result<Option<OutgoingMessage>, ProducerError> {
    match disposition {
        Disposition::Ack => Ok(None),
        Disposition::Redeliver { next_attempt } => Ok(Some(incoming.redelivery(*next_attempt))),
        Disposition::DeadLetter { reason } => {
            metrics::counter!("pipeline.messages.dead_lettered", "queue" => incoming.metadata.topic.clone())
                .increment(1);
            DeadLetter::new(&incoming.metadata.topic, &incoming.payload, reason)
                .into_message(dead_letter_queue)
                .map(Some)
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Persist `message` on its queue; returns once the broker has accepted it
    async fn publish(&self, message: OutgoingMessage) -> Result<(), BrokerError>;

    /// Deliver messages from `queue` to `handler` until `shutdown` is cancelled
    async fn consume(
        &self,
        queue: &str,
        handler: Arc<dyn MessageHandler>,
        shutdown: CancellationToken,
    ) -> Result<(), BrokerError>;

    /// Broker reachability
    async fn ping(&self) -> Result<(), BrokerError>;

    /// Messages waiting on `queue`
    async fn queue_depth(&self, queue: &str) -> Result<u64, BrokerError>;
}

/// Kafka-backed broker
pub struct KafkaBroker {
    config: KafkaConfig,
    producer: Arc<NdtProducer>,
    probe_timeout: Duration,
}

impl KafkaBroker {
    pub fn new(config: KafkaConfig) -> Result<Self, BrokerError> {
        let producer = Arc::new(NdtProducer::new(config.clone())?);
        Ok(Self {
            config,
            producer,
            probe_timeout: Duration::from_secs(5),
        })
    }

    /// Upper bound for metadata calls made by `ping` and `queue_depth`
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn config(&self) -> &KafkaConfig {
        &self.config
    }
}

#[async_trait]
impl MessageBroker for KafkaBroker {
    async fn publish(&self, message: OutgoingMessage) -> Result<(), BrokerError> {
        self.producer.send(message).await?;
        Ok(())
    }

    #[instrument(skip(self, handler, shutdown))]
    async fn consume(
        &self,
        queue: &str,
        handler: Arc<dyn MessageHandler>,
        shutdown: CancellationToken,
    ) -> Result<(), BrokerError> {
        let consumer = NdtConsumer::new(self.config.clone(), self.producer.clone())?;
        consumer.subscribe(&[queue])?;
        consumer.run(handler, shutdown).await?;
        info!(queue = %queue, "Consumer stopped");
        Ok(())
    }

    async fn ping(&self) -> Result<(), BrokerError> {
        let producer = self.producer.clone();
        let timeout = self.probe_timeout;
        tokio::task::spawn_blocking(move || {
            producer
                .probe(timeout)
                .map(|_| ())
                .map_err(|e| BrokerError::Unavailable(e.to_string()))
        })
        .await
        .map_err(|e| BrokerError::Unavailable(e.to_string()))?
    }

    async fn queue_depth(&self, queue: &str) -> Result<u64, BrokerError> {
        let config = self.config.clone();
        let queue = queue.to_string();
        let timeout = self.probe_timeout;
        let lag = tokio::task::spawn_blocking(move || consumer_lag(&config, &queue, timeout))
            .await
            .map_err(|e| BrokerError::Unavailable(e.to_string()))??;
        Ok(lag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transient() -> ConsumerError {
        ConsumerError::ProcessingError("database unavailable".into())
    }

    #[test]
    fn test_success_is_acked() {
        let policy = RedeliveryPolicy::new(3);
        assert_eq!(policy.decide(1, None), Disposition::Ack);
        assert_eq!(policy.decide(3, None), Disposition::Ack);
    }

    #[test]
    fn test_transient_failures_redeliver_until_limit() {
        let policy = RedeliveryPolicy::new(3);
        let error = transient();

        assert_eq!(
            policy.decide(1, Some(&error)),
            Disposition::Redeliver { next_attempt: 2 }
        );
        assert_eq!(
            policy.decide(2, Some(&error)),
            Disposition::Redeliver { next_attempt: 3 }
        );
        assert!(matches!(
            policy.decide(3, Some(&error)),
            Disposition::DeadLetter { .. }
        ));
        assert!(policy.is_final_attempt(3));
    }

    #[test]
    fn test_permanent_failures_dead_letter_immediately() {
        let policy = RedeliveryPolicy::new(5);
        let error = ConsumerError::DeserializationError("expected value".into());

        match policy.decide(1, Some(&error)) {
            Disposition::DeadLetter { reason } => assert!(reason.contains("expected value")),
            other => panic!("unexpected disposition: {:?}", other),
        }
    }

    #[test]
    fn test_zero_attempts_clamped() {
        let policy = RedeliveryPolicy::new(0);
        assert_eq!(policy.max_attempts, 1);
        assert!(matches!(
            policy.decide(1, Some(&transient())),
            Disposition::DeadLetter { .. }
        ));
    }

    #[test]
    fn test_settlement_messages() {
        let incoming = IncomingMessage {
            payload: b"{}".to_vec(),
            metadata: crate::consumer::MessageMetadata {
                topic: "ndt.report-generation".to_string(),
                ..Default::default()
            },
        };

        assert!(settlement_message(&Disposition::Ack, &incoming, "ndt.dlq")
            .unwrap()
            .is_none());

        let redelivery = settlement_message(
            &Disposition::Redeliver { next_attempt: 2 },
            &incoming,
            "ndt.dlq",
        )
        .unwrap()
        .unwrap();
        assert_eq!(redelivery.topic, "ndt.report-generation");

        let dead = settlement_message(
            &Disposition::DeadLetter {
                reason: "bad".into(),
            },
            &incoming,
            "ndt.dlq",
        )
        .unwrap()
        .unwrap();
        assert_eq!(dead.topic, "ndt.dlq");
    }
}
