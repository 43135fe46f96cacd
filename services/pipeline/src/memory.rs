//! In-process broker and object store.
//!
//! Same delivery semantics as the Kafka broker (redelivery policy, dead
//! letters, delivery-attempt header) without any infrastructure. Used by
//! tests and single-process local runs. Both can be switched offline to
//! simulate an outage.

use crate::broker::{settlement_message, BrokerError, MessageBroker, RedeliveryPolicy};
use crate::consumer::{dispatch, IncomingMessage, MessageHandler, MessageMetadata};
use crate::object_store::{ObjectStore, ObjectStoreError};
use crate::producer::{DeadLetter, OutgoingMessage};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Default)]
struct QueueState {
    pending: VecDeque<IncomingMessage>,
    next_offset: i64,
}

/// In-memory [`MessageBroker`]
pub struct MemoryBroker {
    queues: Mutex<HashMap<String, QueueState>>,
    published: Notify,
    offline: AtomicBool,
    policy: RedeliveryPolicy,
    dead_letter_queue: String,
}

impl MemoryBroker {
    pub fn new(policy: RedeliveryPolicy, dead_letter_queue: impl Into<String>) -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            published: Notify::new(),
            offline: AtomicBool::new(false),
            policy,
            dead_letter_queue: dead_letter_queue.into(),
        }
    }

    /// Simulate the broker going away (or coming back)
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
        // Wake idle consumers so they notice
        self.published.notify_waiters();
    }

    fn ensure_online(&self) -> Result<(), BrokerError> {
        if self.offline.load(Ordering::SeqCst) {
            Err(BrokerError::Unavailable("memory broker is offline".to_string()))
        } else {
            Ok(())
        }
    }

    fn enqueue(&self, message: OutgoingMessage) {
        let mut queues = self.queues.lock();
        let state = queues.entry(message.topic.clone()).or_default();
        let offset = state.next_offset;
        state.next_offset += 1;
        state.pending.push_back(IncomingMessage {
            payload: message.payload,
            metadata: MessageMetadata {
                topic: message.topic,
                partition: 0,
                offset,
                key: message.key.map(String::into_bytes),
                timestamp: Some(chrono::Utc::now().timestamp_millis()),
                headers: message.headers.into_iter().collect(),
            },
        });
    }

    fn take(&self, queue: &str) -> Option<IncomingMessage> {
        self.queues
            .lock()
            .get_mut(queue)
            .and_then(|state| state.pending.pop_front())
    }

    /// Payloads currently waiting on `queue`, oldest first
    pub fn pending(&self, queue: &str) -> Vec<IncomingMessage> {
        self.queues
            .lock()
            .get(queue)
            .map(|state| state.pending.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Decoded envelopes waiting on the dead letter queue
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.pending(&self.dead_letter_queue)
            .iter()
            .filter_map(|message| message.decode_json().ok())
            .collect()
    }

    async fn deliver(&self, handler: &dyn MessageHandler, incoming: IncomingMessage) {
        let disposition = dispatch(handler, &self.policy, &incoming).await;
        debug!(
            queue = %incoming.metadata.topic,
            offset = incoming.metadata.offset,
            ?disposition,
            "Settled message"
        );
        match settlement_message(&disposition, &incoming, &self.dead_letter_queue) {
            Ok(Some(message)) => {
                self.enqueue(message);
                self.published.notify_waiters();
            }
            Ok(None) => {}
            // Serializing the envelope failed; keep the message rather than lose it
            Err(_) => self.enqueue(incoming.redelivery(incoming.delivery_attempt())),
        }
    }

    /// Deliver everything on `queue`, including redeliveries, until it is empty.
    ///
    /// Returns the number of deliveries made. Terminates because redelivery
    /// is bounded by the policy.
    pub async fn consume_pending(&self, queue: &str, handler: &dyn MessageHandler) -> usize {
        let mut deliveries = 0;
        while let Some(incoming) = self.take(queue) {
            self.deliver(handler, incoming).await;
            deliveries += 1;
        }
        deliveries
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(RedeliveryPolicy::default(), "ndt.dlq")
    }
}

#[async_trait]
impl MessageBroker for MemoryBroker {
    async fn publish(&self, message: OutgoingMessage) -> Result<(), BrokerError> {
        self.ensure_online()?;
        self.enqueue(message);
        self.published.notify_waiters();
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        handler: Arc<dyn MessageHandler>,
        shutdown: CancellationToken,
    ) -> Result<(), BrokerError> {
        info!(queue = %queue, "Starting in-memory consumer");
        loop {
            // Registered before checking the queue so a publish in between is not missed
            let notified = self.published.notified();

            if shutdown.is_cancelled() {
                break;
            }
            self.ensure_online()?;

            match self.take(queue) {
                Some(incoming) => self.deliver(handler.as_ref(), incoming).await,
                None => {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = notified => {}
                    }
                }
            }
        }
        info!(queue = %queue, "In-memory consumer stopped");
        Ok(())
    }

    async fn ping(&self) -> Result<(), BrokerError> {
        self.ensure_online()
    }

    async fn queue_depth(&self, queue: &str) -> Result<u64, BrokerError> {
        self.ensure_online()?;
        Ok(self
            .queues
            .lock()
            .get(queue)
            .map(|state| state.pending.len() as u64)
            .unwrap_or(0))
    }
}

/// In-memory [`ObjectStore`]
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<HashMap<String, (Bytes, String)>>,
    offline: AtomicBool,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn ensure_online(&self) -> Result<(), ObjectStoreError> {
        if self.offline.load(Ordering::SeqCst) {
            Err(ObjectStoreError::Unavailable(
                "memory object store is offline".to_string(),
            ))
        } else {
            Ok(())
        }
    }

    /// Stored keys, sorted
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.objects.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn content_type(&self, key: &str) -> Option<String> {
        self.objects.lock().get(key).map(|(_, ct)| ct.clone())
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put_object(
        &self,
        key: &str,
        body: Bytes,
        content_type: &str,
    ) -> Result<(), ObjectStoreError> {
        self.ensure_online()?;
        self.objects
            .lock()
            .insert(key.to_string(), (body, content_type.to_string()));
        Ok(())
    }

    async fn get_object(&self, key: &str) -> Result<Bytes, ObjectStoreError> {
        self.ensure_online()?;
        self.objects
            .lock()
            .get(key)
            .map(|(body, _)| body.clone())
            .ok_or_else(|| ObjectStoreError::NotFound(key.to_string()))
    }

    async fn exists(&self, key: &str) -> Result<bool, ObjectStoreError> {
        self.ensure_online()?;
        Ok(self.objects.lock().contains_key(key))
    }

    async fn ping(&self) -> Result<(), ObjectStoreError> {
        self.ensure_online()
    }
}
