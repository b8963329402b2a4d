//! Queue consumer abstraction with lease-based visibility.
//!
//! A popped message is leased to exactly one consumer. The lease ends when the
//! consumer acks or requeues it, or when the visibility timeout elapses and the
//! message becomes poppable again (at-least-once delivery).

pub mod error;
pub mod memory;
pub mod redis;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use error::{QueueError, QueueResult};
pub use memory::{InMemoryQueue, QueueDepth};
pub use self::redis::{RedisQueue, RedisQueueConfig};

/// Blocking-pop queue with explicit ack/requeue.
#[async_trait]
pub trait QueueConsumer: Send + Sync {
    /// Wait up to `timeout` for a message. `None` means the wait elapsed.
    async fn pop(&self, timeout: Duration) -> QueueResult<Option<QueueMessage>>;

    /// Commit a message. Returns `false` if its lease was already lost.
    async fn ack(&self, message: QueueMessage) -> QueueResult<bool>;

    /// Release a message so it becomes poppable again after `delay`,
    /// carrying its current `attempts`. Returns `false` if the lease was lost.
    async fn requeue(&self, message: QueueMessage, delay: Duration) -> QueueResult<bool>;

    /// Check the backing store is reachable.
    async fn ping(&self) -> QueueResult<()>;

    /// How long a popped message stays leased before it is handed out again.
    fn visibility_timeout(&self) -> Duration;
}

/// A leased message. Consumed by `ack` or `requeue`.
#[derive(Debug)]
pub struct QueueMessage {
    id: Uuid,
    lease: String,
    body: Vec<u8>,
    attempts: u32,
}

impl QueueMessage {
    pub(crate) fn new(id: Uuid, lease: String, body: Vec<u8>, attempts: u32) -> Self {
        Self {
            id,
            lease,
            body,
            attempts,
        }
    }

    /// Stable id, preserved across requeues.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Id of this particular pop.
    pub fn lease(&self) -> &str {
        &self.lease
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Retries already scheduled for this message.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Set the attempt count the message will carry when requeued.
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }
}

/// Form a message takes once it has been popped at least once.
///
/// The body is hex encoded so the decoder later sees the producer's exact
/// bytes, valid UTF-8 or not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct StoredMessage {
    pub id: Uuid,
    pub attempts: u32,
    #[serde(with = "hex")]
    pub body: Vec<u8>,
}

impl StoredMessage {
    /// Interpret a raw list entry: either a previously stored message or a
    /// producer envelope seen for the first time.
    pub fn from_entry(raw: &[u8]) -> Self {
        if let Ok(stored) = serde_json::from_slice::<StoredMessage>(raw) {
            return stored;
        }
        Self {
            id: Uuid::new_v4(),
            attempts: 0,
            body: raw.to_vec(),
        }
    }

    pub fn into_message(self, lease: String) -> QueueMessage {
        QueueMessage::new(self.id, lease, self.body, self.attempts)
    }

    pub fn from_message(message: &QueueMessage) -> Self {
        Self {
            id: message.id,
            attempts: message.attempts,
            body: message.body.clone(),
        }
    }
}
