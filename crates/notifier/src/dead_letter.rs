//! Terminal storage for messages that will never be delivered.

use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Why a message was dead-lettered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterKind {
    /// The envelope could not be decoded
    Decode,
    /// The provider rejected the notification for good
    Permanent,
    /// Transient failures outlasted the retry budget
    RetriesExhausted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub message_id: Uuid,
    /// Known only when the envelope decoded
    pub identifier: Option<u32>,
    pub attempts: u32,
    pub kind: DeadLetterKind,
    pub reason: String,
    /// Raw envelope as received from the queue
    pub body: String,
    pub dead_lettered_at: DateTime<Utc>,
}

#[derive(Error, Debug)]
pub enum DeadLetterError {
    #[error("Failed to write dead letter to Redis: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Failed to serialize dead letter: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn record(&self, entry: DeadLetter) -> Result<(), DeadLetterError>;
}

/// Appends dead letters as JSON to the `<queue>:dead` list.
///
/// Unbounded unless a cap is set with `with_max_len`; without one, operators
/// are expected to drain the list.
pub struct RedisDeadLetterSink {
    manager: ConnectionManager,
    key: String,
    max_len: Option<usize>,
}

impl RedisDeadLetterSink {
    pub fn new(manager: ConnectionManager, queue_name: &str) -> Self {
        Self {
            manager,
            key: format!("{queue_name}:dead"),
            max_len: None,
        }
    }

    /// Keep only the newest `max_len` entries. Zero means no cap.
    pub fn with_max_len(mut self, max_len: usize) -> Self {
        self.max_len = (max_len > 0).then_some(max_len);
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

/// `LTRIM` start index that keeps the last `max_len` entries.
fn trim_start(max_len: usize) -> isize {
    -isize::try_from(max_len).unwrap_or(isize::MAX)
}

#[async_trait]
impl DeadLetterSink for RedisDeadLetterSink {
    async fn record(&self, entry: DeadLetter) -> Result<(), DeadLetterError> {
        let payload = serde_json::to_string(&entry)?;
        let mut conn = self.manager.clone();

        let mut pipe = redis::pipe();
        pipe.atomic().cmd("RPUSH").arg(&self.key).arg(payload).ignore();
        if let Some(max_len) = self.max_len {
            pipe.cmd("LTRIM")
                .arg(&self.key)
                .arg(trim_start(max_len))
                .arg(-1)
                .ignore();
        }
        let () = pipe.query_async(&mut conn).await?;
        Ok(())
    }
}

/// Keeps dead letters in memory.
#[derive(Default)]
pub struct MemoryDeadLetterSink {
    entries: Mutex<Vec<DeadLetter>>,
}

impl MemoryDeadLetterSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<DeadLetter> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl DeadLetterSink for MemoryDeadLetterSink {
    async fn record(&self, entry: DeadLetter) -> Result<(), DeadLetterError> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry);
        Ok(())
    }
}
