use thiserror::Error;

/// Result type alias for queue operations
pub type QueueResult<T> = Result<T, QueueError>;

/// Error types for queue operations
#[derive(Error, Debug)]
pub enum QueueError {
    /// Error talking to Redis
    #[error("Redis queue error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Error serializing a stored message
    #[error("Failed to serialize queue message: {0}")]
    Serialization(#[from] serde_json::Error),
}
