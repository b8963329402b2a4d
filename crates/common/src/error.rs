use thiserror::Error;

/// Common error types used across the dispatcher.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Provider error: {0}")]
    Provider(String),
}

pub type AppResult<T> = Result<T, AppError>;
