//! Shared configuration, error and data types for the Gapless dispatcher.

pub mod config;
pub mod error;
pub mod redis_pool;
pub mod types;
