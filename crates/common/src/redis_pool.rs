use redis::Client;
use redis::aio::ConnectionManager;

use crate::error::AppResult;

/// Create a Redis connection manager for async operations.
///
/// Fails when the server cannot be reached, so callers can abort startup.
pub async fn create_redis_pool(redis_url: &str) -> AppResult<(Client, ConnectionManager)> {
    let client = Client::open(redis_url)?;
    let manager = ConnectionManager::new(client.clone()).await?;

    tracing::info!("Connected to Redis");
    Ok((client, manager))
}
