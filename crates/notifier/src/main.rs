//! Gapless notifier binary entrypoint.

use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use gapless_common::config::AppConfig;
use gapless_common::redis_pool::create_redis_pool;
use gapless_decoders::JsonEnvelopeDecoder;

use gapless_notifier::http::{self, StatsState};
use gapless_notifier::{providers, signal};
use gapless_notifier::queue::{QueueConsumer, RedisQueue, RedisQueueConfig};
use gapless_notifier::{DispatchConfig, RedisDeadLetterSink, ResultTracker, WorkerPool};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gapless_notifier=info,gapless_decoders=info".into()),
        )
        .json()
        .init();

    tracing::info!("Gapless notifier starting...");

    // Load configuration
    let config = AppConfig::from_env()?;
    config.validate()?;

    // Fail fast when Redis is unreachable
    let (client, manager) = create_redis_pool(&config.redis_url).await?;
    let queue = Arc::new(RedisQueue::new(
        client,
        manager.clone(),
        RedisQueueConfig {
            name: config.queue_name.clone(),
            visibility_timeout: config.visibility_timeout(),
        },
    ));
    queue.ping().await?;
    queue.recover_orphans().await?;

    let delivery = providers::build(&config)?;
    let dead_letters = Arc::new(
        RedisDeadLetterSink::new(manager, &config.queue_name)
            .with_max_len(config.dead_letter_max_len),
    );
    tracing::info!(
        queue = %config.queue_name,
        dead_letters = %dead_letters.key(),
        "Redis queue ready"
    );

    let tracker = Arc::new(ResultTracker::new(
        config.stats_window(),
        config.stats_window_count,
    ));

    let pool = WorkerPool::new(
        DispatchConfig::from_app_config(&config),
        queue,
        delivery,
        Arc::new(JsonEnvelopeDecoder::new()),
        dead_letters,
        tracker.clone(),
    )?;
    let shutdown = pool.shutdown_token();

    // Run with graceful shutdown on Ctrl+C or SIGTERM
    tokio::spawn(signal::cancel_on(signal::shutdown_signal(), shutdown.clone()));

    let stats_state = StatsState {
        tracker,
        queue_name: config.queue_name.clone(),
    };
    let http_port = config.http_port;
    let server_token = shutdown.clone();
    let stats_server = tokio::spawn(async move {
        if let Err(e) = http::serve(stats_state, http_port, server_token).await {
            tracing::error!(error = %e, "Stats server exited with error");
        }
    });

    pool.run().await;

    if let Err(e) = stats_server.await {
        tracing::error!(error = %e, "Stats server task failed");
    }

    tracing::info!("Gapless notifier stopped.");
    Ok(())
}
