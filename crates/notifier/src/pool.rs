//! Fixed-size pool of dispatch workers.
//!
//! Each worker loops: pop a message with a bounded wait, decode it, deliver
//! it, then ack, requeue with backoff, or dead-letter according to the
//! `DispatchAttempt` outcome. Workers share nothing but the queue, the
//! delivery client, the dead-letter sink and the tracker.
//!
//! On shutdown a worker finishes the message it holds and stops before its
//! next pop.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use gapless_common::config::AppConfig;
use gapless_common::error::{AppError, AppResult};
use gapless_decoders::PayloadDecoder;

use crate::attempt::{DispatchAttempt, Outcome, RetryPolicy};
use crate::dead_letter::{DeadLetter, DeadLetterKind, DeadLetterSink};
use crate::delivery::{DeliveryClient, deliver_with_timeout};
use crate::queue::{QueueConsumer, QueueMessage};
use crate::tracker::ResultTracker;

/// Pause after a queue error before the next pop.
const DEFAULT_ERROR_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub worker_count: usize,
    pub retry: RetryPolicy,
    pub delivery_timeout: Duration,
    pub poll_timeout: Duration,
    pub error_backoff: Duration,
    pub log_successes: bool,
}

impl DispatchConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            worker_count: config.worker_count,
            retry: RetryPolicy {
                max_retries: config.max_retries,
                backoff_base: config.backoff_base(),
                backoff_cap: config.backoff_cap(),
            },
            delivery_timeout: config.delivery_timeout(),
            poll_timeout: config.poll_timeout(),
            error_backoff: DEFAULT_ERROR_BACKOFF,
            log_successes: config.log_successes,
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            worker_count: 2,
            retry: RetryPolicy::default(),
            delivery_timeout: Duration::from_secs(5),
            poll_timeout: Duration::from_secs(1),
            error_backoff: DEFAULT_ERROR_BACKOFF,
            log_successes: false,
        }
    }
}

struct Shared {
    config: DispatchConfig,
    queue: Arc<dyn QueueConsumer>,
    client: Arc<dyn DeliveryClient>,
    decoder: Arc<dyn PayloadDecoder>,
    dead_letters: Arc<dyn DeadLetterSink>,
    tracker: Arc<ResultTracker>,
    shutdown: CancellationToken,
}

pub struct WorkerPool {
    shared: Arc<Shared>,
}

impl WorkerPool {
    /// Fails when `config.delivery_timeout` does not fit inside the queue's
    /// visibility timeout, since a lease could then expire mid-delivery.
    pub fn new(
        config: DispatchConfig,
        queue: Arc<dyn QueueConsumer>,
        client: Arc<dyn DeliveryClient>,
        decoder: Arc<dyn PayloadDecoder>,
        dead_letters: Arc<dyn DeadLetterSink>,
        tracker: Arc<ResultTracker>,
    ) -> AppResult<Self> {
        let visibility_timeout = queue.visibility_timeout();
        if config.delivery_timeout >= visibility_timeout {
            return Err(AppError::Config(format!(
                "delivery timeout {:?} must be shorter than the queue visibility timeout {:?}",
                config.delivery_timeout, visibility_timeout
            )));
        }

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                queue,
                client,
                decoder,
                dead_letters,
                tracker,
                shutdown: CancellationToken::new(),
            }),
        })
    }

    /// Returns a clone of the shutdown token for external control
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shared.shutdown.clone()
    }

    pub fn tracker(&self) -> Arc<ResultTracker> {
        self.shared.tracker.clone()
    }

    /// Run all workers until the shutdown token is cancelled.
    pub async fn run(self) {
        let worker_count = self.shared.config.worker_count.max(1);
        tracing::info!(
            workers = worker_count,
            provider = %self.shared.client.provider(),
            decoder = self.shared.decoder.name(),
            "Starting dispatch workers"
        );

        let handles: Vec<JoinHandle<()>> = (0..worker_count)
            .map(|id| {
                let worker = Worker {
                    id,
                    shared: self.shared.clone(),
                };
                tokio::spawn(async move { worker.run().await })
            })
            .collect();

        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Dispatch worker task failed");
            }
        }

        tracing::info!("All dispatch workers stopped");
    }
}

struct Worker {
    id: usize,
    shared: Arc<Shared>,
}

impl Worker {
    async fn run(self) {
        let shared = &self.shared;
        tracing::debug!(worker = self.id, "Worker started");

        while !shared.shutdown.is_cancelled() {
            match shared.queue.pop(shared.config.poll_timeout).await {
                Ok(Some(message)) => self.handle(message).await,
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(worker = self.id, error = %e, "Queue pop failed, backing off");
                    tokio::select! {
                        _ = shared.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(shared.config.error_backoff) => {}
                    }
                }
            }
        }

        tracing::debug!(worker = self.id, "Worker stopped");
    }

    async fn handle(&self, message: QueueMessage) {
        let shared = &self.shared;

        let notification = match shared.decoder.decode(message.body()) {
            Ok(notification) => notification,
            Err(e) => {
                tracing::warn!(
                    worker = self.id,
                    message_id = %message.id(),
                    error = %e,
                    "Undecodable envelope"
                );
                self.dead_letter(message, None, DeadLetterKind::Decode, e.to_string())
                    .await;
                return;
            }
        };

        let identifier = notification.identifier();
        let mut attempt = DispatchAttempt::new(notification, message.attempts());
        if let Err(e) = attempt.begin() {
            tracing::error!(worker = self.id, message_id = %message.id(), error = %e, "Invalid dispatch state");
            return;
        }

        let result = deliver_with_timeout(
            shared.client.as_ref(),
            attempt.notification(),
            shared.config.delivery_timeout,
        )
        .await;

        let outcome = match attempt.complete(result, &shared.config.retry) {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(worker = self.id, message_id = %message.id(), error = %e, "Invalid dispatch state");
                return;
            }
        };

        match outcome {
            Outcome::Ack => self.ack_delivered(message, identifier).await,
            Outcome::Requeue {
                delay,
                next_attempt,
            } => {
                let message_id = message.id();
                let reason = attempt
                    .last_error()
                    .map(ToString::to_string)
                    .unwrap_or_default();

                match shared
                    .queue
                    .requeue(message.with_attempts(next_attempt), delay)
                    .await
                {
                    Ok(true) => {
                        shared.tracker.record_retried();
                        tracing::info!(
                            worker = self.id,
                            message_id = %message_id,
                            identifier,
                            attempt = next_attempt,
                            delay_ms = delay.as_millis() as u64,
                            reason = %reason,
                            "Delivery failed, retry scheduled"
                        );
                    }
                    Ok(false) => {
                        tracing::warn!(
                            worker = self.id,
                            message_id = %message_id,
                            "Lease lost before requeue; message will reappear after its visibility timeout"
                        );
                    }
                    Err(e) => {
                        tracing::error!(worker = self.id, message_id = %message_id, error = %e, "Failed to requeue message");
                    }
                }
            }
            Outcome::DeadLetter { kind, reason } => {
                self.dead_letter(message, Some(identifier), kind, reason).await;
            }
        }
    }

    async fn ack_delivered(&self, message: QueueMessage, identifier: u32) {
        let shared = &self.shared;
        let message_id = message.id();
        let attempt = message.attempts();

        shared.tracker.record_delivered();
        if shared.config.log_successes {
            tracing::info!(worker = self.id, message_id = %message_id, identifier, attempt, "Delivered notification");
        } else {
            tracing::debug!(worker = self.id, message_id = %message_id, identifier, attempt, "Delivered notification");
        }

        self.commit(message, message_id).await;
    }

    /// Record a dead letter, then ack. If the sink rejects the entry the
    /// message stays leased and reappears after the visibility timeout.
    async fn dead_letter(
        &self,
        message: QueueMessage,
        identifier: Option<u32>,
        kind: DeadLetterKind,
        reason: String,
    ) {
        let shared = &self.shared;
        let message_id = message.id();

        let entry = DeadLetter {
            message_id,
            identifier,
            attempts: message.attempts(),
            kind,
            reason,
            body: String::from_utf8_lossy(message.body()).into_owned(),
            dead_lettered_at: Utc::now(),
        };

        tracing::warn!(
            worker = self.id,
            message_id = %message_id,
            identifier = ?identifier,
            attempts = entry.attempts,
            kind = ?kind,
            reason = %entry.reason,
            "Dead-lettering message"
        );

        if let Err(e) = shared.dead_letters.record(entry).await {
            tracing::error!(
                worker = self.id,
                message_id = %message_id,
                error = %e,
                "Failed to record dead letter; leaving message unacked"
            );
            return;
        }

        shared.tracker.record_dead_lettered();
        self.commit(message, message_id).await;
    }

    async fn commit(&self, message: QueueMessage, message_id: Uuid) {
        match self.shared.queue.ack(message).await {
            Ok(true) => {}
            Ok(false) => tracing::warn!(
                worker = self.id,
                message_id = %message_id,
                "Lease lost before ack; message may be delivered again"
            ),
            Err(e) => tracing::error!(
                worker = self.id,
                message_id = %message_id,
                error = %e,
                "Failed to ack message"
            ),
        }
    }
}
