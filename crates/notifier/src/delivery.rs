//! Delivery capability shared by all push providers.
//!
//! The dispatch core only ever sees `DeliveryClient`; transport, auth and
//! status-code mapping stay inside the provider implementations.

use std::time::Duration;

use async_trait::async_trait;

use gapless_common::types::{DeliveryResult, FailureReason, Notification, Provider};

/// A push provider backend.
#[async_trait]
pub trait DeliveryClient: Send + Sync {
    /// Deliver one notification and classify the outcome.
    ///
    /// Implementations must not panic on provider errors; every failure is
    /// reported as a transient or permanent `DeliveryResult`.
    async fn deliver(&self, notification: &Notification) -> DeliveryResult;

    /// Which provider this client talks to.
    fn provider(&self) -> Provider;
}

/// Deliver with an upper bound on wall-clock time.
///
/// If the client does not answer within `timeout` the call is abandoned and
/// reported as `TransientFailure(Timeout)`.
pub async fn deliver_with_timeout(
    client: &dyn DeliveryClient,
    notification: &Notification,
    timeout: Duration,
) -> DeliveryResult {
    match tokio::time::timeout(timeout, client.deliver(notification)).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(
                provider = %client.provider(),
                identifier = notification.identifier(),
                timeout_ms = timeout.as_millis() as u64,
                "Delivery timed out"
            );
            DeliveryResult::TransientFailure(FailureReason::Timeout)
        }
    }
}

/// Map an HTTP transport error onto a delivery result.
pub(crate) fn classify_transport_error(err: &reqwest::Error) -> DeliveryResult {
    if err.is_timeout() {
        DeliveryResult::TransientFailure(FailureReason::Timeout)
    } else if err.is_builder() {
        DeliveryResult::PermanentFailure(FailureReason::PayloadRejected(err.to_string()))
    } else {
        DeliveryResult::TransientFailure(FailureReason::Transport(err.to_string()))
    }
}
