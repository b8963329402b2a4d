use async_trait::async_trait;
use serde_json::Value;

use gapless_common::types::{DeliveryResult, Notification, Provider};

use crate::delivery::DeliveryClient;

/// Dry-run provider: logs the notification and reports success.
#[derive(Debug, Default)]
pub struct LogClient;

impl LogClient {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl DeliveryClient for LogClient {
    async fn deliver(&self, notification: &Notification) -> DeliveryResult {
        let data = Value::Object(notification.data().clone());
        tracing::info!(
            identifier = notification.identifier(),
            token = %notification.token(),
            expiry_secs = notification.expiry_secs(),
            data = %data,
            "Dry-run delivery"
        );
        DeliveryResult::Success
    }

    fn provider(&self) -> Provider {
        Provider::Log
    }
}
