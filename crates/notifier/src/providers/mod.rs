//! Push provider backends.

pub mod apns;
pub mod fcm;
pub mod log;

use std::sync::Arc;

use gapless_common::config::AppConfig;
use gapless_common::error::AppError;
use gapless_common::types::Provider;

pub use apns::ApnsClient;
pub use fcm::FcmClient;
pub use self::log::LogClient;

use crate::delivery::DeliveryClient;

/// Build the delivery client selected by `config.provider`.
pub fn build(config: &AppConfig) -> Result<Arc<dyn DeliveryClient>, AppError> {
    let client: Arc<dyn DeliveryClient> = match config.provider {
        Provider::Apns => {
            let apns = config
                .apns
                .as_ref()
                .ok_or_else(|| AppError::Config("APNs credentials are not configured".into()))?;
            Arc::new(ApnsClient::new(apns, config.delivery_timeout())?)
        }
        Provider::Fcm => {
            let fcm = config
                .fcm
                .as_ref()
                .ok_or_else(|| AppError::Config("FCM credentials are not configured".into()))?;
            Arc::new(FcmClient::new(fcm, config.delivery_timeout())?)
        }
        Provider::Log => Arc::new(LogClient::new()),
    };

    tracing::info!(provider = %client.provider(), "Delivery provider ready");
    Ok(client)
}
