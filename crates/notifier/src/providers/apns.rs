use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use reqwest::{Client, StatusCode};
use serde_json::{Value, json};
use tokio::sync::RwLock;

use gapless_common::config::ApnsConfig;
use gapless_common::error::AppError;
use gapless_common::types::{DeliveryResult, FailureReason, Notification, Provider};

use crate::delivery::{DeliveryClient, classify_transport_error};

/// Largest payload APNs accepts for a regular remote notification.
pub const MAX_PAYLOAD_BYTES: usize = 4096;

/// Provider tokens are valid for one hour; refresh well before that.
const TOKEN_REFRESH_SECS: i64 = 50 * 60;

struct ProviderToken {
    jwt: String,
    issued_at: i64,
}

/// APNs (Apple Push Notification service) client using the HTTP/2 API
/// with token-based authentication.
pub struct ApnsClient {
    http: Client,
    endpoint: String,
    topic: String,
    team_id: String,
    key_id: String,
    signing_key: EncodingKey,
    token: RwLock<Option<ProviderToken>>,
}

impl ApnsClient {
    /// Build a client, loading the `.p8` signing key from `config.key_path`.
    pub fn new(config: &ApnsConfig, request_timeout: Duration) -> Result<Self, AppError> {
        let pem = std::fs::read(&config.key_path).map_err(|e| {
            AppError::Provider(format!(
                "Failed to read APNs signing key {}: {e}",
                config.key_path
            ))
        })?;
        Self::from_pem(config, &pem, request_timeout)
    }

    /// Build a client from an in-memory PEM (PKCS#8 EC P-256 key).
    pub fn from_pem(
        config: &ApnsConfig,
        pem: &[u8],
        request_timeout: Duration,
    ) -> Result<Self, AppError> {
        let signing_key = EncodingKey::from_ec_pem(pem)
            .map_err(|e| AppError::Provider(format!("Failed to parse APNs signing key: {e}")))?;

        let http = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| AppError::Provider(format!("Failed to build APNs HTTP client: {e}")))?;

        Ok(Self {
            http,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            topic: config.topic.clone(),
            team_id: config.team_id.clone(),
            key_id: config.key_id.clone(),
            signing_key,
            token: RwLock::new(None),
        })
    }

    /// Return a cached provider JWT, minting a new one when it is stale.
    async fn provider_token(&self) -> Result<String, jsonwebtoken::errors::Error> {
        let now = Utc::now().timestamp();

        if let Some(token) = self.token.read().await.as_ref()
            && now - token.issued_at < TOKEN_REFRESH_SECS
        {
            return Ok(token.jwt.clone());
        }

        let mut guard = self.token.write().await;
        if let Some(token) = guard.as_ref()
            && now - token.issued_at < TOKEN_REFRESH_SECS
        {
            return Ok(token.jwt.clone());
        }

        let mut header = Header::new(Algorithm::ES256);
        header.kid = Some(self.key_id.clone());
        let claims = json!({ "iss": self.team_id, "iat": now });
        let jwt = encode(&header, &claims, &self.signing_key)?;

        tracing::debug!(key_id = %self.key_id, "Minted APNs provider token");
        *guard = Some(ProviderToken {
            jwt: jwt.clone(),
            issued_at: now,
        });
        Ok(jwt)
    }

    async fn invalidate_token(&self) {
        self.token.write().await.take();
    }
}

#[async_trait]
impl DeliveryClient for ApnsClient {
    async fn deliver(&self, notification: &Notification) -> DeliveryResult {
        if let Some(rejection) = validate(notification) {
            return rejection;
        }

        let jwt = match self.provider_token().await {
            Ok(jwt) => jwt,
            Err(e) => {
                tracing::error!(error = %e, "Failed to sign APNs provider token");
                return DeliveryResult::PermanentFailure(FailureReason::Unauthorized(
                    e.to_string(),
                ));
            }
        };

        let url = format!("{}/3/device/{}", self.endpoint, notification.token());
        let response = self
            .http
            .post(&url)
            .header("authorization", format!("bearer {jwt}"))
            .header("apns-topic", &self.topic)
            .header("apns-priority", "10")
            .header("apns-push-type", "alert")
            .header("apns-expiration", expiration(notification).to_string())
            .json(&Value::Object(notification.data().clone()))
            .send()
            .await;

        let response = match response {
            Ok(response) => response,
            Err(e) => return classify_transport_error(&e),
        };

        let status = response.status();
        if status.is_success() {
            return DeliveryResult::Success;
        }

        let body = response.text().await.unwrap_or_default();
        let reason = serde_json::from_str::<Value>(&body)
            .ok()
            .and_then(|v| v.get("reason").and_then(Value::as_str).map(str::to_string))
            .unwrap_or_else(|| status.to_string());

        tracing::debug!(
            identifier = notification.identifier(),
            status = status.as_u16(),
            reason = %reason,
            "APNs rejected notification"
        );

        if status == StatusCode::FORBIDDEN && reason == "ExpiredProviderToken" {
            self.invalidate_token().await;
        }

        classify_response(status, &reason)
    }

    fn provider(&self) -> Provider {
        Provider::Apns
    }
}

/// Reject notifications APNs would refuse, without a network round trip.
fn validate(notification: &Notification) -> Option<DeliveryResult> {
    if hex::decode(notification.token()).is_err() {
        return Some(DeliveryResult::PermanentFailure(FailureReason::InvalidToken(
            "device token is not hex encoded".to_string(),
        )));
    }

    let size = Value::Object(notification.data().clone()).to_string().len();
    if size > MAX_PAYLOAD_BYTES {
        return Some(DeliveryResult::PermanentFailure(FailureReason::PayloadRejected(
            format!("payload is {size} bytes, limit is {MAX_PAYLOAD_BYTES}"),
        )));
    }

    None
}

/// Absolute `apns-expiration` timestamp; 0 asks APNs to try only once.
fn expiration(notification: &Notification) -> i64 {
    match notification.expiry_secs() {
        0 => 0,
        secs => Utc::now()
            .timestamp()
            .saturating_add(i64::try_from(secs).unwrap_or(i64::MAX)),
    }
}

/// Classify a non-2xx APNs response by status and `reason`.
pub(crate) fn classify_response(status: StatusCode, reason: &str) -> DeliveryResult {
    use DeliveryResult::{PermanentFailure, TransientFailure};

    match status.as_u16() {
        400 => match reason {
            "BadDeviceToken" | "DeviceTokenNotForTopic" => {
                PermanentFailure(FailureReason::InvalidToken(reason.to_string()))
            }
            _ => PermanentFailure(FailureReason::PayloadRejected(reason.to_string())),
        },
        // A stale provider token heals once a fresh one is minted.
        403 if reason == "ExpiredProviderToken" => {
            TransientFailure(FailureReason::Unauthorized(reason.to_string()))
        }
        403 => PermanentFailure(FailureReason::Unauthorized(reason.to_string())),
        410 => PermanentFailure(FailureReason::InvalidToken(reason.to_string())),
        413 => PermanentFailure(FailureReason::PayloadRejected(reason.to_string())),
        429 => TransientFailure(FailureReason::Throttled),
        500..=599 => TransientFailure(FailureReason::ProviderUnavailable(reason.to_string())),
        400..=499 => PermanentFailure(FailureReason::PayloadRejected(reason.to_string())),
        _ => TransientFailure(FailureReason::Transport(format!(
            "unexpected status {status}: {reason}"
        ))),
    }
}
