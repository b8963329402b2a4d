use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{Map, Value, json};

use gapless_common::config::FcmConfig;
use gapless_common::error::AppError;
use gapless_common::types::{DeliveryResult, FailureReason, Notification, Provider};

use crate::delivery::{DeliveryClient, classify_transport_error};

/// Firebase Cloud Messaging client for the HTTP v1 API.
pub struct FcmClient {
    http: Client,
    send_url: String,
    access_token: String,
}

impl FcmClient {
    pub fn new(config: &FcmConfig, request_timeout: Duration) -> Result<Self, AppError> {
        let http = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| AppError::Provider(format!("Failed to build FCM HTTP client: {e}")))?;

        Ok(Self {
            http,
            send_url: format!(
                "{}/v1/projects/{}/messages:send",
                config.endpoint.trim_end_matches('/'),
                config.project_id
            ),
            access_token: config.access_token.clone(),
        })
    }
}

#[async_trait]
impl DeliveryClient for FcmClient {
    async fn deliver(&self, notification: &Notification) -> DeliveryResult {
        let response = self
            .http
            .post(&self.send_url)
            .bearer_auth(&self.access_token)
            .json(&message_body(notification))
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
        let error = serde_json::from_str::<Value>(&body)
            .ok()
            .and_then(|v| v.get("error").cloned());
        let code = error
            .as_ref()
            .and_then(|e| e.get("status"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let message = error
            .as_ref()
            .and_then(|e| e.get("message"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| status.to_string());

        tracing::debug!(
            identifier = notification.identifier(),
            status = status.as_u16(),
            code = %code,
            "FCM rejected notification"
        );

        classify_response(status, &code, &message)
    }

    fn provider(&self) -> Provider {
        Provider::Fcm
    }
}

/// FCM `data` only carries string values, so nested values are serialized.
fn message_body(notification: &Notification) -> Value {
    let data: Map<String, Value> = notification
        .data()
        .iter()
        .map(|(key, value)| {
            let flat = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (key.clone(), Value::String(flat))
        })
        .collect();

    json!({
        "message": {
            "token": notification.token(),
            "data": data,
            "android": { "ttl": format!("{}s", notification.expiry_secs()) }
        }
    })
}

pub(crate) fn classify_response(status: StatusCode, code: &str, message: &str) -> DeliveryResult {
    use DeliveryResult::{PermanentFailure, TransientFailure};

    if code == "UNREGISTERED" {
        return PermanentFailure(FailureReason::InvalidToken(message.to_string()));
    }

    match status.as_u16() {
        400 => PermanentFailure(FailureReason::PayloadRejected(message.to_string())),
        401 | 403 => PermanentFailure(FailureReason::Unauthorized(message.to_string())),
        404 => PermanentFailure(FailureReason::InvalidToken(message.to_string())),
        429 => TransientFailure(FailureReason::Throttled),
        500..=599 => TransientFailure(FailureReason::ProviderUnavailable(message.to_string())),
        400..=499 => PermanentFailure(FailureReason::PayloadRejected(message.to_string())),
        _ => TransientFailure(FailureReason::Transport(format!(
            "unexpected status {status}: {message}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_body_flattens_data() {
        let data = json!({"aps": {"badge": 1}, "acme1": "bar", "acme2": 42});
        let n = Notification::new("token-1", 7, 7200, data.as_object().unwrap().clone()).unwrap();

        let body = message_body(&n);
        assert_eq!(body["message"]["token"], "token-1");
        assert_eq!(body["message"]["data"]["acme1"], "bar");
        assert_eq!(body["message"]["data"]["acme2"], "42");
        assert_eq!(body["message"]["data"]["aps"], r#"{"badge":1}"#);
        assert_eq!(body["message"]["android"]["ttl"], "7200s");
    }

    #[test]
    fn test_classify_response() {
        use DeliveryResult::{PermanentFailure, TransientFailure};

        assert_eq!(
            classify_response(StatusCode::NOT_FOUND, "UNREGISTERED", "gone"),
            PermanentFailure(FailureReason::InvalidToken("gone".into()))
        );
        assert_eq!(
            classify_response(StatusCode::BAD_REQUEST, "UNREGISTERED", "gone"),
            PermanentFailure(FailureReason::InvalidToken("gone".into()))
        );
        assert_eq!(
            classify_response(StatusCode::BAD_REQUEST, "INVALID_ARGUMENT", "bad"),
            PermanentFailure(FailureReason::PayloadRejected("bad".into()))
        );
        assert_eq!(
            classify_response(StatusCode::UNAUTHORIZED, "UNAUTHENTICATED", "expired"),
            PermanentFailure(FailureReason::Unauthorized("expired".into()))
        );
        assert_eq!(
            classify_response(StatusCode::TOO_MANY_REQUESTS, "QUOTA_EXCEEDED", "slow down"),
            TransientFailure(FailureReason::Throttled)
        );
        assert_eq!(
            classify_response(StatusCode::BAD_GATEWAY, "", "502"),
            TransientFailure(FailureReason::ProviderUnavailable("502".into()))
        );
    }
}
