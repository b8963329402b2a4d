use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Supported push providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Apns,
    Fcm,
    /// Development backend that logs instead of delivering.
    Log,
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Provider::Apns => write!(f, "apns"),
            Provider::Fcm => write!(f, "fcm"),
            Provider::Log => write!(f, "log"),
        }
    }
}

impl std::str::FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "apns" => Ok(Provider::Apns),
            "fcm" => Ok(Provider::Fcm),
            "log" => Ok(Provider::Log),
            other => Err(format!("unknown push provider: {other}")),
        }
    }
}

/// Rejected attempt to build a `Notification` that violates its invariants.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidNotification {
    #[error("token must not be empty")]
    EmptyToken,
}

/// A decoded push notification ready for delivery.
///
/// Immutable once built: fields are private and only reachable through
/// getters. The token is never empty.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    token: String,
    identifier: u32,
    expiry_secs: u64,
    data: Map<String, Value>,
}

impl Notification {
    pub fn new(
        token: impl Into<String>,
        identifier: u32,
        expiry_secs: u64,
        data: Map<String, Value>,
    ) -> Result<Self, InvalidNotification> {
        let token = token.into();
        if token.is_empty() {
            return Err(InvalidNotification::EmptyToken);
        }

        Ok(Self {
            token,
            identifier,
            expiry_secs,
            data,
        })
    }

    /// Device token (APNs hex token or FCM registration id).
    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn identifier(&self) -> u32 {
        self.identifier
    }

    /// Time the provider should keep retrying delivery to the device.
    pub fn expiry(&self) -> Duration {
        Duration::from_secs(self.expiry_secs)
    }

    pub fn expiry_secs(&self) -> u64 {
        self.expiry_secs
    }

    /// Provider payload, e.g. `{"aps": {...}, "acme1": "bar"}`.
    pub fn data(&self) -> &Map<String, Value> {
        &self.data
    }
}

/// Why a delivery did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FailureReason {
    #[error("delivery timed out")]
    Timeout,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("provider throttled the request")]
    Throttled,

    #[error("provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("invalid device token: {0}")]
    InvalidToken(String),

    #[error("payload rejected: {0}")]
    PayloadRejected(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),
}

/// Outcome of a single delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryResult {
    Success,
    /// Worth retrying later (network, timeout, throttling, 5xx).
    TransientFailure(FailureReason),
    /// The provider rejected the token or payload; retrying cannot help.
    PermanentFailure(FailureReason),
}

impl DeliveryResult {
    pub fn is_success(&self) -> bool {
        matches!(self, DeliveryResult::Success)
    }

    pub fn reason(&self) -> Option<&FailureReason> {
        match self {
            DeliveryResult::Success => None,
            DeliveryResult::TransientFailure(reason) | DeliveryResult::PermanentFailure(reason) => {
                Some(reason)
            }
        }
    }
}

impl std::fmt::Display for DeliveryResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryResult::Success => write!(f, "success"),
            DeliveryResult::TransientFailure(reason) => write!(f, "transient failure: {reason}"),
            DeliveryResult::PermanentFailure(reason) => write!(f, "permanent failure: {reason}"),
        }
    }
}
