use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

use crate::error::AppError;
use crate::types::Provider;

/// Credentials for the APNs HTTP/2 provider API (token-based auth).
#[derive(Debug, Clone, Deserialize)]
pub struct ApnsConfig {
    /// `https://api.push.apple.com` or `https://api.sandbox.push.apple.com`
    pub endpoint: String,
    /// App bundle id sent as `apns-topic`
    pub topic: String,
    pub team_id: String,
    pub key_id: String,
    /// Path to the `.p8` signing key
    pub key_path: String,
}

/// Credentials for the FCM HTTP v1 API.
#[derive(Debug, Clone, Deserialize)]
pub struct FcmConfig {
    pub endpoint: String,
    pub project_id: String,
    /// OAuth 2.0 access token for the service account
    pub access_token: String,
}

/// Global dispatcher configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Redis connection string
    pub redis_url: String,

    /// Name of the Redis list producers push envelopes onto
    pub queue_name: String,

    /// Delivery backend selected at startup
    pub provider: Provider,

    /// Maximum number of retries after a transient failure (default: 5)
    pub max_retries: u32,

    /// Base retry delay in milliseconds, doubled per retry (default: 1000)
    pub backoff_base_ms: u64,

    /// Upper bound for the retry delay in milliseconds (default: 300000)
    pub backoff_cap_ms: u64,

    /// Number of concurrent dispatch workers (default: 2)
    pub worker_count: usize,

    /// Per-delivery timeout in milliseconds (default: 5000)
    pub delivery_timeout_ms: u64,

    /// How long a popped message stays hidden from other consumers (default: 60)
    pub visibility_timeout_secs: u64,

    /// How long a single blocking pop waits before re-checking shutdown (default: 1000)
    pub poll_timeout_ms: u64,

    /// Width of a result tracker window in seconds (default: 60)
    pub stats_window_secs: u64,

    /// Number of tracker windows kept (default: 60)
    pub stats_window_count: usize,

    /// Port for the `/health` and `/stats` server (default: 8080)
    pub http_port: u16,

    /// Log every successful delivery at info level
    pub log_successes: bool,

    /// Newest dead letters kept in `<queue>:dead`; 0 keeps all (default: 0)
    pub dead_letter_max_len: usize,

    pub apns: Option<ApnsConfig>,

    pub fcm: Option<FcmConfig>,
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, AppError> {
        dotenvy::dotenv().ok();
        Self::from_source(|key| std::env::var(key).ok())
    }

    /// Load configuration from an in-memory map of variables.
    pub fn from_map(vars: &HashMap<String, String>) -> Result<Self, AppError> {
        Self::from_source(|key| vars.get(key).cloned())
    }

    fn from_source(get: impl Fn(&str) -> Option<String>) -> Result<Self, AppError> {
        let or_default =
            |key: &str, default: &str| get(key).unwrap_or_else(|| default.to_string());

        let provider = or_default("PUSH_PROVIDER", "log")
            .parse::<Provider>()
            .map_err(AppError::Config)?;

        let apns = match (
            get("APNS_TOPIC"),
            get("APNS_TEAM_ID"),
            get("APNS_KEY_ID"),
            get("APNS_KEY_PATH"),
        ) {
            (Some(topic), Some(team_id), Some(key_id), Some(key_path)) => Some(ApnsConfig {
                endpoint: or_default("APNS_ENDPOINT", "https://api.push.apple.com"),
                topic,
                team_id,
                key_id,
                key_path,
            }),
            _ => None,
        };

        let fcm = match (get("FCM_PROJECT_ID"), get("FCM_ACCESS_TOKEN")) {
            (Some(project_id), Some(access_token)) => Some(FcmConfig {
                endpoint: or_default("FCM_ENDPOINT", "https://fcm.googleapis.com"),
                project_id,
                access_token,
            }),
            _ => None,
        };

        Ok(Self {
            redis_url: or_default("REDIS_URL", "redis://localhost:6379"),
            queue_name: get("QUEUE_NAME").ok_or_else(|| {
                AppError::Config("QUEUE_NAME environment variable is required".to_string())
            })?,
            provider,
            max_retries: parse_number(&get, "MAX_RETRIES", 5)?,
            backoff_base_ms: parse_number(&get, "BACKOFF_BASE_MS", 1_000)?,
            backoff_cap_ms: parse_number(&get, "BACKOFF_CAP_MS", 300_000)?,
            worker_count: parse_number(&get, "WORKER_COUNT", 2)?,
            delivery_timeout_ms: parse_number(&get, "DELIVERY_TIMEOUT_MS", 5_000)?,
            visibility_timeout_secs: parse_number(&get, "VISIBILITY_TIMEOUT_SECS", 60)?,
            poll_timeout_ms: parse_number(&get, "POLL_TIMEOUT_MS", 1_000)?,
            stats_window_secs: parse_number(&get, "STATS_WINDOW_SECS", 60)?,
            stats_window_count: parse_number(&get, "STATS_WINDOW_COUNT", 60)?,
            http_port: parse_number(&get, "HTTP_PORT", 8080)?,
            log_successes: parse_bool(&get, "LOG_SUCCESSES")?,
            dead_letter_max_len: parse_number(&get, "DEAD_LETTER_MAX_LEN", 0)?,
            apns,
            fcm,
        })
    }

    /// Check cross-field constraints that environment parsing cannot express.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.queue_name.trim().is_empty() {
            return Err(AppError::Config("QUEUE_NAME must not be empty".to_string()));
        }
        if self.worker_count == 0 {
            return Err(AppError::Config("WORKER_COUNT must be at least 1".to_string()));
        }
        if self.stats_window_secs == 0 || self.stats_window_count == 0 {
            return Err(AppError::Config(
                "STATS_WINDOW_SECS and STATS_WINDOW_COUNT must be positive".to_string(),
            ));
        }
        if self.backoff_cap_ms < self.backoff_base_ms {
            return Err(AppError::Config(
                "BACKOFF_CAP_MS must not be smaller than BACKOFF_BASE_MS".to_string(),
            ));
        }
        // A lease must outlive the delivery it protects.
        if self.visibility_timeout() <= self.delivery_timeout() {
            return Err(AppError::Config(
                "VISIBILITY_TIMEOUT_SECS must exceed DELIVERY_TIMEOUT_MS".to_string(),
            ));
        }

        match self.provider {
            Provider::Apns if self.apns.is_none() => Err(AppError::Config(
                "APNS_TOPIC, APNS_TEAM_ID, APNS_KEY_ID and APNS_KEY_PATH are required for the apns provider"
                    .to_string(),
            )),
            Provider::Fcm if self.fcm.is_none() => Err(AppError::Config(
                "FCM_PROJECT_ID and FCM_ACCESS_TOKEN are required for the fcm provider".to_string(),
            )),
            _ => Ok(()),
        }
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_millis(self.backoff_cap_ms)
    }

    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_millis(self.delivery_timeout_ms)
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn stats_window(&self) -> Duration {
        Duration::from_secs(self.stats_window_secs)
    }
}

fn parse_number<T: std::str::FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, AppError> {
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| AppError::Config(format!("{key} must be a valid number, got {raw:?}"))),
        None => Ok(default),
    }
}

fn parse_bool(get: &impl Fn(&str) -> Option<String>, key: &str) -> Result<bool, AppError> {
    match get(key).as_deref().map(str::trim) {
        None | Some("") => Ok(false),
        Some("1") | Some("true") | Some("TRUE") | Some("yes") => Ok(true),
        Some("0") | Some("false") | Some("FALSE") | Some("no") => Ok(false),
        Some(other) => Err(AppError::Config(format!(
            "{key} must be a boolean, got {other:?}"
        ))),
    }
}
