//! JSON envelope format pushed by producers:
//!
//! ```json
//! {"token": "fcd9...d814", "identifier": 5, "expiry": 7200, "data": {"aps": {"alert": "hi"}}}
//! ```
//!
//! `expiry` is a number of seconds. Unknown top-level fields are ignored.

use gapless_common::types::Notification;
use serde_json::{Value, json};

use crate::{DecodeError, PayloadDecoder};

/// Strict decoder for the JSON envelope.
pub struct JsonEnvelopeDecoder;

impl JsonEnvelopeDecoder {
    pub fn new() -> Self {
        Self
    }
}

impl Default for JsonEnvelopeDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl PayloadDecoder for JsonEnvelopeDecoder {
    fn decode(&self, raw: &[u8]) -> Result<Notification, DecodeError> {
        decode(raw)
    }

    fn name(&self) -> &'static str {
        "JSON envelope"
    }
}

/// Decode a raw envelope into a `Notification`.
pub fn decode(raw: &[u8]) -> Result<Notification, DecodeError> {
    let value: Value = serde_json::from_slice(raw)
        .map_err(|e| DecodeError::malformed(format!("invalid JSON: {e}")))?;

    let Value::Object(mut envelope) = value else {
        return Err(DecodeError::malformed("envelope is not a JSON object"));
    };

    let token = match envelope.get("token") {
        Some(Value::String(token)) if !token.is_empty() => token.clone(),
        Some(Value::String(_)) => return Err(DecodeError::schema("token is empty")),
        Some(other) => return Err(mistyped("token", "a string", other)),
        None => return Err(missing("token")),
    };

    let identifier = match envelope.get("identifier") {
        Some(Value::Number(n)) => n
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .ok_or_else(|| {
                DecodeError::schema(format!("identifier {n} is not an integer in 0..=4294967295"))
            })?,
        Some(other) => return Err(mistyped("identifier", "an integer", other)),
        None => return Err(missing("identifier")),
    };

    let expiry_secs = match envelope.get("expiry") {
        Some(Value::Number(n)) => n.as_u64().ok_or_else(|| {
            DecodeError::schema(format!("expiry {n} is not a non-negative whole number of seconds"))
        })?,
        Some(other) => return Err(mistyped("expiry", "a number of seconds", other)),
        None => return Err(missing("expiry")),
    };

    let data = match envelope.remove("data") {
        Some(Value::Object(data)) => data,
        Some(other) => return Err(mistyped("data", "an object", &other)),
        None => return Err(missing("data")),
    };

    Notification::new(token, identifier, expiry_secs, data)
        .map_err(|e| DecodeError::schema(e.to_string()))
}

/// Encode a `Notification` into the canonical envelope.
pub fn encode(notification: &Notification) -> Vec<u8> {
    envelope_value(notification).to_string().into_bytes()
}

fn envelope_value(notification: &Notification) -> Value {
    json!({
        "token": notification.token(),
        "identifier": notification.identifier(),
        "expiry": notification.expiry_secs(),
        "data": Value::Object(notification.data().clone()),
    })
}

fn missing(field: &str) -> DecodeError {
    DecodeError::schema(format!("missing required field `{field}`"))
}

fn mistyped(field: &str, expected: &str, found: &Value) -> DecodeError {
    DecodeError::schema(format!(
        "field `{field}` must be {expected}, found {}",
        type_name(found)
    ))
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
