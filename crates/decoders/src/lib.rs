pub mod envelope;

use gapless_common::types::Notification;
use thiserror::Error;

pub use envelope::{JsonEnvelopeDecoder, decode, encode};

/// Broad class of a decoding failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeErrorKind {
    /// The bytes are not a JSON object at all.
    MalformedEnvelope,
    /// The JSON object lacks a required field or a field has the wrong type.
    SchemaMismatch,
}

impl std::fmt::Display for DecodeErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeErrorKind::MalformedEnvelope => write!(f, "malformed envelope"),
            DecodeErrorKind::SchemaMismatch => write!(f, "schema mismatch"),
        }
    }
}

/// Error returned when a queued payload cannot become a `Notification`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {detail}")]
pub struct DecodeError {
    pub kind: DecodeErrorKind,
    pub detail: String,
}

impl DecodeError {
    pub fn malformed(detail: impl Into<String>) -> Self {
        Self {
            kind: DecodeErrorKind::MalformedEnvelope,
            detail: detail.into(),
        }
    }

    pub fn schema(detail: impl Into<String>) -> Self {
        Self {
            kind: DecodeErrorKind::SchemaMismatch,
            detail: detail.into(),
        }
    }
}

/// Trait that all envelope formats must implement.
///
/// Decoding is a pure function of the input bytes: no I/O, no defaults for
/// missing fields, and no panics on hostile input.
pub trait PayloadDecoder: Send + Sync {
    /// Parse raw queue bytes into a validated notification.
    fn decode(&self, raw: &[u8]) -> Result<Notification, DecodeError>;

    /// Human-readable name for this decoder (e.g., "JSON envelope").
    fn name(&self) -> &'static str;
}
