//! Error types for the wire protocol and push delivery.

use thiserror::Error;

/// A frame on either channel could not be understood.
///
/// Always handled by the connection that received it: the frame is dropped
/// or that one connection is closed. It never reaches other clients.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// The frame bytes are not valid UTF-8.
    #[error("frame is not valid UTF-8")]
    InvalidUtf8,
    /// The frame is not parseable JSON.
    #[error("invalid JSON: {0}")]
    InvalidJson(String),
    /// A required field is absent.
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    /// A field is present but has the wrong shape.
    #[error("field `{field}` must be {expected}")]
    InvalidField {
        /// Dotted path of the offending field.
        field: &'static str,
        /// What the field should have been.
        expected: &'static str,
    },
    /// An outbound message could not be serialized.
    #[error("failed to encode message: {0}")]
    Encode(String),
}

impl ProtocolError {
    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::InvalidUtf8 => "invalid_utf8",
            Self::InvalidJson(_) => "invalid_json",
            Self::MissingField(_) => "missing_field",
            Self::InvalidField { .. } => "invalid_field",
            Self::Encode(_) => "encode",
        }
    }
}

/// Delivery of an invalidation to one client failed.
///
/// Pushes are best-effort: the caller logs and moves on to the next
/// subscriber.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum PushError {
    /// The client's outbound queue is full; the push was dropped.
    #[error("client send queue is full")]
    QueueFull,
    /// The client's connection is already gone.
    #[error("client connection is closed")]
    Closed,
    /// The invalidation could not be encoded for this transport.
    #[error("failed to encode push: {0}")]
    Encode(String),
}
