//! # Error Types
//!
//! The closed error taxonomy used across the bus, plus its wire form.
//!
//! Validation and security failures travel back to the caller as a
//! `RESPONSE` envelope carrying an [`ErrorPayload`]; local misuse surfaces
//! directly as a [`BusError`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Every failure the bus can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    // =========================================================================
    // REGISTRY
    // =========================================================================
    /// No peer with the given id is registered.
    PeerNotFound,
    /// A peer with the given id is already registered.
    PeerExists,
    /// The peer went away while an operation was in flight.
    PeerDisconnected,

    // =========================================================================
    // CONNECTION NEGOTIATION
    // =========================================================================
    /// The handshake did not reach `done` in time.
    HandshakeTimeout,
    /// The remote side sent an out-of-sequence handshake message.
    HandshakeRejected,
    /// The remote side speaks a different protocol version.
    VersionMismatch,

    // =========================================================================
    // REQUEST LAYER
    // =========================================================================
    /// No ACK arrived for a request in time.
    AckTimeout,
    /// No RESPONSE arrived for a request in time.
    ResponseTimeout,

    // =========================================================================
    // HANDLER SECURITY GATE
    // =========================================================================
    /// Caller is not in the handler's allow-list.
    Unauthorized,
    /// Caller exceeded the handler's rate limit.
    RateLimited,
    /// The handler's payload validator refused the payload.
    InvalidPayload,

    // =========================================================================
    // HANDLER EXECUTION
    // =========================================================================
    /// The handler returned an error.
    HandlerError,
    /// The handler did not finish in time.
    HandlerTimeout,
    /// No handler is registered under the requested name.
    NoHandler,

    // =========================================================================
    // VALIDATION
    // =========================================================================
    /// The message origin is not trusted.
    OriginForbidden,
    /// The inbound data is not a valid envelope.
    InvalidMessage,

    // =========================================================================
    // RESOURCE CEILINGS
    // =========================================================================
    /// A peer's offline queue is full.
    QueueFull,
    /// Too many requests are pending bus-wide.
    MaxPending,
    /// Too many peers are registered.
    MaxPeers,

    // =========================================================================
    // LIFECYCLE / COLLABORATORS
    // =========================================================================
    /// The bus has been destroyed.
    Destroyed,
    /// An upstream circuit breaker is open.
    CircuitOpen,
}

impl ErrorKind {
    /// All kinds, in declaration order.
    pub const ALL: [ErrorKind; 21] = [
        Self::PeerNotFound,
        Self::PeerExists,
        Self::PeerDisconnected,
        Self::HandshakeTimeout,
        Self::HandshakeRejected,
        Self::VersionMismatch,
        Self::AckTimeout,
        Self::ResponseTimeout,
        Self::Unauthorized,
        Self::RateLimited,
        Self::InvalidPayload,
        Self::HandlerError,
        Self::HandlerTimeout,
        Self::NoHandler,
        Self::OriginForbidden,
        Self::InvalidMessage,
        Self::QueueFull,
        Self::MaxPending,
        Self::MaxPeers,
        Self::Destroyed,
        Self::CircuitOpen,
    ];

    /// Wire code for this kind.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::PeerNotFound => "PEER_NOT_FOUND",
            Self::PeerExists => "PEER_EXISTS",
            Self::PeerDisconnected => "PEER_DISCONNECTED",
            Self::HandshakeTimeout => "HANDSHAKE_TIMEOUT",
            Self::HandshakeRejected => "HANDSHAKE_REJECTED",
            Self::VersionMismatch => "VERSION_MISMATCH",
            Self::AckTimeout => "ACK_TIMEOUT",
            Self::ResponseTimeout => "RESPONSE_TIMEOUT",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::RateLimited => "RATE_LIMITED",
            Self::InvalidPayload => "INVALID_PAYLOAD",
            Self::HandlerError => "HANDLER_ERROR",
            Self::HandlerTimeout => "HANDLER_TIMEOUT",
            Self::NoHandler => "NO_HANDLER",
            Self::OriginForbidden => "ORIGIN_FORBIDDEN",
            Self::InvalidMessage => "INVALID_MESSAGE",
            Self::QueueFull => "QUEUE_FULL",
            Self::MaxPending => "MAX_PENDING",
            Self::MaxPeers => "MAX_PEERS",
            Self::Destroyed => "DESTROYED",
            Self::CircuitOpen => "CIRCUIT_OPEN",
        }
    }

    /// Parse a wire code.
    #[must_use]
    pub fn from_code(code: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.code() == code)
    }

    /// Human-readable message used when no specific one is given.
    #[must_use]
    pub const fn default_message(self) -> &'static str {
        match self {
            Self::PeerNotFound => "Peer not found",
            Self::PeerExists => "Peer already exists",
            Self::PeerDisconnected => "Peer disconnected",
            Self::HandshakeTimeout => "Handshake timed out",
            Self::HandshakeRejected => "Handshake rejected",
            Self::VersionMismatch => "Protocol version mismatch",
            Self::AckTimeout => "Acknowledgement timed out",
            Self::ResponseTimeout => "Response timed out",
            Self::Unauthorized => "Caller is not authorized for this handler",
            Self::RateLimited => "Rate limit exceeded",
            Self::InvalidPayload => "Payload failed validation",
            Self::HandlerError => "Handler failed",
            Self::HandlerTimeout => "Handler timed out",
            Self::NoHandler => "No handler registered",
            Self::OriginForbidden => "Origin not allowed",
            Self::InvalidMessage => "Invalid message",
            Self::QueueFull => "Offline queue full",
            Self::MaxPending => "Too many pending requests",
            Self::MaxPeers => "Too many peers",
            Self::Destroyed => "Bus has been destroyed",
            Self::CircuitOpen => "Circuit breaker open",
        }
    }

    /// Whether retrying the same operation later can succeed.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::PeerDisconnected
                | Self::HandshakeTimeout
                | Self::AckTimeout
                | Self::ResponseTimeout
                | Self::RateLimited
                | Self::HandlerTimeout
                | Self::QueueFull
                | Self::MaxPending
                | Self::CircuitOpen
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Structured key/value context attached to an error.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ErrorDetails(BTreeMap<String, Value>);

impl ErrorDetails {
    /// Empty details.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one entry.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Look up an entry.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Render as a JSON object.
    #[must_use]
    pub fn to_value(&self) -> Value {
        Value::Object(self.0.clone().into_iter().collect())
    }

    /// Build from a JSON value. Non-objects are stored under `value`.
    #[must_use]
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(map) => Self(map.into_iter().collect()),
            Value::Null => Self::default(),
            other => Self::default().with("value", other),
        }
    }
}

/// The error type of every fallible bus operation.
#[derive(Debug, Clone, Error)]
#[error("[{kind}] {message}")]
pub struct BusError {
    kind: ErrorKind,
    message: String,
    details: ErrorDetails,
    retryable: bool,
    #[source]
    cause: Option<Arc<dyn std::error::Error + Send + Sync + 'static>>,
}

impl BusError {
    /// Create an error with the kind's default message.
    #[must_use]
    pub fn new(kind: ErrorKind) -> Self {
        Self::with_message(kind, kind.default_message())
    }

    /// Create an error with a specific message.
    #[must_use]
    pub fn with_message(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: ErrorDetails::new(),
            retryable: kind.is_retryable(),
            cause: None,
        }
    }

    /// Attach one detail entry.
    #[must_use]
    pub fn detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.details = self.details.with(key, value);
        self
    }

    /// Replace the detail map.
    #[must_use]
    pub fn with_details(mut self, details: ErrorDetails) -> Self {
        self.details = details;
        self
    }

    /// Wrap an underlying cause.
    #[must_use]
    pub fn caused_by<E>(mut self, cause: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.cause = Some(Arc::new(cause));
        self
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    #[must_use]
    pub fn details(&self) -> &ErrorDetails {
        &self.details
    }

    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    // -------------------------------------------------------------------------
    // Shorthands for the common cases
    // -------------------------------------------------------------------------

    #[must_use]
    pub fn peer_not_found(peer_id: &str) -> Self {
        Self::with_message(ErrorKind::PeerNotFound, format!("Peer not found: {peer_id}"))
            .detail("peer_id", peer_id)
    }

    #[must_use]
    pub fn peer_exists(peer_id: &str) -> Self {
        Self::with_message(ErrorKind::PeerExists, format!("Peer already exists: {peer_id}"))
            .detail("peer_id", peer_id)
    }

    #[must_use]
    pub fn peer_disconnected(peer_id: &str) -> Self {
        Self::with_message(
            ErrorKind::PeerDisconnected,
            format!("Peer disconnected: {peer_id}"),
        )
        .detail("peer_id", peer_id)
    }

    #[must_use]
    pub fn no_handler(handler: &str) -> Self {
        Self::with_message(ErrorKind::NoHandler, format!("No handler registered: {handler}"))
            .detail("handler", handler)
    }

    #[must_use]
    pub fn invalid_message(reason: impl Into<String>) -> Self {
        Self::with_message(ErrorKind::InvalidMessage, reason)
    }

    #[must_use]
    pub fn destroyed() -> Self {
        Self::new(ErrorKind::Destroyed)
    }

    /// Render for the wire.
    #[must_use]
    pub fn to_payload(&self) -> ErrorPayload {
        ErrorPayload {
            code: self.kind.code().to_string(),
            message: self.message.clone(),
            details: (!self.details.is_empty()).then(|| self.details.to_value()),
        }
    }

    /// Rebuild from the wire. Unknown codes become `HANDLER_ERROR`.
    #[must_use]
    pub fn from_payload(payload: ErrorPayload) -> Self {
        let details = payload
            .details
            .map(ErrorDetails::from_value)
            .unwrap_or_default();
        match ErrorKind::from_code(&payload.code) {
            Some(kind) => Self::with_message(kind, payload.message).with_details(details),
            None => Self::with_message(ErrorKind::HandlerError, payload.message)
                .with_details(details.with("code", payload.code)),
        }
    }
}

impl PartialEq for BusError {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.message == other.message && self.details == other.details
    }
}

impl From<ErrorKind> for BusError {
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind)
    }
}

/// Error body of a failed `RESPONSE`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_codes_round_trip_for_every_kind() {
        for kind in ErrorKind::ALL {
            assert_eq!(ErrorKind::from_code(kind.code()), Some(kind));
        }
        assert_eq!(ErrorKind::from_code("NOT_A_CODE"), None);
    }

    #[test]
    fn test_serde_uses_wire_codes() {
        let encoded = serde_json::to_value(ErrorKind::RateLimited).unwrap();
        assert_eq!(encoded, json!("RATE_LIMITED"));
    }

    #[test]
    fn test_default_message_and_retryable() {
        let err = BusError::new(ErrorKind::ResponseTimeout);
        assert_eq!(err.message(), "Response timed out");
        assert!(err.is_retryable());

        let err = BusError::new(ErrorKind::Unauthorized);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_display_includes_code() {
        let err = BusError::peer_not_found("tab-2");
        assert_eq!(err.to_string(), "[PEER_NOT_FOUND] Peer not found: tab-2");
        assert_eq!(err.details().get("peer_id"), Some(&json!("tab-2")));
    }

    #[test]
    fn test_payload_conversion_keeps_kind_and_details() {
        let err = BusError::with_message(ErrorKind::RateLimited, "slow down")
            .detail("limit", 2);
        let payload = err.to_payload();
        assert_eq!(payload.code, "RATE_LIMITED");
        assert_eq!(payload.details, Some(json!({ "limit": 2 })));

        let back = BusError::from_payload(payload);
        assert_eq!(back, err);
    }

    #[test]
    fn test_unknown_wire_code_becomes_handler_error() {
        let payload = ErrorPayload {
            code: "TEAPOT".into(),
            message: "short and stout".into(),
            details: None,
        };
        let err = BusError::from_payload(payload);
        assert_eq!(err.kind(), ErrorKind::HandlerError);
        assert_eq!(err.details().get("code"), Some(&json!("TEAPOT")));
    }

    #[test]
    fn test_cause_is_exposed_as_source() {
        use std::error::Error as _;

        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
        let err = BusError::peer_disconnected("worker").caused_by(io);
        let source = err.source().expect("cause");
        assert_eq!(source.to_string(), "pipe closed");
    }

    #[test]
    fn test_details_from_non_object() {
        let details = ErrorDetails::from_value(json!(7));
        assert_eq!(details.get("value"), Some(&json!(7)));
        assert!(ErrorDetails::from_value(Value::Null).is_empty());
    }
}
