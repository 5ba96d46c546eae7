//! # Envelope
//!
//! The unit of wire exchange and its validation filter.
//!
//! ## Wire Shape
//!
//! ```text
//! {
//!   "_cb": "peerbus",      protocol marker
//!   "v":   1,              protocol version (integer, never a boolean)
//!   "id":  "…",            unique message id (non-empty)
//!   "t":   "REQUEST",      type tag ("type" accepted as the verbose key)
//!   "ts":  1700000000000,  creation time, Unix millis
//!   "p":   { … },          payload ("payload" accepted as the verbose key)
//!   "src": "tab-1",        optional originating peer
//!   "tgt": "worker",       optional target peer
//!   "seq": 4               optional per-link sequence
//! }
//! ```
//!
//! Version mismatch is a hard reject, never negotiated downward.

use crate::errors::{BusError, ErrorKind};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Value of the marker field.
pub const PROTOCOL_MARKER: &str = "peerbus";

/// Current protocol version.
pub const PROTOCOL_VERSION: u32 = 1;

/// Key of the marker field.
pub const MARKER_FIELD: &str = "_cb";

/// Key of the version field.
pub const VERSION_FIELD: &str = "v";

const TYPE_FIELD: &str = "t";
const TYPE_FIELD_VERBOSE: &str = "type";

/// Type tag of an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    /// Fire-and-forget named event.
    Signal,
    /// Call to a named handler.
    Request,
    /// Outcome of a request (same id as the request).
    Response,
    /// Receipt of a request (same id as the request).
    Ack,
    /// First handshake leg, initiator to responder.
    HandshakeInit,
    /// Second handshake leg, responder to initiator.
    HandshakeAck,
    /// Final handshake leg, initiator to responder.
    HandshakeComplete,
    /// Liveness check.
    Ping,
    /// Liveness reply.
    Pong,
    /// Orderly disconnect.
    Bye,
    /// Target-less signal relayed to every peer.
    Broadcast,
}

impl MessageType {
    /// All tags, in declaration order.
    pub const ALL: [MessageType; 11] = [
        Self::Signal,
        Self::Request,
        Self::Response,
        Self::Ack,
        Self::HandshakeInit,
        Self::HandshakeAck,
        Self::HandshakeComplete,
        Self::Ping,
        Self::Pong,
        Self::Bye,
        Self::Broadcast,
    ];

    /// Wire form of the tag.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Signal => "SIGNAL",
            Self::Request => "REQUEST",
            Self::Response => "RESPONSE",
            Self::Ack => "ACK",
            Self::HandshakeInit => "HANDSHAKE_INIT",
            Self::HandshakeAck => "HANDSHAKE_ACK",
            Self::HandshakeComplete => "HANDSHAKE_COMPLETE",
            Self::Ping => "PING",
            Self::Pong => "PONG",
            Self::Bye => "BYE",
            Self::Broadcast => "BROADCAST",
        }
    }

    /// Parse the wire form.
    #[must_use]
    pub fn parse(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == tag)
    }

    /// True for the three handshake legs.
    #[must_use]
    pub const fn is_handshake(self) -> bool {
        matches!(
            self,
            Self::HandshakeInit | Self::HandshakeAck | Self::HandshakeComplete
        )
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returns true iff `value` has the shape of a protocol envelope.
///
/// Checks, in order: structured object, marker, exact integer version,
/// non-empty string id, and exactly one string type tag under `t` or `type`.
/// Anything else is rejected silently.
#[must_use]
pub fn is_protocol_message(value: &Value) -> bool {
    let Some(obj) = value.as_object() else {
        return false;
    };

    if obj.get(MARKER_FIELD).and_then(Value::as_str) != Some(PROTOCOL_MARKER) {
        return false;
    }

    // as_u64 is None for booleans, floats and strings
    if obj.get(VERSION_FIELD).and_then(Value::as_u64) != Some(u64::from(PROTOCOL_VERSION)) {
        return false;
    }

    if !obj
        .get("id")
        .and_then(Value::as_str)
        .is_some_and(|id| !id.is_empty())
    {
        return false;
    }

    match (obj.get(TYPE_FIELD), obj.get(TYPE_FIELD_VERBOSE)) {
        (Some(tag), None) | (None, Some(tag)) => tag.is_string(),
        _ => false,
    }
}

/// Current Unix time in milliseconds.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// A validated protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "_cb")]
    marker: String,

    #[serde(rename = "v")]
    version: u32,

    id: String,

    #[serde(rename = "t", alias = "type")]
    message_type: MessageType,

    #[serde(default)]
    ts: u64,

    #[serde(rename = "p", alias = "payload", default)]
    payload: Value,

    #[serde(rename = "src", default, skip_serializing_if = "Option::is_none")]
    source: Option<String>,

    #[serde(rename = "tgt", default, skip_serializing_if = "Option::is_none")]
    target: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    seq: Option<u64>,
}

impl Envelope {
    /// Build an envelope with a fresh id.
    #[must_use]
    pub fn new(message_type: MessageType, payload: Value) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), message_type, payload)
    }

    /// Build an envelope reusing a known id (responses, ACKs).
    #[must_use]
    pub fn with_id(id: impl Into<String>, message_type: MessageType, payload: Value) -> Self {
        Self {
            marker: PROTOCOL_MARKER.to_string(),
            version: PROTOCOL_VERSION,
            id: id.into(),
            message_type,
            ts: now_millis(),
            payload,
            source: None,
            target: None,
            seq: None,
        }
    }

    /// Set the originating peer.
    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Set the target peer.
    #[must_use]
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    /// Copy of this envelope stamped with a per-link sequence number.
    #[must_use]
    pub fn stamped(&self, seq: u64) -> Self {
        Self {
            seq: Some(seq),
            ..self.clone()
        }
    }

    /// Copy of this envelope around a replacement payload.
    ///
    /// The id, type, timestamp and routing fields are preserved.
    #[must_use]
    pub fn with_payload(&self, payload: Value) -> Self {
        Self {
            payload,
            ..self.clone()
        }
    }

    /// Validate and decode arbitrary inbound data.
    ///
    /// # Errors
    ///
    /// - `VERSION_MISMATCH` when the marker matches but the version does not
    /// - `INVALID_MESSAGE` for every other malformed shape
    pub fn from_value(value: Value) -> Result<Self, BusError> {
        if !is_protocol_message(&value) {
            let marker_ok = value
                .get(MARKER_FIELD)
                .and_then(Value::as_str)
                .is_some_and(|m| m == PROTOCOL_MARKER);
            let version = value.get(VERSION_FIELD).cloned().unwrap_or(Value::Null);
            if marker_ok && version.as_u64() != Some(u64::from(PROTOCOL_VERSION)) {
                return Err(BusError::new(ErrorKind::VersionMismatch)
                    .detail("received", version)
                    .detail("supported", PROTOCOL_VERSION));
            }
            return Err(BusError::invalid_message("Not a protocol envelope"));
        }

        serde_json::from_value(value).map_err(|e| {
            BusError::invalid_message(format!("Malformed envelope: {e}")).caused_by(e)
        })
    }

    /// Encode for the wire.
    #[must_use]
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Decode the payload into a typed body.
    ///
    /// # Errors
    ///
    /// `INVALID_MESSAGE` when the payload does not match `T`.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, BusError> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            BusError::invalid_message(format!(
                "Malformed {} payload: {e}",
                self.message_type
            ))
            .caused_by(e)
        })
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    #[must_use]
    pub fn timestamp(&self) -> u64 {
        self.ts
    }

    #[must_use]
    pub fn payload(&self) -> &Value {
        &self.payload
    }

    #[must_use]
    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    #[must_use]
    pub fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }

    #[must_use]
    pub fn seq(&self) -> Option<u64> {
        self.seq
    }
}
