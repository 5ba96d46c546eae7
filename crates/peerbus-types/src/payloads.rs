//! # Payload Bodies
//!
//! Typed bodies carried in the `p` field of each envelope kind.
//!
//! - `SIGNAL` / `BROADCAST`: [`SignalPayload`]
//! - `REQUEST`: [`RequestPayload`]
//! - `RESPONSE`: [`ResponsePayload`]
//! - `HANDSHAKE_*`: [`HandshakePayload`]
//!
//! `ACK`, `PING`, `PONG` and `BYE` carry no body; the envelope id is enough.

use crate::errors::{BusError, ErrorPayload};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Body of a signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalPayload {
    /// Signal name, e.g. `"user:login"`.
    pub name: String,
    /// Arbitrary data.
    #[serde(default)]
    pub data: Value,
}

/// Body of a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestPayload {
    /// Name of the handler to invoke.
    pub handler: String,
    /// Handler arguments.
    #[serde(default)]
    pub args: Value,
}

/// Body of a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponsePayload {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
}

impl ResponsePayload {
    /// Successful response.
    #[must_use]
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    /// Failed response.
    #[must_use]
    pub fn err(error: &BusError) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.to_payload()),
        }
    }

    /// Build from a handler outcome.
    #[must_use]
    pub fn from_result(result: &Result<Value, BusError>) -> Self {
        match result {
            Ok(data) => Self::ok(data.clone()),
            Err(e) => Self::err(e),
        }
    }

    /// Convert back into a handler outcome.
    ///
    /// A failed response without an error body becomes `HANDLER_ERROR`.
    ///
    /// # Errors
    ///
    /// Returns the decoded remote error when `success` is false.
    pub fn into_result(self) -> Result<Value, BusError> {
        if self.success {
            return Ok(self.data.unwrap_or(Value::Null));
        }
        Err(match self.error {
            Some(error) => BusError::from_payload(error),
            None => BusError::new(crate::ErrorKind::HandlerError),
        })
    }
}

/// Body of the three handshake legs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakePayload {
    /// Bus id of the sender.
    pub peer_id: String,
    /// Protocol version the sender speaks.
    pub version: u32,
    /// Transport category of the sender, if it reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_type: Option<String>,
    /// Opaque metadata.
    #[serde(default)]
    pub metadata: Value,
}

impl HandshakePayload {
    #[must_use]
    pub fn new(peer_id: impl Into<String>) -> Self {
        Self {
            peer_id: peer_id.into(),
            version: crate::PROTOCOL_VERSION,
            peer_type: None,
            metadata: Value::Null,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use serde_json::json;

    #[test]
    fn test_response_ok_round_trip() {
        let payload = ResponsePayload::ok(json!(42));
        let encoded = serde_json::to_value(&payload).unwrap();
        assert_eq!(encoded, json!({ "success": true, "data": 42 }));
        assert_eq!(payload.into_result().unwrap(), json!(42));
    }

    #[test]
    fn test_response_err_round_trip() {
        let err = BusError::new(ErrorKind::Unauthorized).detail("peer_id", "intruder");
        let payload = ResponsePayload::err(&err);
        let encoded = serde_json::to_value(&payload).unwrap();
        assert_eq!(encoded["success"], false);
        assert_eq!(encoded["error"]["code"], "UNAUTHORIZED");

        let decoded: ResponsePayload = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded.into_result().unwrap_err(), err);
    }

    #[test]
    fn test_failed_response_without_body() {
        let payload = ResponsePayload {
            success: false,
            data: None,
            error: None,
        };
        assert_eq!(
            payload.into_result().unwrap_err().kind(),
            ErrorKind::HandlerError
        );
    }

    #[test]
    fn test_success_without_data_is_null() {
        let payload: ResponsePayload = serde_json::from_value(json!({ "success": true })).unwrap();
        assert_eq!(payload.into_result().unwrap(), Value::Null);
    }

    #[test]
    fn test_request_args_default() {
        let payload: RequestPayload = serde_json::from_value(json!({ "handler": "ping" })).unwrap();
        assert_eq!(payload.args, Value::Null);
    }

    #[test]
    fn test_handshake_defaults_to_current_version() {
        let payload = HandshakePayload::new("hub");
        assert_eq!(payload.version, crate::PROTOCOL_VERSION);
        let encoded = serde_json::to_value(&payload).unwrap();
        assert!(encoded.get("peer_type").is_none());
    }
}
