//! Transport port.

use peerbus_types::{BusError, Envelope};
use serde_json::Value;
use std::sync::Arc;

/// Facts a transport knows about one inbound message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageContext {
    /// Trust domain the message arrived from; `None` when the transport has
    /// no notion of origin.
    pub origin: Option<String>,
}

impl MessageContext {
    #[must_use]
    pub fn with_origin(origin: impl Into<String>) -> Self {
        Self {
            origin: Some(origin.into()),
        }
    }
}

/// Callback a transport invokes once per inbound message. The value is raw:
/// the bus decides whether it is a protocol envelope.
pub type InboundHandler = Arc<dyn Fn(Value, MessageContext) + Send + Sync>;

/// A link to one remote peer.
///
/// # Example Implementation
///
/// ```rust,ignore
/// struct PostMessageTransport { port: MessagePort }
///
/// impl Transport for PostMessageTransport {
///     fn send(&self, envelope: &Envelope) -> Result<(), BusError> {
///         self.port.post(envelope.to_value())
///     }
///     fn on_message(&self, handler: InboundHandler) {
///         self.port.set_listener(move |value| handler(value, MessageContext::default()));
///     }
/// }
/// ```
pub trait Transport: Send + Sync {
    /// Hand an envelope to the link.
    ///
    /// # Errors
    ///
    /// Fails once the transport is closed or destroyed.
    fn send(&self, envelope: &Envelope) -> Result<(), BusError>;

    /// Install the inbound callback, replacing any previous one.
    fn on_message(&self, handler: InboundHandler);

    /// Release the link. Further sends fail.
    fn destroy(&self) {}

    /// Transport category reported as the peer type.
    fn kind(&self) -> &str {
        "custom"
    }
}
