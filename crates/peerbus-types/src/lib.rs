//! # Peerbus Types Crate
//!
//! Wire-level definitions shared by every peerbus component.
//!
//! ## Design Principles
//!
//! - **Single Source of Truth**: the envelope schema and the type-tag
//!   vocabulary are defined once, here.
//! - **Pure Filter**: [`is_protocol_message`] never fails loudly; routing code
//!   uses it on arbitrary inbound data.
//! - **Immutable Shell**: an [`Envelope`] is never mutated after construction.
//!   Transforms build a new envelope around a replacement payload.
//! - **Closed Error Taxonomy**: every failure carries an [`ErrorKind`], a
//!   message, structured details and a retryable flag.

// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod envelope;
pub mod errors;
pub mod payloads;

pub use envelope::{
    is_protocol_message, now_millis, Envelope, MessageType, MARKER_FIELD, PROTOCOL_MARKER,
    PROTOCOL_VERSION, VERSION_FIELD,
};
pub use errors::{BusError, ErrorDetails, ErrorKind, ErrorPayload};
pub use payloads::{HandshakePayload, RequestPayload, ResponsePayload, SignalPayload};
