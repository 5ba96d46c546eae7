//! # Ports
//!
//! Interfaces the bus needs from its host:
//!
//! - [`Transport`]: moves envelopes to and from one remote peer
//! - [`RequestHandler`]: answers `REQUEST`s for a named handler

mod handler;
mod transport;

pub use handler::{FnHandler, HandlerContext, RequestHandler};
pub use transport::{InboundHandler, MessageContext, Transport};
