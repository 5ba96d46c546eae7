//! # Peerbus Core
//!
//! A peer-to-peer message bus: every participant runs a [`Bus`] and exchanges
//! JSON envelopes with its peers over pluggable transports.
//!
//! ## Messaging Patterns
//!
//! - **Signals**: fire-and-forget named events, fanned out to every peer or
//!   addressed to one. Receivers deliver them in causal order.
//! - **Requests**: RPC to a named handler on a peer, correlated by envelope id,
//!   with optional ack deadline, response deadline and default value.
//! - **Local events**: an in-process emitter with exact, namespace (`ns:*`)
//!   and global (`*`) listeners. Remote signals land here.
//!
//! ## Architecture
//!
//! The crate follows Hexagonal Architecture with:
//! - **Domain Layer:** protocol state with no I/O (registry, clocks, pending
//!   table, handshake machine, hooks, security gate)
//! - **Ports Layer:** [`Transport`] and [`RequestHandler`]
//! - **Service Layer:** the [`Bus`] facade
//! - **Adapters Layer:** in-memory [`ChannelTransport`] and TOML config loading
//!
//! ## Example
//!
//! ```rust,no_run
//! use peerbus_core::{
//!     Bus, BusConfig, ChannelTransport, HandlerOptions, RequestOptions, TransportOptions,
//! };
//! use serde_json::{json, Value};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let alpha = Bus::new(BusConfig::with_id("alpha"))?;
//!     let beta = Bus::new(BusConfig::with_id("beta"))?;
//!
//!     beta.handle_fn(
//!         "double",
//!         |args: Value, _ctx| async move {
//!             Ok::<_, anyhow::Error>(json!(args.as_i64().unwrap_or_default() * 2))
//!         },
//!         HandlerOptions::default(),
//!     )?;
//!
//!     let (to_beta, to_alpha) = ChannelTransport::pair(None, None);
//!     alpha.add_transport(to_beta, TransportOptions::new("beta"))?;
//!     beta.add_transport(to_alpha, TransportOptions::new("alpha"))?;
//!
//!     let answer = alpha
//!         .request("beta", "double", json!(21), RequestOptions::default())
//!         .await?;
//!     assert_eq!(answer, json!(42));
//!     Ok(())
//! }
//! ```

// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

// =============================================================================
// MODULES
// =============================================================================

pub mod adapters;
pub mod config;
pub mod domain;
pub mod ports;
pub mod service;

// =============================================================================
// RE-EXPORTS
// =============================================================================

pub use adapters::ChannelTransport;
pub use config::{BusConfig, ConfigError};
pub use domain::{
    BusEvent, EventSource, ListenerOptions, OffResult, PeerInfo, PeerOptions, PeerStatus,
    RouteResult, SendFn, Subscription,
};
pub use ports::{FnHandler, HandlerContext, InboundHandler, MessageContext, RequestHandler, Transport};
pub use service::events;
pub use service::{
    BroadcastOptions, Bus, BusStats, HandlerOptions, HandlerRegistration, HookRegistration,
    InboundOutcome, MaintenanceReport, RequestOptions, SignalOptions, TransportOptions,
    TransportRegistration,
};

pub use peerbus_types::{
    BusError, Envelope, ErrorKind, HandshakePayload, MessageType, RequestPayload, ResponsePayload,
    SignalPayload,
};
