//! # Bus Service
//!
//! The [`Bus`] facade composes the domain tables with pluggable transports.
//!
//! ## Outbound
//!
//! `signal` / `request` build an envelope, run the outbound hooks over the
//! user data, then hand the envelope to the router, which calls the target
//! peer's send function or parks the envelope in its offline queue.
//!
//! ## Inbound
//!
//! `handle_message` validates the envelope and its origin, relays it when
//! this bus is a hub and the envelope is addressed elsewhere, then dispatches
//! by type: handshake legs to the state machine, signals through the causal
//! orderer to the local emitter, requests through the security gate to the
//! handler, responses to the pending table.

// Semantic submodules
mod api;
mod core;
pub mod events;
mod handshake;
mod inbound;
mod maintenance;
mod transport;
mod types;

pub use core::{Bus, HandlerRegistration, HookRegistration};
pub use transport::TransportRegistration;
pub use types::{
    BroadcastOptions, BusStats, HandlerOptions, InboundOutcome, MaintenanceReport,
    RequestOptions, SignalOptions, TransportOptions,
};
