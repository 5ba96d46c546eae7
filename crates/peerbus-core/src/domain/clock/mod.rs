//! # Vector Clock & Causal Orderer
//!
//! Per-peer logical clocks and a bounded buffer that releases messages from a
//! sender only once every earlier message from that sender has been released.
//!
//! On the bus, each link stamps outgoing signals with a per-peer sequence
//! (`seq`); the receiver builds the single-component clock
//! `{ sender: seq }` and hands it to the orderer.

mod orderer;
mod vector;

pub use orderer::{CausalDelivery, CausalOrderer, CausalOverflow, OverflowHandler};
pub use vector::{CausalOrder, VectorClock};
