//! # Peerbus Test Suite
//!
//! Unified test crate for flows that need more than one bus.
//!
//! ## Structure
//!
//! ```text
//! tests/
//! ├── benches/
//! │   └── bus_benchmarks.rs  # Emitter, router, codec, causal buffer
//! └── src/integration/
//!     ├── direct.rs          # Two buses over one channel link
//!     ├── hub.rs             # Star topology through a hub bus
//!     └── lifecycle.rs       # Disconnect, reconnect, timeouts, teardown
//! ```
//!
//! ## Running Tests
//!
//! ```bash
//! # All tests
//! cargo test -p peerbus-tests
//!
//! # By category
//! cargo test -p peerbus-tests integration::hub::
//!
//! # Benchmarks
//! cargo bench -p peerbus-tests
//! ```

#![allow(dead_code)]

pub mod integration;
