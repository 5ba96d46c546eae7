//! # Adapters
//!
//! Concrete implementations for the ports plus configuration loading.
//!
//! - `channel`: in-memory [`Transport`](crate::ports::Transport) pairs over tokio mpsc
//! - `config`: TOML loading for [`BusConfig`](crate::config::BusConfig)

pub mod channel;
pub mod config;

pub use channel::ChannelTransport;
