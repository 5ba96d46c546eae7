//! # Peerbus Telemetry
//!
//! Structured logging for peerbus hosts and tests.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use peerbus_telemetry::{init_telemetry, TelemetryConfig};
//!
//! fn main() {
//!     let _guard = init_telemetry(TelemetryConfig::from_env()).expect("telemetry");
//!     // bus code logs through `tracing` from here on
//! }
//! ```
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `PEERBUS_SERVICE_NAME` | `peerbus` | Service name attached to logs |
//! | `PEERBUS_LOG_LEVEL` | `info` | Log level filter (falls back to `RUST_LOG`) |
//! | `PEERBUS_JSON_LOGS` | `false` | Emit JSON lines instead of pretty output |
//! | `PEERBUS_CONSOLE_OUTPUT` | `true` | Write logs to stdout at all |

mod config;
mod tracing_setup;

pub use config::TelemetryConfig;
pub use tracing_setup::{init_for_tests, init_telemetry, TelemetryGuard};

use thiserror::Error;

/// Telemetry initialization errors
#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Invalid log filter: {0}")]
    Filter(String),

    #[error("A global subscriber is already installed: {0}")]
    AlreadyInitialized(String),
}

/// Span carrying the bus id and any extra fields.
///
/// # Example
///
/// ```rust,ignore
/// use peerbus_telemetry::bus_span;
///
/// let span = bus_span!("handle_message", bus.id(), peer_id = %peer);
/// let _enter = span.enter();
/// ```
#[macro_export]
macro_rules! bus_span {
    ($name:expr, $bus_id:expr) => {
        tracing::info_span!($name, bus_id = %$bus_id)
    };
    ($name:expr, $bus_id:expr, $($field:tt)*) => {
        tracing::info_span!($name, bus_id = %$bus_id, $($field)*)
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_service_name() {
        let config = TelemetryConfig::default();
        assert_eq!(config.service_name, "peerbus");
    }

    #[test]
    fn test_bus_span_macro_builds_span() {
        let span = bus_span!("unit", "bus-1", peer_id = "tab");
        // No subscriber installed: the span is disabled but constructible.
        let _enter = span.enter();
    }
}
