//! Telemetry configuration from environment variables.

use std::env;

/// Configuration for log output.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name attached to every log line
    pub service_name: String,

    /// Log level filter (trace, debug, info, warn, error, or a full directive)
    pub log_level: String,

    /// Whether to write logs to stdout
    pub console_output: bool,

    /// Whether to format logs as JSON lines
    pub json_logs: bool,

    /// Whether to include thread ids
    pub with_thread_ids: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "peerbus".to_string(),
            log_level: "info".to_string(),
            console_output: true,
            json_logs: false,
            with_thread_ids: false,
        }
    }
}

impl TelemetryConfig {
    /// Create configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `PEERBUS_SERVICE_NAME`: Service name (default: peerbus)
    /// - `PEERBUS_LOG_LEVEL` or `RUST_LOG`: Log level (default: info)
    /// - `PEERBUS_JSON_LOGS`: Enable JSON logs (default: false)
    /// - `PEERBUS_CONSOLE_OUTPUT`: Enable console output (default: true)
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        Self {
            service_name: lookup("PEERBUS_SERVICE_NAME").unwrap_or(defaults.service_name),

            log_level: lookup("PEERBUS_LOG_LEVEL")
                .or_else(|| lookup("RUST_LOG"))
                .unwrap_or(defaults.log_level),

            console_output: lookup("PEERBUS_CONSOLE_OUTPUT")
                .map(|v| v.to_lowercase() != "false" && v != "0")
                .unwrap_or(defaults.console_output),

            json_logs: lookup("PEERBUS_JSON_LOGS")
                .map(|v| v.to_lowercase() == "true" || v == "1")
                .unwrap_or(defaults.json_logs),

            with_thread_ids: defaults.with_thread_ids,
        }
    }

    /// Quiet configuration for test binaries.
    pub fn for_testing() -> Self {
        Self {
            log_level: "warn".to_string(),
            ..Self::default()
        }
    }
}
