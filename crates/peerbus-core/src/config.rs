//! Bus configuration.

use crate::domain::OriginValidator;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {error}")]
    Io { path: String, error: String },

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Settings for one bus instance. Every field has a default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// This instance's peer id.
    pub bus_id: String,

    /// Relay messages between peers.
    pub hub: bool,

    /// Default `request()` timeout.
    pub request_timeout_ms: u64,

    /// Deadline for a handshake to reach `done`.
    pub handshake_timeout_ms: u64,

    /// Ceiling on outstanding requests (`MAX_PENDING`).
    pub max_pending_requests: usize,

    /// Ceiling on registered peers (`MAX_PEERS`).
    pub max_peers: usize,

    /// Per-peer offline queue capacity.
    pub offline_queue_size: usize,

    /// Send attempts per queued envelope.
    pub offline_queue_retries: u32,

    /// Pass stamped signals through the causal orderer.
    pub causal_ordering: bool,

    /// Causal buffer ceiling.
    pub causal_buffer_size: usize,

    /// PING interval for [`Bus::start_maintenance`](crate::Bus::start_maintenance).
    pub heartbeat_interval_ms: Option<u64>,

    /// Remove peers not heard from for this long.
    pub peer_stale_after_ms: Option<u64>,

    /// Origin allow-list (exact or wildcard).
    pub allowed_origins: Vec<String>,

    /// Skip origin checks entirely.
    pub allow_all_origins: bool,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            bus_id: uuid::Uuid::new_v4().to_string(),
            hub: false,
            request_timeout_ms: 30_000,
            handshake_timeout_ms: 5_000,
            max_pending_requests: 1_000,
            max_peers: 256,
            offline_queue_size: 100,
            offline_queue_retries: 3,
            causal_ordering: true,
            causal_buffer_size: 1_000,
            heartbeat_interval_ms: None,
            peer_stale_after_ms: None,
            allowed_origins: Vec::new(),
            allow_all_origins: true,
        }
    }
}

impl BusConfig {
    /// Defaults with the given id.
    #[must_use]
    pub fn with_id(bus_id: impl Into<String>) -> Self {
        Self {
            bus_id: bus_id.into(),
            ..Self::default()
        }
    }

    /// Short timeouts for tests.
    #[must_use]
    pub fn for_testing(bus_id: impl Into<String>) -> Self {
        Self {
            bus_id: bus_id.into(),
            request_timeout_ms: 1_000,
            handshake_timeout_ms: 500,
            max_pending_requests: 64,
            max_peers: 16,
            offline_queue_size: 16,
            causal_buffer_size: 64,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn hub(mut self) -> Self {
        self.hub = true;
        self
    }

    /// Restrict inbound origins; turns off `allow_all_origins`.
    #[must_use]
    pub fn with_allowed_origins<I, S>(mut self, origins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_origins = origins.into_iter().map(Into::into).collect();
        self.allow_all_origins = false;
        self
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Option<Duration> {
        self.heartbeat_interval_ms.map(Duration::from_millis)
    }

    /// Build the origin validator this config describes.
    ///
    /// # Errors
    ///
    /// `ConfigError::Invalid` for an unsupported wildcard entry.
    pub fn origin_validator(&self) -> Result<OriginValidator, ConfigError> {
        if self.allow_all_origins {
            return Ok(OriginValidator::allow_all());
        }
        OriginValidator::new(&self.allowed_origins).map_err(|e| ConfigError::Invalid {
            field: "allowed_origins",
            reason: e.to_string(),
        })
    }

    /// Reject values the bus cannot run with.
    ///
    /// # Errors
    ///
    /// `ConfigError::Invalid` naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(field: &'static str, reason: &str) -> Result<(), ConfigError> {
            Err(ConfigError::Invalid {
                field,
                reason: reason.to_string(),
            })
        }

        if self.bus_id.trim().is_empty() {
            return invalid("bus_id", "must not be empty");
        }
        if self.request_timeout_ms == 0 {
            return invalid("request_timeout_ms", "must be positive");
        }
        if self.handshake_timeout_ms == 0 {
            return invalid("handshake_timeout_ms", "must be positive");
        }
        if self.max_pending_requests == 0 {
            return invalid("max_pending_requests", "must be positive");
        }
        if self.max_peers == 0 {
            return invalid("max_peers", "must be positive");
        }
        if self.offline_queue_retries == 0 {
            return invalid("offline_queue_retries", "must be positive");
        }
        if self.causal_buffer_size == 0 {
            return invalid("causal_buffer_size", "must be positive");
        }
        if self.heartbeat_interval_ms == Some(0) {
            return invalid("heartbeat_interval_ms", "must be positive when set");
        }
        if self.peer_stale_after_ms == Some(0) {
            return invalid("peer_stale_after_ms", "must be positive when set");
        }
        self.origin_validator().map(|_| ())
    }
}
