//! Option and result types for the [`Bus`](super::Bus) surface.

use crate::domain::{HandlerSecurity, PayloadValidator, PendingStats};
use peerbus_types::BusError;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

// =============================================================================
// OUTBOUND OPTIONS
// =============================================================================

/// Options for [`Bus::signal`](super::Bus::signal).
#[derive(Debug, Clone, Default)]
pub struct SignalOptions {
    /// Peers that must not receive the signal.
    pub exclude: Vec<String>,
    /// Send to one peer instead of broadcasting.
    pub target: Option<String>,
}

impl SignalOptions {
    #[must_use]
    pub fn excluding<I, S>(peers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            exclude: peers.into_iter().map(Into::into).collect(),
            target: None,
        }
    }

    #[must_use]
    pub fn to(peer_id: impl Into<String>) -> Self {
        Self {
            exclude: Vec::new(),
            target: Some(peer_id.into()),
        }
    }
}

/// Options for [`Bus::request`](super::Bus::request).
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Overrides `request_timeout_ms`.
    pub timeout: Option<Duration>,
    /// Resolve with this value on timeout instead of failing.
    pub default_value: Option<Value>,
    /// Fail with `ACK_TIMEOUT` when the receiver does not acknowledge in time.
    pub ack_timeout: Option<Duration>,
    /// Send through this directly connected peer (a hub) when the target is
    /// not directly connected.
    pub via: Option<String>,
    /// Abandon the wait when cancelled.
    pub cancel: Option<CancellationToken>,
}

impl RequestOptions {
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_default(mut self, value: Value) -> Self {
        self.default_value = Some(value);
        self
    }

    #[must_use]
    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn via(mut self, hub: impl Into<String>) -> Self {
        self.via = Some(hub.into());
        self
    }

    #[must_use]
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// Options for [`Bus::broadcast_request`](super::Bus::broadcast_request).
#[derive(Debug, Clone, Default)]
pub struct BroadcastOptions {
    pub timeout: Option<Duration>,
    pub exclude: Vec<String>,
    /// Leave failed peers out of the result map.
    pub ignore_errors: bool,
}

impl BroadcastOptions {
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn excluding<I, S>(mut self, peers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude = peers.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn ignore_errors(mut self) -> Self {
        self.ignore_errors = true;
        self
    }
}

// =============================================================================
// HANDLER OPTIONS
// =============================================================================

/// Security and execution limits for one handler.
#[derive(Clone, Default)]
pub struct HandlerOptions {
    pub allowed_peers: Option<Vec<String>>,
    /// Calls per second per caller.
    pub rate_limit: Option<u32>,
    pub validate_payload: Option<PayloadValidator>,
    /// Fail with `HANDLER_TIMEOUT` past this.
    pub timeout: Option<Duration>,
}

impl HandlerOptions {
    #[must_use]
    pub fn with_allowed_peers<I, S>(mut self, peers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_peers = Some(peers.into_iter().map(Into::into).collect());
        self
    }

    #[must_use]
    pub fn with_rate_limit(mut self, per_second: u32) -> Self {
        self.rate_limit = Some(per_second);
        self
    }

    #[must_use]
    pub fn with_validator<F>(mut self, validator: F) -> Self
    where
        F: Fn(&Value) -> anyhow::Result<bool> + Send + Sync + 'static,
    {
        self.validate_payload = Some(Arc::new(validator));
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub(crate) fn security(&self) -> HandlerSecurity {
        let mut security = HandlerSecurity::new();
        if let Some(peers) = &self.allowed_peers {
            security = security.with_allowed_peers(peers.iter().cloned());
        }
        if let Some(limit) = self.rate_limit {
            security = security.with_rate_limit(limit);
        }
        if let Some(validator) = &self.validate_payload {
            security = security.with_validator(Arc::clone(validator));
        }
        security
    }
}

impl fmt::Debug for HandlerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerOptions")
            .field("allowed_peers", &self.allowed_peers)
            .field("rate_limit", &self.rate_limit)
            .field(
                "validate_payload",
                &self.validate_payload.as_ref().map(|_| "<closure>"),
            )
            .field("timeout", &self.timeout)
            .finish()
    }
}

// =============================================================================
// TRANSPORT OPTIONS
// =============================================================================

/// How [`Bus::add_transport`](super::Bus::add_transport) registers the link.
#[derive(Debug, Clone)]
pub struct TransportOptions {
    /// Bus id of the remote side; its handshake must claim the same id.
    pub peer_id: String,
    pub origin: Option<String>,
    pub metadata: Value,
    /// Send `HANDSHAKE_INIT` immediately.
    pub initiate: bool,
}

impl TransportOptions {
    #[must_use]
    pub fn new(peer_id: impl Into<String>) -> Self {
        Self {
            peer_id: peer_id.into(),
            origin: None,
            metadata: Value::Null,
            initiate: true,
        }
    }

    #[must_use]
    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Wait for the remote side to open the handshake.
    #[must_use]
    pub fn passive(mut self) -> Self {
        self.initiate = false;
        self
    }
}

// =============================================================================
// RESULTS
// =============================================================================

/// What [`Bus::handle_message`](super::Bus::handle_message) did with its input.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundOutcome {
    /// Processed, answered or relayed.
    Handled,
    /// Held by the causal orderer until its predecessors arrive.
    Buffered,
    /// Not a protocol message, not addressed to this bus, or a duplicate.
    Ignored,
    /// Dropped; the error says why.
    Rejected(BusError),
}

impl InboundOutcome {
    pub fn is_handled(&self) -> bool {
        matches!(self, Self::Handled)
    }

    pub fn error(&self) -> Option<&BusError> {
        match self {
            Self::Rejected(error) => Some(error),
            _ => None,
        }
    }
}

/// Work done by one [`Bus::run_maintenance`](super::Bus::run_maintenance) pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub pinged: usize,
    pub pruned: usize,
    /// Queued envelopes delivered.
    pub drained: usize,
}

/// Diagnostic snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusStats {
    pub bus_id: String,
    pub peers: usize,
    pub connected_peers: usize,
    pub handlers: usize,
    pub handshakes_in_progress: usize,
    pub causal_buffered: usize,
    pub signals_sent: u64,
    pub requests_sent: u64,
    pub responses_received: u64,
    pub messages_dropped: u64,
    pub pending: PendingStats,
}
