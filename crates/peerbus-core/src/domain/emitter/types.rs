//! Emitter value types.

use peerbus_types::now_millis;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Identifier handed out for each registered listener.
pub type ListenerId = u64;

/// Validated-path listener. An `Err` is logged and does not stop fan-out.
pub type Listener = Arc<dyn Fn(&BusEvent) -> anyhow::Result<()> + Send + Sync>;

/// Hot-path listener receiving the raw data only.
pub type FastListener = Arc<dyn Fn(&Value) -> anyhow::Result<()> + Send + Sync>;

/// How a listener is invoked relative to the emitting call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchMode {
    /// Inline, before `emit` returns.
    #[default]
    Sync,
    /// Scheduled on the current tokio runtime; inline when there is none.
    Async,
}

/// Registration options for [`EventEmitter::on`](super::EventEmitter::on).
#[derive(Debug, Clone, Default)]
pub struct ListenerOptions {
    /// Unregister after the first invocation.
    pub once: bool,
    /// Higher runs first.
    pub priority: i32,
    pub mode: DispatchMode,
    /// External cancellation; a cancelled token deactivates the listener.
    pub signal: Option<CancellationToken>,
}

impl ListenerOptions {
    #[must_use]
    pub fn once() -> Self {
        Self {
            once: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_mode(mut self, mode: DispatchMode) -> Self {
        self.mode = mode;
        self
    }

    #[must_use]
    pub fn with_signal(mut self, token: CancellationToken) -> Self {
        self.signal = Some(token);
        self
    }
}

/// Where an event came from.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct EventSource {
    /// Remote peer id; `None` for events raised on this bus.
    pub peer_id: Option<String>,
    /// Origin the remote message arrived with.
    pub origin: Option<String>,
}

impl EventSource {
    /// Source for events raised locally.
    #[must_use]
    pub fn local() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn peer(peer_id: impl Into<String>, origin: Option<String>) -> Self {
        Self {
            peer_id: Some(peer_id.into()),
            origin,
        }
    }

    pub fn is_local(&self) -> bool {
        self.peer_id.is_none()
    }
}

/// Event handed to validated-path listeners.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BusEvent {
    pub name: String,
    pub data: Value,
    /// Message id; a fresh UUID for local emits.
    pub id: String,
    /// Unix milliseconds.
    pub timestamp: u64,
    pub source: EventSource,
}

impl BusEvent {
    #[must_use]
    pub fn new(name: impl Into<String>, data: Value, source: EventSource) -> Self {
        Self {
            name: name.into(),
            data,
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: now_millis(),
            source,
        }
    }

    /// Event raised on this bus.
    #[must_use]
    pub fn local(name: impl Into<String>, data: Value) -> Self {
        Self::new(name, data, EventSource::local())
    }

    /// Keep the id of the wire message that carried the event.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }
}

/// Outcome of [`EventEmitter::off`](super::EventEmitter::off).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffResult {
    pub removed: usize,
    pub remaining: usize,
}
