//! Peer entity.

use super::queue::OfflineQueue;
use parking_lot::Mutex;
use peerbus_types::{BusError, Envelope};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Outbound function owned by a peer.
pub type SendFn = Arc<dyn Fn(&Envelope) -> Result<(), BusError> + Send + Sync>;

/// Connection state of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PeerStatus {
    Connecting,
    Connected,
    Disconnected,
    Reconnecting,
    Failed,
}

impl PeerStatus {
    /// Whether routed messages go straight to the send function.
    pub fn is_reachable(self) -> bool {
        self == Self::Connected
    }

    /// Whether routed messages are held in the offline queue.
    pub fn queues(self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::Disconnected | Self::Reconnecting
        )
    }
}

impl fmt::Display for PeerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
            Self::Disconnected => "DISCONNECTED",
            Self::Reconnecting => "RECONNECTING",
            Self::Failed => "FAILED",
        };
        f.write_str(label)
    }
}

/// Options for [`PeerRegistry::add_peer`](super::PeerRegistry::add_peer).
#[derive(Debug, Clone)]
pub struct PeerOptions {
    /// Transport category, e.g. `"channel"`, `"socket"`.
    pub peer_type: String,
    pub origin: Option<String>,
    pub metadata: Value,
    /// Peers added with a ready send function start connected; transports
    /// that still have to handshake start `Connecting`.
    pub status: PeerStatus,
}

impl Default for PeerOptions {
    fn default() -> Self {
        Self {
            peer_type: "direct".to_string(),
            origin: None,
            metadata: Value::Null,
            status: PeerStatus::Connected,
        }
    }
}

impl PeerOptions {
    #[must_use]
    pub fn connecting() -> Self {
        Self {
            status: PeerStatus::Connecting,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_type(mut self, peer_type: impl Into<String>) -> Self {
        self.peer_type = peer_type.into();
        self
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
}

/// A remote participant.
pub(crate) struct Peer {
    pub(crate) id: String,
    pub(crate) peer_type: String,
    pub(crate) origin: Option<String>,
    pub(crate) status: PeerStatus,
    pub(crate) connected_at: Option<u64>,
    pub(crate) last_seen: u64,
    pub(crate) metadata: Value,
    pub(crate) send: SendFn,
    pub(crate) queue: OfflineQueue,
    /// Last sequence number that actually went out on this link.
    pub(crate) sequence: Arc<Mutex<u64>>,
}

impl Peer {
    pub(crate) fn info(&self) -> PeerInfo {
        PeerInfo {
            id: self.id.clone(),
            peer_type: self.peer_type.clone(),
            origin: self.origin.clone(),
            status: self.status,
            connected_at: self.connected_at,
            last_seen: self.last_seen,
            metadata: self.metadata.clone(),
            queued: self.queue.len(),
        }
    }
}

/// Snapshot of a peer without its send function.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeerInfo {
    pub id: String,
    pub peer_type: String,
    pub origin: Option<String>,
    pub status: PeerStatus,
    /// Unix milliseconds of the last transition to `Connected`.
    pub connected_at: Option<u64>,
    /// Unix milliseconds of the last inbound message.
    pub last_seen: u64,
    pub metadata: Value,
    /// Envelopes waiting in the offline queue.
    pub queued: usize,
}
