//! # Peer Registry / Message Router
//!
//! Authoritative peer table plus unicast/broadcast dispatch.
//!
//! ## Routing
//!
//! | Peer status | Outcome |
//! |-------------|---------|
//! | `Connected` | send function invoked; errors reported per peer |
//! | `Connecting`, `Disconnected`, `Reconnecting` | offline queue |
//! | `Failed` | reported as failed |
//!
//! Send functions are called after the table lock is released, so a send
//! function may call back into the registry.
//!
//! ## Sequence numbers
//!
//! A stamped copy takes its link's next number only when its send succeeds,
//! so the receiver never waits on a number that was not sent. Queued copies
//! are stamped when drained; eviction and dropped retries leave no gap. A
//! stamped send holds the link's sequence lock, so its send function must
//! not route a stamped message back to the same peer.

mod peer;
mod queue;

pub use peer::{PeerInfo, PeerOptions, PeerStatus, SendFn};

use parking_lot::Mutex;
use peer::Peer;
use peerbus_types::{now_millis, BusError, Envelope, ErrorKind};
use queue::{OfflineQueue, PushOutcome};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Routing options.
#[derive(Debug, Clone, Default)]
pub struct RouteOptions {
    /// Peers to skip.
    pub exclude: Vec<String>,
    /// Stamp each copy with the target's next sequence number.
    pub stamp: bool,
}

impl RouteOptions {
    #[must_use]
    pub fn excluding<I, S>(exclude: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            exclude: exclude.into_iter().map(Into::into).collect(),
            stamp: false,
        }
    }

    #[must_use]
    pub fn stamped(mut self) -> Self {
        self.stamp = true;
        self
    }

    fn excludes(&self, peer_id: &str) -> bool {
        self.exclude.iter().any(|id| id == peer_id)
    }
}

/// Outcome of a route.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RouteResult {
    /// Send functions that returned `Ok`.
    pub delivered: usize,
    /// Peers the message could not reach.
    pub failed: Vec<String>,
    /// Peers that got the message in their offline queue.
    pub queued: Vec<String>,
    /// Why each failed peer failed; also `QUEUE_FULL` for queued peers whose
    /// oldest entry was evicted.
    pub errors: BTreeMap<String, BusError>,
}

impl RouteResult {
    fn fail(&mut self, peer_id: String, error: BusError) {
        self.errors.insert(peer_id.clone(), error);
        self.failed.push(peer_id);
    }
}

/// Outcome of draining an offline queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub sent: usize,
    /// Entries discarded after exhausting their attempts.
    pub dropped: usize,
    /// Entries still queued.
    pub remaining: usize,
}

/// Peer table. All methods take `&self`.
pub struct PeerRegistry {
    peers: Mutex<HashMap<String, Peer>>,
    max_peers: usize,
    queue_capacity: usize,
    queue_attempts: u32,
}

impl PeerRegistry {
    #[must_use]
    pub fn new(max_peers: usize, queue_capacity: usize, queue_attempts: u32) -> Self {
        Self {
            peers: Mutex::new(HashMap::new()),
            max_peers,
            queue_capacity,
            queue_attempts,
        }
    }

    /// Register a peer.
    ///
    /// # Errors
    ///
    /// - `PEER_EXISTS` if `id` is already registered
    /// - `MAX_PEERS` when the table is full
    pub fn add_peer(
        &self,
        id: &str,
        send: SendFn,
        options: PeerOptions,
    ) -> Result<PeerInfo, BusError> {
        let mut peers = self.peers.lock();
        if peers.contains_key(id) {
            return Err(BusError::peer_exists(id));
        }
        if peers.len() >= self.max_peers {
            return Err(BusError::new(ErrorKind::MaxPeers)
                .detail("peer_id", id)
                .detail("max_peers", self.max_peers));
        }

        let now = now_millis();
        let peer = Peer {
            id: id.to_string(),
            peer_type: options.peer_type,
            origin: options.origin,
            status: options.status,
            connected_at: (options.status == PeerStatus::Connected).then_some(now),
            last_seen: now,
            metadata: options.metadata,
            send,
            queue: OfflineQueue::new(self.queue_capacity, self.queue_attempts),
            sequence: Arc::new(Mutex::new(0)),
        };
        let info = peer.info();
        peers.insert(id.to_string(), peer);

        debug!(peer_id = id, status = %info.status, "Peer added");
        Ok(info)
    }

    /// Remove a peer, discarding its offline queue.
    pub fn remove_peer(&self, id: &str) -> Option<PeerInfo> {
        let mut peer = self.peers.lock().remove(id)?;
        let dropped = peer.queue.clear();
        info!(peer_id = id, dropped_queued = dropped, "Peer removed");
        Some(peer.info())
    }

    /// Remove every peer, returning their ids.
    pub fn clear(&self) -> Vec<String> {
        let mut peers = self.peers.lock();
        let mut ids: Vec<String> = peers.keys().cloned().collect();
        peers.clear();
        ids.sort();
        ids
    }

    pub fn get(&self, id: &str) -> Option<PeerInfo> {
        self.peers.lock().get(id).map(Peer::info)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.peers.lock().contains_key(id)
    }

    pub fn status(&self, id: &str) -> Option<PeerStatus> {
        self.peers.lock().get(id).map(|p| p.status)
    }

    /// Sorted peer ids.
    pub fn peer_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.peers.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn peers(&self) -> Vec<PeerInfo> {
        let mut peers: Vec<PeerInfo> = self.peers.lock().values().map(Peer::info).collect();
        peers.sort_by(|a, b| a.id.cmp(&b.id));
        peers
    }

    pub fn len(&self) -> usize {
        self.peers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.lock().is_empty()
    }

    /// Set a peer's status, returning the previous one.
    pub fn set_status(&self, id: &str, status: PeerStatus) -> Option<PeerStatus> {
        let mut peers = self.peers.lock();
        let peer = peers.get_mut(id)?;
        let previous = std::mem::replace(&mut peer.status, status);
        if status == PeerStatus::Connected && previous != PeerStatus::Connected {
            peer.connected_at = Some(now_millis());
        }
        if previous != status {
            debug!(peer_id = id, from = %previous, to = %status, "Peer status changed");
        }
        Some(previous)
    }

    /// Record handshake-reported details.
    pub fn update_details(&self, id: &str, peer_type: Option<String>, metadata: Value) {
        if let Some(peer) = self.peers.lock().get_mut(id) {
            if let Some(peer_type) = peer_type {
                peer.peer_type = peer_type;
            }
            if !metadata.is_null() {
                peer.metadata = metadata;
            }
        }
    }

    /// Refresh last-seen.
    pub fn touch(&self, id: &str) {
        if let Some(peer) = self.peers.lock().get_mut(id) {
            peer.last_seen = now_millis();
        }
    }

    /// Next value of the peer's outgoing sequence counter.
    pub fn get_sequence(&self, id: &str) -> Option<u64> {
        let sequence = self.peers.lock().get(id).map(|p| Arc::clone(&p.sequence))?;
        let mut last = sequence.lock();
        *last += 1;
        Some(*last)
    }

    /// Restart the peer's outgoing sequence; the next stamped copy carries 1.
    pub fn reset_sequence(&self, id: &str) {
        let sequence = self.peers.lock().get(id).map(|p| Arc::clone(&p.sequence));
        if let Some(sequence) = sequence {
            *sequence.lock() = 0;
        }
    }

    /// Peers whose last-seen is more than `max_age_ms` before `now`.
    pub fn stale_peers(&self, now: u64, max_age_ms: u64) -> Vec<String> {
        let mut stale: Vec<String> = self
            .peers
            .lock()
            .values()
            .filter(|p| now.saturating_sub(p.last_seen) > max_age_ms)
            .map(|p| p.id.clone())
            .collect();
        stale.sort();
        stale
    }

    /// Connected peers with something in their offline queue.
    pub fn peers_with_backlog(&self) -> Vec<String> {
        self.peers
            .lock()
            .values()
            .filter(|p| p.status.is_reachable() && p.queue.len() > 0)
            .map(|p| p.id.clone())
            .collect()
    }

    /// Send straight through a peer's send function, whatever its status.
    ///
    /// # Errors
    ///
    /// `PEER_NOT_FOUND` for an unknown peer, or the send function's error.
    pub fn send_direct(&self, id: &str, envelope: &Envelope) -> Result<(), BusError> {
        let send = self
            .peers
            .lock()
            .get(id)
            .map(|p| Arc::clone(&p.send))
            .ok_or_else(|| BusError::peer_not_found(id))?;
        send(envelope)
    }

    /// Dispatch to `envelope.target()` if set, else to every peer.
    pub fn route(&self, envelope: &Envelope, options: &RouteOptions) -> RouteResult {
        let mut result = RouteResult::default();
        let mut sends: Vec<Outgoing> = Vec::new();

        {
            let mut peers = self.peers.lock();
            let ids: Vec<String> = match envelope.target() {
                Some(target) => vec![target.to_string()],
                None => {
                    let mut ids: Vec<String> = peers.keys().cloned().collect();
                    ids.sort();
                    ids
                }
            };

            for id in ids {
                if options.excludes(&id) {
                    continue;
                }
                let Some(peer) = peers.get_mut(&id) else {
                    let error = BusError::peer_not_found(&id);
                    result.fail(id, error);
                    continue;
                };

                if peer.status.is_reachable() {
                    sends.push(Outgoing {
                        sequence: options.stamp.then(|| Arc::clone(&peer.sequence)),
                        send: Arc::clone(&peer.send),
                        peer_id: id,
                    });
                } else if peer.status.queues() {
                    match peer.queue.push(envelope.clone(), options.stamp) {
                        PushOutcome::Queued => result.queued.push(id),
                        PushOutcome::Evicted(oldest) => {
                            warn!(
                                peer_id = %id,
                                evicted = oldest.id(),
                                "Offline queue full; dropped oldest entry"
                            );
                            result.errors.insert(
                                id.clone(),
                                BusError::new(ErrorKind::QueueFull).detail("peer_id", id.as_str()),
                            );
                            result.queued.push(id);
                        }
                        PushOutcome::Rejected => {
                            let error = BusError::new(ErrorKind::QueueFull).detail("peer_id", id.as_str());
                            result.fail(id, error);
                        }
                    }
                } else {
                    let error = BusError::peer_disconnected(&id);
                    result.fail(id, error);
                }
            }
        }

        for outgoing in sends {
            match send_on_link(&outgoing.send, envelope, outgoing.sequence.as_deref()) {
                Ok(()) => result.delivered += 1,
                Err(e) => {
                    warn!(
                        peer_id = %outgoing.peer_id,
                        message_id = envelope.id(),
                        error = %e,
                        "Send failed"
                    );
                    result.fail(outgoing.peer_id, e);
                }
            }
        }

        result
    }

    /// Flush a connected peer's offline queue in FIFO order.
    ///
    /// Stops at the first send failure; the failing entry is retried on the
    /// next drain until it has used its attempts.
    pub fn drain_queue(&self, id: &str) -> DrainReport {
        let (send, sequence, entries, max_attempts) = {
            let mut peers = self.peers.lock();
            let Some(peer) = peers.get_mut(id) else {
                return DrainReport::default();
            };
            if !peer.status.is_reachable() {
                return DrainReport {
                    remaining: peer.queue.len(),
                    ..DrainReport::default()
                };
            }
            (
                Arc::clone(&peer.send),
                Arc::clone(&peer.sequence),
                peer.queue.take_all(),
                peer.queue.max_attempts(),
            )
        };

        let mut report = DrainReport::default();
        let mut pending = entries.into_iter();
        while let Some(mut entry) = pending.next() {
            let stamp = entry.stamp.then_some(&*sequence);
            if let Err(e) = send_on_link(&send, &entry.envelope, stamp) {
                entry.attempts += 1;
                let mut rest = Vec::new();
                if entry.attempts >= max_attempts {
                    warn!(
                        peer_id = id,
                        message_id = entry.envelope.id(),
                        attempts = entry.attempts,
                        error = %e,
                        "Dropping queued message after final attempt"
                    );
                    report.dropped += 1;
                } else {
                    debug!(peer_id = id, attempts = entry.attempts, error = %e, "Queued send failed");
                    rest.push(entry);
                }
                rest.extend(pending.by_ref());

                if let Some(peer) = self.peers.lock().get_mut(id) {
                    peer.queue.restore_front(rest);
                    report.remaining = peer.queue.len();
                }
                return report;
            }
            report.sent += 1;
        }

        report.remaining = self.peers.lock().get(id).map_or(0, |p| p.queue.len());
        if report.sent > 0 {
            debug!(peer_id = id, sent = report.sent, "Offline queue drained");
        }
        report
    }
}

/// A reachable peer picked by [`PeerRegistry::route`].
struct Outgoing {
    peer_id: String,
    send: SendFn,
    /// Present when the copy must be stamped.
    sequence: Option<Arc<Mutex<u64>>>,
}

/// Send one envelope, stamping it with the link's next sequence number when
/// `sequence` is given. The number is consumed only if the send succeeds.
fn send_on_link(
    send: &SendFn,
    envelope: &Envelope,
    sequence: Option<&Mutex<u64>>,
) -> Result<(), BusError> {
    let Some(sequence) = sequence else {
        return send(envelope);
    };
    let mut last = sequence.lock();
    send(&envelope.stamped(*last + 1))?;
    *last += 1;
    Ok(())
}

impl std::fmt::Debug for PeerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerRegistry")
            .field("peers", &self.len())
            .field("max_peers", &self.max_peers)
            .finish()
    }
}
