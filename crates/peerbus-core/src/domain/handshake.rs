//! # Handshake State Machine
//!
//! Three-leg negotiation run once per link:
//!
//! ```text
//! initiator                      responder
//!   init ──HANDSHAKE_INIT──────▶   init
//!   init_sent                      ack
//!        ◀─────HANDSHAKE_ACK────
//!   ack_sent ─HANDSHAKE_COMPLETE▶
//!   done                           done
//! ```
//!
//! When both sides open at once, the side with the lower bus id keeps the
//! initiator role and ignores the other INIT; the higher id answers it.
//!
//! Sessions are dropped on completion, on failure and on removal; a session
//! that outlives its deadline is failed by its nonce so a newer session for
//! the same peer is never failed by a stale timer.

use parking_lot::Mutex;
use peerbus_types::{BusError, ErrorKind, HandshakePayload, MessageType, PROTOCOL_VERSION};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

// =============================================================================
// STATES
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HandshakeState {
    Init,
    InitSent,
    Ack,
    AckSent,
    Done,
    Failed,
}

impl fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Init => "init",
            Self::InitSent => "init_sent",
            Self::Ack => "ack",
            Self::AckSent => "ack_sent",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HandshakeRole {
    Initiator,
    Responder,
}

#[derive(Debug, Clone)]
struct HandshakeSession {
    role: HandshakeRole,
    state: HandshakeState,
    nonce: u64,
}

/// What the caller must do after feeding a handshake message in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HandshakeStep {
    /// Message to send back to the peer.
    pub reply: Option<MessageType>,
    /// The handshake reached `done`; promote the peer.
    pub completed: bool,
    /// A new session started; arm its deadline with this nonce.
    pub started: Option<u64>,
}

impl HandshakeStep {
    fn ignored() -> Self {
        Self::default()
    }
}

/// Check the body of a handshake message.
///
/// # Errors
///
/// - `VERSION_MISMATCH` when the peer speaks another protocol version
/// - `HANDSHAKE_REJECTED` when the claimed id differs from `expected_peer`
pub fn validate_payload(payload: &HandshakePayload, expected_peer: &str) -> Result<(), BusError> {
    if payload.version != PROTOCOL_VERSION {
        return Err(BusError::new(ErrorKind::VersionMismatch)
            .detail("expected", PROTOCOL_VERSION)
            .detail("received", payload.version)
            .detail("peer_id", expected_peer));
    }
    if payload.peer_id != expected_peer {
        return Err(BusError::with_message(
            ErrorKind::HandshakeRejected,
            "Handshake peer id does not match the link",
        )
        .detail("expected", expected_peer)
        .detail("received", payload.peer_id.as_str()));
    }
    Ok(())
}

// =============================================================================
// SESSION TABLE
// =============================================================================

/// In-flight handshakes keyed by peer id.
#[derive(Default)]
pub struct Handshakes {
    sessions: Mutex<HashMap<String, HandshakeSession>>,
    next_nonce: AtomicU64,
}

impl Handshakes {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn nonce(&self) -> u64 {
        self.next_nonce.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Start as initiator. The caller sends `HANDSHAKE_INIT` and arms the
    /// deadline with the returned nonce. Replaces any session for the peer.
    pub fn initiate(&self, peer_id: &str) -> u64 {
        let nonce = self.nonce();
        self.sessions.lock().insert(
            peer_id.to_string(),
            HandshakeSession {
                role: HandshakeRole::Initiator,
                state: HandshakeState::InitSent,
                nonce,
            },
        );
        debug!(peer_id, nonce, "Handshake initiated");
        nonce
    }

    /// Feed a received handshake message through the machine.
    ///
    /// # Errors
    ///
    /// `HANDSHAKE_REJECTED` for a message that makes no sense in the current
    /// state; the session is discarded.
    pub fn on_message(
        &self,
        local_id: &str,
        peer_id: &str,
        message: MessageType,
    ) -> Result<HandshakeStep, BusError> {
        let mut sessions = self.sessions.lock();
        let current = sessions.get(peer_id).map(|s| s.state);

        let step = match (current, message) {
            (None, MessageType::HandshakeInit) => {
                let nonce = self.nonce();
                sessions.insert(peer_id.to_string(), responder(nonce));
                HandshakeStep {
                    reply: Some(MessageType::HandshakeAck),
                    completed: false,
                    started: Some(nonce),
                }
            }
            (Some(HandshakeState::InitSent), MessageType::HandshakeInit) => {
                if local_id < peer_id {
                    debug!(peer_id, "Simultaneous open; keeping initiator role");
                    HandshakeStep::ignored()
                } else {
                    // Keep the running deadline.
                    if let Some(session) = sessions.get_mut(peer_id) {
                        session.role = HandshakeRole::Responder;
                        session.state = HandshakeState::Ack;
                    }
                    HandshakeStep {
                        reply: Some(MessageType::HandshakeAck),
                        ..HandshakeStep::default()
                    }
                }
            }
            (Some(HandshakeState::Ack), MessageType::HandshakeInit) => HandshakeStep {
                reply: Some(MessageType::HandshakeAck),
                ..HandshakeStep::default()
            },
            (Some(HandshakeState::InitSent), MessageType::HandshakeAck) => {
                // init_sent -> ack_sent -> done; the session is discarded.
                sessions.remove(peer_id);
                HandshakeStep {
                    reply: Some(MessageType::HandshakeComplete),
                    completed: true,
                    started: None,
                }
            }
            (Some(HandshakeState::Ack), MessageType::HandshakeComplete) => {
                sessions.remove(peer_id);
                HandshakeStep {
                    completed: true,
                    ..HandshakeStep::default()
                }
            }
            (None, MessageType::HandshakeAck | MessageType::HandshakeComplete) => {
                debug!(peer_id, message = %message, "Ignoring handshake message without a session");
                HandshakeStep::ignored()
            }
            (Some(state), _) => {
                sessions.remove(peer_id);
                return Err(BusError::with_message(
                    ErrorKind::HandshakeRejected,
                    "Unexpected handshake message",
                )
                .detail("peer_id", peer_id)
                .detail("state", state.to_string())
                .detail("message", message.as_str()));
            }
            (None, other) => {
                return Err(BusError::invalid_message("not a handshake message")
                    .detail("type", other.as_str()));
            }
        };

        if let Some(state) = sessions.get(peer_id).map(|s| s.state) {
            debug!(peer_id, message = %message, state = %state, "Handshake advanced");
        }
        Ok(step)
    }

    /// Fail the session if it is still the one armed with `nonce`.
    pub fn expire(&self, peer_id: &str, nonce: u64) -> bool {
        let mut sessions = self.sessions.lock();
        match sessions.get(peer_id) {
            Some(session) if session.nonce == nonce => {
                sessions.remove(peer_id);
                true
            }
            _ => false,
        }
    }

    pub fn remove(&self, peer_id: &str) -> bool {
        self.sessions.lock().remove(peer_id).is_some()
    }

    pub fn clear(&self) {
        self.sessions.lock().clear();
    }

    pub fn state(&self, peer_id: &str) -> Option<HandshakeState> {
        self.sessions.lock().get(peer_id).map(|s| s.state)
    }

    pub fn role(&self, peer_id: &str) -> Option<HandshakeRole> {
        self.sessions.lock().get(peer_id).map(|s| s.role)
    }

    pub fn in_progress(&self) -> usize {
        self.sessions.lock().len()
    }
}

fn responder(nonce: u64) -> HandshakeSession {
    HandshakeSession {
        role: HandshakeRole::Responder,
        state: HandshakeState::Ack,
        nonce,
    }
}

impl fmt::Debug for Handshakes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handshakes")
            .field("in_progress", &self.in_progress())
            .finish()
    }
}
