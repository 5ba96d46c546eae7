//! Drives the handshake state machine over a link.

use crate::domain::handshake::validate_payload;
use crate::domain::{PeerStatus, SendFn};
use crate::service::api::duration_ms;
use crate::service::core::body;
use crate::service::types::InboundOutcome;
use crate::service::Bus;
use peerbus_types::{BusError, Envelope, ErrorKind, HandshakePayload, MessageType};
use tracing::{debug, info, warn};

impl Bus {
    /// Open a handshake with a registered peer.
    ///
    /// # Errors
    ///
    /// `DESTROYED` or `PEER_NOT_FOUND`.
    pub fn reconnect(&self, peer_id: &str) -> Result<(), BusError> {
        self.ensure_alive()?;
        let previous = self
            .inner
            .registry
            .set_status(peer_id, PeerStatus::Reconnecting)
            .ok_or_else(|| BusError::peer_not_found(peer_id))?;
        debug!(peer_id, from = %previous, "Reconnecting peer");
        self.initiate_handshake(peer_id);
        Ok(())
    }

    pub(crate) fn initiate_handshake(&self, peer_id: &str) {
        let nonce = self.inner.handshakes.initiate(peer_id);
        self.arm_handshake_deadline(peer_id, nonce);
        let init = self.handshake_envelope(MessageType::HandshakeInit);
        if let Err(error) = self.inner.registry.send_direct(peer_id, &init) {
            self.fail_handshake(peer_id, &error);
        }
    }

    pub(crate) fn on_handshake(
        &self,
        envelope: &Envelope,
        link: Option<&str>,
        reply: Option<&SendFn>,
    ) -> InboundOutcome {
        let Some(peer_id) = link else {
            warn!(message_type = %envelope.message_type(), "Handshake message without a peer id");
            return InboundOutcome::Rejected(BusError::invalid_message(
                "Handshake message without a peer id",
            ));
        };

        let payload = match envelope
            .payload_as::<HandshakePayload>()
            .and_then(|payload| validate_payload(&payload, peer_id).map(|()| payload))
        {
            Ok(payload) => payload,
            Err(error) => {
                self.fail_handshake(peer_id, &error);
                return InboundOutcome::Rejected(error);
            }
        };

        let step = match self
            .inner
            .handshakes
            .on_message(self.id(), peer_id, envelope.message_type())
        {
            Ok(step) => step,
            Err(error) => {
                self.fail_handshake(peer_id, &error);
                return InboundOutcome::Rejected(error);
            }
        };

        if let Some(nonce) = step.started {
            self.arm_handshake_deadline(peer_id, nonce);
            // The link renegotiates; hold outbound traffic until it is done.
            if self.inner.registry.status(peer_id) == Some(PeerStatus::Connected) {
                self.inner
                    .registry
                    .set_status(peer_id, PeerStatus::Reconnecting);
            }
        }
        if let Some(reply_type) = step.reply {
            self.send_back(Some(peer_id), reply, &self.handshake_envelope(reply_type));
        }
        if step.completed {
            self.complete_handshake(peer_id, &payload);
        }
        InboundOutcome::Handled
    }

    fn complete_handshake(&self, peer_id: &str, payload: &HandshakePayload) {
        let registry = &self.inner.registry;
        let Some(previous) = registry.set_status(peer_id, PeerStatus::Connected) else {
            debug!(peer_id, "Handshake completed for an unregistered link");
            return;
        };
        registry.update_details(peer_id, payload.peer_type.clone(), payload.metadata.clone());
        // Both ends restart the link's sequence numbering.
        registry.reset_sequence(peer_id);
        self.inner.orderer.lock().forget(peer_id);
        let drained = registry.drain_queue(peer_id);
        info!(
            peer_id,
            from = %previous,
            drained = drained.sent,
            still_queued = drained.remaining,
            "Handshake complete; peer connected"
        );
        let peer_type = registry
            .get(peer_id)
            .map(|p| p.peer_type)
            .unwrap_or_default();
        self.emit_connected(peer_id, &peer_type);
    }

    /// Mark the peer `FAILED`; no session state survives.
    pub(crate) fn fail_handshake(&self, peer_id: &str, error: &BusError) {
        self.inner.handshakes.remove(peer_id);
        if self
            .inner
            .registry
            .set_status(peer_id, PeerStatus::Failed)
            .is_none()
        {
            return;
        }
        let cancelled = self.inner.pending.cancel_for_peer(peer_id, error);
        warn!(peer_id, code = %error.kind(), error = %error, cancelled, "Handshake failed");
        self.emit_failed(peer_id, error);
    }

    fn arm_handshake_deadline(&self, peer_id: &str, nonce: u64) {
        let bus = self.downgrade();
        let shutdown = self.inner.shutdown.clone();
        let timeout = self.inner.config.handshake_timeout();
        let peer_id = peer_id.to_string();
        self.spawn_task(async move {
            tokio::select! {
                () = shutdown.cancelled() => {}
                () = tokio::time::sleep(timeout) => {
                    let Some(bus) = Bus::upgrade(&bus) else { return };
                    if bus.inner.handshakes.expire(&peer_id, nonce) {
                        let error = BusError::new(ErrorKind::HandshakeTimeout)
                            .detail("peer_id", peer_id.as_str())
                            .detail("timeout_ms", duration_ms(timeout));
                        bus.fail_handshake(&peer_id, &error);
                    }
                }
            }
        });
    }

    fn handshake_envelope(&self, message_type: MessageType) -> Envelope {
        Envelope::new(message_type, body(&HandshakePayload::new(self.id())))
            .with_source(self.id())
    }
}
