//! Attaching transports: registration, inbound pump, handshake kick-off.

use crate::domain::{PeerOptions, SendFn};
use crate::ports::{MessageContext, Transport};
use crate::service::core::{AttachedTransport, BusInner};
use crate::service::types::{InboundOutcome, TransportOptions};
use crate::service::Bus;
use peerbus_types::{BusError, Envelope, MessageType};
use serde_json::Value;
use std::fmt;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type Inbound = (Value, MessageContext);

/// Returned by [`Bus::add_transport`].
pub struct TransportRegistration {
    bus: Weak<BusInner>,
    peer_id: String,
    transport: Arc<dyn Transport>,
}

impl TransportRegistration {
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// Remove the peer and destroy the transport.
    pub fn cleanup(&self) {
        match Bus::upgrade(&self.bus) {
            Some(bus) if bus.remove_peer(&self.peer_id).unwrap_or(false) => {}
            _ => self.transport.destroy(),
        }
    }
}

impl fmt::Debug for TransportRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportRegistration")
            .field("peer_id", &self.peer_id)
            .field("kind", &self.transport.kind())
            .finish()
    }
}

impl Bus {
    /// Attach a transport to one remote bus.
    ///
    /// The peer is registered as `CONNECTING`, its inbound messages are
    /// pumped through [`Bus::handle_message`] in arrival order and, unless
    /// `options.initiate` is off, a handshake is opened. Messages routed to
    /// the peer before the handshake completes wait in its offline queue.
    ///
    /// Must be called within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// `DESTROYED`, `PEER_EXISTS` or `MAX_PEERS`.
    pub fn add_transport(
        &self,
        transport: Arc<dyn Transport>,
        options: TransportOptions,
    ) -> Result<TransportRegistration, BusError> {
        self.ensure_alive()?;
        let peer_id = options.peer_id.clone();

        let link = Arc::clone(&transport);
        let send: SendFn = Arc::new(move |envelope: &Envelope| link.send(envelope));
        let mut peer_options = PeerOptions::connecting()
            .with_type(transport.kind())
            .with_metadata(options.metadata.clone());
        if let Some(origin) = &options.origin {
            peer_options = peer_options.with_origin(origin.as_str());
        }
        self.inner.registry.add_peer(&peer_id, send, peer_options)?;

        let stop = self.inner.shutdown.child_token();
        let (tx, rx) = mpsc::unbounded_channel::<Inbound>();
        transport.on_message(Arc::new(move |value, context| {
            // The pump is gone once the peer is removed.
            let _ = tx.send((value, context));
        }));
        self.spawn_pump(peer_id.clone(), rx, stop.clone());

        self.inner.transports.lock().insert(
            peer_id.clone(),
            AttachedTransport {
                transport: Arc::clone(&transport),
                stop,
            },
        );
        info!(peer_id = %peer_id, kind = transport.kind(), "Transport attached");

        if options.initiate {
            self.initiate_handshake(&peer_id);
        }

        Ok(TransportRegistration {
            bus: self.downgrade(),
            peer_id,
            transport,
        })
    }

    fn spawn_pump(
        &self,
        peer_id: String,
        mut rx: mpsc::UnboundedReceiver<Inbound>,
        stop: CancellationToken,
    ) {
        let weak = self.downgrade();
        self.spawn_task(async move {
            loop {
                let next = tokio::select! {
                    () = stop.cancelled() => None,
                    next = rx.recv() => next,
                };
                let Some((value, context)) = next else { break };
                let Some(bus) = Bus::upgrade(&weak) else { break };

                if is_request(&value) {
                    // A handler may itself issue requests over this link.
                    let peer_id = peer_id.clone();
                    tokio::spawn(async move {
                        bus.pump_one(value, context, &peer_id).await;
                    });
                } else {
                    bus.pump_one(value, context, &peer_id).await;
                }
            }
            debug!(peer_id = %peer_id, "Inbound pump stopped");
        });
    }

    async fn pump_one(&self, value: Value, context: MessageContext, peer_id: &str) {
        match self
            .handle_message(value, context.origin.as_deref(), Some(peer_id), None)
            .await
        {
            Ok(InboundOutcome::Rejected(error)) => {
                debug!(peer_id, error = %error, "Inbound message rejected");
            }
            Ok(_) => {}
            Err(error) => debug!(peer_id, error = %error, "Inbound message after destroy"),
        }
    }

    /// Say BYE and mark the peer `DISCONNECTED`. Its pending requests fail;
    /// later messages for it are queued until it reconnects.
    ///
    /// # Errors
    ///
    /// `DESTROYED` or `PEER_NOT_FOUND`.
    pub fn disconnect(&self, peer_id: &str) -> Result<(), BusError> {
        self.ensure_alive()?;
        if !self.inner.registry.contains(peer_id) {
            return Err(BusError::peer_not_found(peer_id));
        }
        let bye = Envelope::new(MessageType::Bye, Value::Null).with_source(self.id());
        if let Err(error) = self.inner.registry.send_direct(peer_id, &bye) {
            warn!(peer_id, error = %error, "BYE could not be sent");
        }
        self.mark_disconnected(peer_id, "local");
        Ok(())
    }
}

/// Peek at the type tag without a full decode.
fn is_request(value: &Value) -> bool {
    value
        .get("t")
        .or_else(|| value.get("type"))
        .and_then(Value::as_str)
        == Some(MessageType::Request.as_str())
}
