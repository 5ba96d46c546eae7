//! Inbound pipeline: validate, check origin, relay or dispatch by type.

use crate::domain::{
    BusEvent, EventSource, HookContext, HookDirection, PeerStatus, RouteOptions, SendFn,
    VectorClock,
};
use crate::ports::HandlerContext;
use crate::service::core::{body, BusCounters};
use crate::service::types::InboundOutcome;
use crate::service::Bus;
use peerbus_types::{
    BusError, Envelope, ErrorKind, MessageType, RequestPayload, ResponsePayload, SignalPayload,
    MARKER_FIELD, PROTOCOL_MARKER,
};
use serde_json::Value;
use tracing::{debug, info, warn};

impl Bus {
    /// Feed one raw inbound message through the bus.
    ///
    /// `origin` is the trust domain reported by the transport. `peer_id` is
    /// the link it arrived on; when absent the envelope's `src` is used.
    /// `reply`, when given, carries ACKs, responses and handshake legs back
    /// instead of the registered peer's send function.
    ///
    /// Validation and security failures never surface as `Err`: they are
    /// reported as [`InboundOutcome::Rejected`] and, for requests, answered
    /// with an error `RESPONSE`.
    ///
    /// # Errors
    ///
    /// `DESTROYED` only.
    pub async fn handle_message(
        &self,
        raw: Value,
        origin: Option<&str>,
        peer_id: Option<&str>,
        reply: Option<SendFn>,
    ) -> Result<InboundOutcome, BusError> {
        self.ensure_alive()?;

        let claims_protocol =
            raw.get(MARKER_FIELD).and_then(Value::as_str) == Some(PROTOCOL_MARKER);
        if !claims_protocol {
            debug!("Ignoring non-protocol message");
            return Ok(InboundOutcome::Ignored);
        }
        let envelope = match Envelope::from_value(raw) {
            Ok(envelope) => envelope,
            Err(error) => {
                warn!(peer_id, error = %error, "Dropping invalid envelope");
                BusCounters::bump(&self.inner.counters.messages_dropped);
                return Ok(InboundOutcome::Rejected(error));
            }
        };
        let link = peer_id.or(envelope.source()).map(str::to_string);
        let link = link.as_deref();

        if !self.inner.origins.is_allowed(origin) {
            warn!(
                origin = origin.unwrap_or("null"),
                peer_id = link,
                message_type = %envelope.message_type(),
                "Dropping message from forbidden origin"
            );
            BusCounters::bump(&self.inner.counters.messages_dropped);
            let error = BusError::new(ErrorKind::OriginForbidden)
                .detail("origin", origin.unwrap_or("null"));
            if envelope.message_type() == MessageType::Request {
                self.reply_failure(&envelope, link, reply.as_ref(), &error);
            }
            return Ok(InboundOutcome::Rejected(error));
        }

        if let Some(link) = link {
            self.inner.registry.touch(link);
        }

        if let Some(target) = envelope.target() {
            if target != self.id() {
                return Ok(self.forward(&envelope, target, link, reply.as_ref()));
            }
        }

        let outcome = match envelope.message_type() {
            MessageType::HandshakeInit
            | MessageType::HandshakeAck
            | MessageType::HandshakeComplete => self.on_handshake(&envelope, link, reply.as_ref()),
            MessageType::Signal | MessageType::Broadcast => {
                self.on_signal(envelope, link, origin).await
            }
            MessageType::Request => {
                self.on_request(&envelope, link, origin, reply.as_ref())
                    .await?
            }
            MessageType::Response => self.on_response(&envelope).await,
            MessageType::Ack => {
                if self.inner.pending.acknowledge(envelope.id()) {
                    InboundOutcome::Handled
                } else {
                    InboundOutcome::Ignored
                }
            }
            MessageType::Ping => {
                let pong = Envelope::with_id(envelope.id(), MessageType::Pong, Value::Null)
                    .with_source(self.id());
                self.send_back(link, reply.as_ref(), &pong);
                InboundOutcome::Handled
            }
            MessageType::Pong => InboundOutcome::Handled,
            MessageType::Bye => match link {
                Some(peer) => {
                    self.mark_disconnected(peer, "bye");
                    InboundOutcome::Handled
                }
                None => InboundOutcome::Ignored,
            },
        };
        Ok(outcome)
    }

    // =========================================================================
    // RELAY
    // =========================================================================

    fn forward(
        &self,
        envelope: &Envelope,
        target: &str,
        link: Option<&str>,
        reply: Option<&SendFn>,
    ) -> InboundOutcome {
        if !self.is_hub() {
            debug!(target, message_id = envelope.id(), "Ignoring message addressed elsewhere");
            BusCounters::bump(&self.inner.counters.messages_dropped);
            return InboundOutcome::Ignored;
        }
        if !self.inner.registry.contains(target) {
            let error = BusError::peer_not_found(target);
            warn!(target, from = link, "Cannot relay to unknown peer");
            BusCounters::bump(&self.inner.counters.messages_dropped);
            if envelope.message_type() == MessageType::Request {
                self.reply_failure(envelope, link, reply, &error);
            }
            return InboundOutcome::Rejected(error);
        }

        let options = RouteOptions {
            exclude: Vec::new(),
            stamp: self.restamps(envelope.message_type()),
        };
        let routed = self.inner.registry.route(envelope, &options);
        debug!(
            target,
            from = link,
            message_type = %envelope.message_type(),
            delivered = routed.delivered,
            queued = routed.queued.len(),
            "Relayed message"
        );
        match routed.errors.get(target) {
            Some(error) if routed.failed.iter().any(|id| id == target) => {
                InboundOutcome::Rejected(error.clone())
            }
            _ => InboundOutcome::Handled,
        }
    }

    /// Relayed signals get the next sequence of the outgoing link.
    fn restamps(&self, message_type: MessageType) -> bool {
        self.inner.config.causal_ordering
            && matches!(message_type, MessageType::Signal | MessageType::Broadcast)
    }

    // =========================================================================
    // SIGNALS
    // =========================================================================

    async fn on_signal(
        &self,
        envelope: Envelope,
        link: Option<&str>,
        origin: Option<&str>,
    ) -> InboundOutcome {
        let ready = match (self.inner.config.causal_ordering, envelope.seq(), link) {
            (true, Some(seq), Some(sender)) => {
                let delivery = self.inner.orderer.lock().receive(
                    sender,
                    VectorClock::single(sender, seq),
                    envelope,
                );
                if let Some(overflow) = &delivery.overflow {
                    self.emit_overflow(overflow);
                }
                delivery.delivered
            }
            _ => vec![envelope],
        };
        if ready.is_empty() {
            return InboundOutcome::Buffered;
        }

        for envelope in &ready {
            self.deliver_signal(envelope, link, origin).await;
            if self.is_hub() && envelope.target().is_none() {
                let exclude = link
                    .into_iter()
                    .chain(envelope.source())
                    .map(str::to_string)
                    .collect();
                let options = RouteOptions {
                    exclude,
                    stamp: self.restamps(envelope.message_type()),
                };
                let routed = self.inner.registry.route(envelope, &options);
                debug!(
                    message_id = envelope.id(),
                    delivered = routed.delivered,
                    failed = routed.failed.len(),
                    "Relayed signal to peers"
                );
            }
        }
        InboundOutcome::Handled
    }

    async fn deliver_signal(&self, envelope: &Envelope, link: Option<&str>, origin: Option<&str>) {
        let Ok(signal) = self.decode_signal(envelope) else {
            return;
        };
        let sender = envelope.source().or(link);
        let context = HookContext {
            message_type: envelope.message_type(),
            peer_id: sender.map(str::to_string),
            handler: Some(signal.name.clone()),
            direction: HookDirection::Inbound,
        };
        let data = self.inner.inbound_hooks.run(signal.data, &context).await;
        self.emit_remote(&signal.name, data, envelope.id(), sender, origin);
    }

    /// Deliver without hooks; used when flushing a removed peer's backlog.
    pub(crate) fn emit_signal_unhooked(
        &self,
        envelope: &Envelope,
        link: Option<&str>,
        origin: Option<&str>,
    ) {
        if let Ok(signal) = self.decode_signal(envelope) {
            let sender = envelope.source().or(link);
            self.emit_remote(&signal.name, signal.data, envelope.id(), sender, origin);
        }
    }

    fn decode_signal(&self, envelope: &Envelope) -> Result<SignalPayload, BusError> {
        envelope.payload_as::<SignalPayload>().map_err(|error| {
            warn!(message_id = envelope.id(), error = %error, "Dropping malformed signal");
            BusCounters::bump(&self.inner.counters.messages_dropped);
            error
        })
    }

    fn emit_remote(
        &self,
        name: &str,
        data: Value,
        message_id: &str,
        sender: Option<&str>,
        origin: Option<&str>,
    ) {
        let source = EventSource {
            peer_id: sender.map(str::to_string),
            origin: origin.map(str::to_string),
        };
        let event = BusEvent::new(name, data, source).with_id(message_id);
        let invoked = self.inner.emitter.emit_event(event);
        debug!(signal = name, from = sender, listeners = invoked, "Signal delivered");
    }

    // =========================================================================
    // REQUESTS
    // =========================================================================

    async fn on_request(
        &self,
        envelope: &Envelope,
        link: Option<&str>,
        origin: Option<&str>,
        reply: Option<&SendFn>,
    ) -> Result<InboundOutcome, BusError> {
        let caller = envelope.source().or(link).unwrap_or_default().to_string();

        let ack = self.addressed(
            Envelope::with_id(envelope.id(), MessageType::Ack, Value::Null),
            &caller,
        );
        self.send_back(link, reply, &ack);

        let outcome = match envelope.payload_as::<RequestPayload>() {
            Ok(request) => {
                let context = HookContext {
                    message_type: MessageType::Request,
                    peer_id: Some(caller.clone()),
                    handler: Some(request.handler.clone()),
                    direction: HookDirection::Inbound,
                };
                let args = self.inner.inbound_hooks.run(request.args, &context).await;
                let handler_context = HandlerContext {
                    peer_id: caller.clone(),
                    origin: origin.map(str::to_string),
                    request_id: envelope.id().to_string(),
                    handler: request.handler.clone(),
                };
                match self.invoke_handler(&request.handler, args, handler_context).await {
                    Ok(data) => {
                        let context = HookContext {
                            message_type: MessageType::Response,
                            direction: HookDirection::Outbound,
                            ..context
                        };
                        Ok(self.inner.outbound_hooks.run(data, &context).await)
                    }
                    Err(error) => Err(error),
                }
            }
            Err(error) => Err(error),
        };
        self.ensure_alive()?;

        if let Err(error) = &outcome {
            debug!(
                request_id = envelope.id(),
                caller = %caller,
                error = %error,
                "Request failed"
            );
        }
        let response = self.addressed(
            Envelope::with_id(
                envelope.id(),
                MessageType::Response,
                body(&ResponsePayload::from_result(&outcome)),
            ),
            &caller,
        );
        self.send_back(link, reply, &response);
        Ok(InboundOutcome::Handled)
    }

    async fn on_response(&self, envelope: &Envelope) -> InboundOutcome {
        BusCounters::bump(&self.inner.counters.responses_received);
        let id = envelope.id();
        let Some(peer_id) = self.inner.pending.peer_of(id) else {
            debug!(request_id = id, "Ignoring response for unknown or settled request");
            return InboundOutcome::Ignored;
        };

        let response = match envelope.payload_as::<ResponsePayload>() {
            Ok(response) => response,
            Err(error) => {
                self.inner.pending.reject(id, error.clone());
                return InboundOutcome::Rejected(error);
            }
        };
        match response.into_result() {
            Ok(data) => {
                let context = HookContext {
                    message_type: MessageType::Response,
                    peer_id: Some(peer_id),
                    handler: None,
                    direction: HookDirection::Inbound,
                };
                let data = self.inner.inbound_hooks.run(data, &context).await;
                self.inner.pending.resolve(id, data);
            }
            Err(error) => {
                self.inner.pending.reject(id, error);
            }
        }
        InboundOutcome::Handled
    }

    fn reply_failure(
        &self,
        request: &Envelope,
        link: Option<&str>,
        reply: Option<&SendFn>,
        error: &BusError,
    ) {
        let caller = request.source().or(link).unwrap_or_default();
        let response = self.addressed(
            Envelope::with_id(
                request.id(),
                MessageType::Response,
                body(&ResponsePayload::err(error)),
            ),
            caller,
        );
        self.send_back(link, reply, &response);
    }

    // =========================================================================
    // RETURN PATH
    // =========================================================================

    /// Stamp our id as source and `caller` as target.
    fn addressed(&self, envelope: Envelope, caller: &str) -> Envelope {
        let envelope = envelope.with_source(self.id());
        if caller.is_empty() {
            envelope
        } else {
            envelope.with_target(caller)
        }
    }

    /// Send over `reply` if given, else through the link's registered peer.
    pub(crate) fn send_back(&self, link: Option<&str>, reply: Option<&SendFn>, envelope: &Envelope) {
        let sent = match (reply, link) {
            (Some(reply), _) => reply(envelope),
            (None, Some(peer)) => self.inner.registry.send_direct(peer, envelope),
            (None, None) => {
                debug!(message_type = %envelope.message_type(), "No return path for reply");
                return;
            }
        };
        if let Err(error) = sent {
            warn!(
                peer_id = link,
                message_type = %envelope.message_type(),
                error = %error,
                "Reply could not be sent"
            );
        }
    }

    /// Mark a peer `DISCONNECTED` and fail its pending requests.
    pub(crate) fn mark_disconnected(&self, peer_id: &str, reason: &str) {
        let Some(previous) = self.inner.registry.set_status(peer_id, PeerStatus::Disconnected) else {
            return;
        };
        if previous == PeerStatus::Disconnected {
            return;
        }
        self.inner.handshakes.remove(peer_id);
        let cancelled = self
            .inner
            .pending
            .cancel_for_peer(peer_id, &BusError::peer_disconnected(peer_id));
        info!(peer_id, reason, cancelled, "Peer disconnected");
        self.emit_disconnected(peer_id, reason);
    }
}
