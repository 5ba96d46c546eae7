//! Public operations: signals, requests, handlers, peers and hooks.

use crate::domain::{
    FnHook, Hook, HookContext, HookDirection, PeerInfo, PeerOptions, PeerStatus, PendingOptions,
    RouteOptions, RouteResult, SendFn,
};
use crate::ports::{FnHandler, HandlerContext, RequestHandler};
use crate::service::core::{body, BusCounters, HandlerEntry, HandlerRegistration, HookRegistration};
use crate::service::types::{BroadcastOptions, HandlerOptions, RequestOptions, SignalOptions};
use crate::service::Bus;
use futures::FutureExt;
use peerbus_types::{
    BusError, Envelope, ErrorKind, MessageType, RequestPayload, SignalPayload,
};
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

impl Bus {
    // =========================================================================
    // SIGNALS
    // =========================================================================

    /// Send a fire-and-forget signal to every peer, or to `options.target`.
    ///
    /// Outbound hooks transform `data` first. With causal ordering enabled
    /// each copy carries the target link's next sequence number.
    ///
    /// # Errors
    ///
    /// `DESTROYED` only; per-peer failures are reported in the result.
    pub async fn signal(
        &self,
        name: &str,
        data: Value,
        options: SignalOptions,
    ) -> Result<RouteResult, BusError> {
        self.ensure_alive()?;
        let context = HookContext {
            message_type: MessageType::Signal,
            peer_id: options.target.clone(),
            handler: Some(name.to_string()),
            direction: HookDirection::Outbound,
        };
        let data = self.inner.outbound_hooks.run(data, &context).await;
        self.ensure_alive()?;

        let payload = SignalPayload {
            name: name.to_string(),
            data,
        };
        let mut envelope = Envelope::new(MessageType::Signal, body(&payload)).with_source(self.id());
        if let Some(target) = &options.target {
            envelope = envelope.with_target(target.as_str());
        }

        let route = RouteOptions {
            exclude: options.exclude,
            stamp: self.inner.config.causal_ordering,
        };
        let result = self.inner.registry.route(&envelope, &route);
        BusCounters::bump(&self.inner.counters.signals_sent);
        debug!(
            signal = name,
            delivered = result.delivered,
            failed = result.failed.len(),
            queued = result.queued.len(),
            "Signal routed"
        );
        Ok(result)
    }

    // =========================================================================
    // REQUESTS
    // =========================================================================

    /// Call `handler` on `peer_id` and wait for its response.
    ///
    /// A request to this bus's own id is dispatched locally without touching
    /// any transport.
    ///
    /// # Errors
    ///
    /// - `PEER_NOT_FOUND` for an unknown peer (or unknown `via` hub)
    /// - `MAX_PENDING` when too many requests are outstanding
    /// - `RESPONSE_TIMEOUT` / `ACK_TIMEOUT` unless a default value is set
    /// - `PEER_DISCONNECTED` when the peer is removed, fails or says BYE
    /// - any error the remote handler or its security gate reported
    pub async fn request(
        &self,
        peer_id: &str,
        handler: &str,
        args: Value,
        options: RequestOptions,
    ) -> Result<Value, BusError> {
        self.ensure_alive()?;
        if peer_id == self.id() {
            return self.request_local(handler, args, options).await;
        }

        let link = options.via.clone().unwrap_or_else(|| peer_id.to_string());
        if !self.inner.registry.contains(&link) {
            return Err(BusError::peer_not_found(&link));
        }

        let context = HookContext {
            message_type: MessageType::Request,
            peer_id: Some(peer_id.to_string()),
            handler: Some(handler.to_string()),
            direction: HookDirection::Outbound,
        };
        let args = self.inner.outbound_hooks.run(args, &context).await;
        self.ensure_alive()?;

        let pending = self.inner.pending.create(
            &link,
            handler,
            PendingOptions {
                timeout: options.timeout,
                default_value: options.default_value,
                ack_timeout: options.ack_timeout,
            },
        )?;
        let payload = RequestPayload {
            handler: handler.to_string(),
            args,
        };
        let envelope = Envelope::with_id(pending.id(), MessageType::Request, body(&payload))
            .with_source(self.id())
            .with_target(peer_id);

        if options.via.is_some() {
            self.inner.registry.send_direct(&link, &envelope)?;
        } else {
            let routed = self.inner.registry.route(&envelope, &RouteOptions::default());
            if routed.failed.iter().any(|id| id == &link) {
                return Err(routed
                    .errors
                    .get(&link)
                    .cloned()
                    .unwrap_or_else(|| BusError::peer_disconnected(&link)));
            }
        }
        BusCounters::bump(&self.inner.counters.requests_sent);
        debug!(
            request_id = pending.id(),
            peer_id,
            handler,
            via = options.via.as_deref(),
            "Request sent"
        );

        match options.cancel {
            Some(token) => {
                let request_id = pending.id().to_string();
                tokio::select! {
                    outcome = pending.wait() => outcome,
                    () = token.cancelled() => Err(BusError::with_message(
                        ErrorKind::PeerDisconnected,
                        "Request cancelled",
                    )
                    .detail("request_id", request_id)
                    .detail("cancelled", true)),
                }
            }
            None => pending.wait().await,
        }
    }

    async fn request_local(
        &self,
        handler: &str,
        args: Value,
        options: RequestOptions,
    ) -> Result<Value, BusError> {
        let timeout = options
            .timeout
            .unwrap_or_else(|| self.inner.pending.default_timeout());
        let context = HandlerContext {
            peer_id: self.id().to_string(),
            origin: None,
            request_id: uuid::Uuid::new_v4().to_string(),
            handler: handler.to_string(),
        };
        match tokio::time::timeout(timeout, self.invoke_handler(handler, args, context)).await {
            Ok(outcome) => outcome,
            Err(_) => options.default_value.ok_or_else(|| {
                BusError::new(ErrorKind::ResponseTimeout)
                    .detail("handler", handler)
                    .detail("timeout_ms", duration_ms(timeout))
            }),
        }
    }

    /// Call `handler` on every connected peer concurrently.
    ///
    /// # Errors
    ///
    /// `DESTROYED` only; per-peer outcomes are in the map.
    pub async fn broadcast_request(
        &self,
        handler: &str,
        args: Value,
        options: BroadcastOptions,
    ) -> Result<BTreeMap<String, Result<Value, BusError>>, BusError> {
        self.ensure_alive()?;
        let targets: Vec<String> = self
            .inner
            .registry
            .peers()
            .into_iter()
            .filter(|p| p.status == PeerStatus::Connected && !options.exclude.contains(&p.id))
            .map(|p| p.id)
            .collect();

        let calls = targets.iter().map(|peer_id| {
            let per_peer = RequestOptions {
                timeout: options.timeout,
                ..RequestOptions::default()
            };
            self.request(peer_id, handler, args.clone(), per_peer)
        });
        let outcomes = futures::future::join_all(calls).await;

        let mut results = BTreeMap::new();
        for (peer_id, outcome) in targets.into_iter().zip(outcomes) {
            if outcome.is_err() && options.ignore_errors {
                continue;
            }
            results.insert(peer_id, outcome);
        }
        Ok(results)
    }

    // =========================================================================
    // HANDLERS
    // =========================================================================

    /// Register a handler, replacing any handler with the same name.
    ///
    /// # Errors
    ///
    /// `DESTROYED`.
    pub fn handle<H>(
        &self,
        name: &str,
        handler: H,
        options: HandlerOptions,
    ) -> Result<HandlerRegistration, BusError>
    where
        H: RequestHandler + 'static,
    {
        self.ensure_alive()?;
        let id = self.next_handler_id();
        let entry = HandlerEntry {
            id,
            handler: Arc::new(handler),
            security: options.security(),
            timeout: options.timeout,
        };
        if self
            .inner
            .handlers
            .insert(name.to_string(), Arc::new(entry))
            .is_some()
        {
            debug!(handler = name, "Replaced existing handler");
        }
        Ok(HandlerRegistration {
            bus: self.downgrade(),
            name: name.to_string(),
            id,
        })
    }

    /// [`Bus::handle`] for an async closure.
    ///
    /// # Errors
    ///
    /// `DESTROYED`.
    pub fn handle_fn<F, Fut>(
        &self,
        name: &str,
        handler: F,
        options: HandlerOptions,
    ) -> Result<HandlerRegistration, BusError>
    where
        F: Fn(Value, HandlerContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.handle(name, FnHandler::new(handler), options)
    }

    /// Security gate, then the handler itself.
    pub(crate) async fn invoke_handler(
        &self,
        name: &str,
        args: Value,
        context: HandlerContext,
    ) -> Result<Value, BusError> {
        let entry = self
            .inner
            .handlers
            .get(name)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| BusError::no_handler(name))?;
        entry.security.check(name, &context.peer_id, &args)?;

        let call = AssertUnwindSafe(entry.handler.call(args, context)).catch_unwind();
        let outcome = match entry.timeout {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    return Err(BusError::new(ErrorKind::HandlerTimeout)
                        .detail("handler", name)
                        .detail("timeout_ms", duration_ms(limit)))
                }
            },
            None => call.await,
        };

        match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(handler_error(name, e)),
            Err(_) => {
                error!(handler = name, "Handler panicked");
                Err(BusError::with_message(ErrorKind::HandlerError, "Handler panicked")
                    .detail("handler", name))
            }
        }
    }

    // =========================================================================
    // PEERS
    // =========================================================================

    /// Register a peer reached through `send`. Peers added this way start
    /// `CONNECTED` unless `options.status` says otherwise.
    ///
    /// # Errors
    ///
    /// `DESTROYED`, `PEER_EXISTS` or `MAX_PEERS`.
    pub fn add_peer(
        &self,
        peer_id: &str,
        send: SendFn,
        options: PeerOptions,
    ) -> Result<PeerInfo, BusError> {
        self.ensure_alive()?;
        let info = self.inner.registry.add_peer(peer_id, send, options)?;
        if info.status == PeerStatus::Connected {
            self.emit_connected(peer_id, &info.peer_type);
        }
        Ok(info)
    }

    /// Remove a peer: its pending requests fail with `PEER_DISCONNECTED`,
    /// its offline queue is discarded and its transport destroyed. Returns
    /// whether the peer was registered.
    ///
    /// # Errors
    ///
    /// `DESTROYED`.
    pub fn remove_peer(&self, peer_id: &str) -> Result<bool, BusError> {
        self.ensure_alive()?;
        Ok(self.remove_peer_because(peer_id, "removed"))
    }

    pub(crate) fn remove_peer_because(&self, peer_id: &str, reason: &str) -> bool {
        let Some(info) = self.inner.registry.remove_peer(peer_id) else {
            return false;
        };
        let cancelled = self
            .inner
            .pending
            .cancel_for_peer(peer_id, &BusError::peer_disconnected(peer_id));
        self.inner.handshakes.remove(peer_id);

        if let Some(attached) = self.inner.transports.lock().remove(peer_id) {
            attached.stop.cancel();
            attached.transport.destroy();
        }

        // Deliver what is left from this sender rather than stranding it.
        let flushed = {
            let mut orderer = self.inner.orderer.lock();
            let flushed = orderer.flush(peer_id);
            orderer.forget(peer_id);
            flushed
        };
        for envelope in &flushed {
            self.emit_signal_unhooked(envelope, Some(peer_id), info.origin.as_deref());
        }

        info!(
            peer_id,
            reason,
            cancelled,
            dropped_queue = info.queued,
            flushed = flushed.len(),
            "Peer removed"
        );
        self.emit_disconnected(peer_id, reason);
        true
    }

    pub fn peers(&self) -> Vec<PeerInfo> {
        self.inner.registry.peers()
    }

    pub fn peer(&self, peer_id: &str) -> Option<PeerInfo> {
        self.inner.registry.get(peer_id)
    }

    // =========================================================================
    // HOOKS
    // =========================================================================

    /// Transform payloads arriving from peers. Lower priority runs first.
    ///
    /// # Errors
    ///
    /// `DESTROYED`.
    pub fn add_inbound_hook<H>(
        &self,
        hook: H,
        priority: i32,
    ) -> Result<HookRegistration, BusError>
    where
        H: Hook + 'static,
    {
        self.ensure_alive()?;
        let id = self.inner.inbound_hooks.add(Arc::new(hook), priority);
        Ok(HookRegistration {
            bus: self.downgrade(),
            direction: HookDirection::Inbound,
            id,
        })
    }

    /// Transform payloads leaving this bus. Lower priority runs first.
    pub fn add_outbound_hook<H>(
        &self,
        hook: H,
        priority: i32,
    ) -> Result<HookRegistration, BusError>
    where
        H: Hook + 'static,
    {
        self.ensure_alive()?;
        let id = self.inner.outbound_hooks.add(Arc::new(hook), priority);
        Ok(HookRegistration {
            bus: self.downgrade(),
            direction: HookDirection::Outbound,
            id,
        })
    }

    /// [`Bus::add_inbound_hook`] for an async closure.
    pub fn add_inbound_hook_fn<F, Fut>(
        &self,
        hook: F,
        priority: i32,
    ) -> Result<HookRegistration, BusError>
    where
        F: Fn(Value, HookContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.add_inbound_hook(FnHook::new(hook), priority)
    }

    /// [`Bus::add_outbound_hook`] for an async closure.
    pub fn add_outbound_hook_fn<F, Fut>(
        &self,
        hook: F,
        priority: i32,
    ) -> Result<HookRegistration, BusError>
    where
        F: Fn(Value, HookContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.add_outbound_hook(FnHook::new(hook), priority)
    }
}

/// A handler error that is already a `BusError` keeps its kind.
fn handler_error(handler: &str, error: anyhow::Error) -> BusError {
    match error.downcast::<BusError>() {
        Ok(bus_error) => bus_error,
        Err(other) => BusError::with_message(ErrorKind::HandlerError, other.to_string())
            .detail("handler", handler),
    }
}

pub(crate) fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
