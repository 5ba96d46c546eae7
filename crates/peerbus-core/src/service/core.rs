use crate::config::{BusConfig, ConfigError};
use crate::domain::{
    CausalOrderer, EventEmitter, HandlerSecurity, Handshakes, HookDirection, HookId, HookPipeline,
    OriginValidator, PeerRegistry, PeerStatus, PendingRequests,
};
use crate::ports::{RequestHandler, Transport};
use crate::service::events;
use crate::service::types::BusStats;
use dashmap::DashMap;
use parking_lot::Mutex;
use peerbus_types::{BusError, Envelope};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// A registered request handler.
pub(crate) struct HandlerEntry {
    pub(crate) id: u64,
    pub(crate) handler: Arc<dyn RequestHandler>,
    pub(crate) security: HandlerSecurity,
    pub(crate) timeout: Option<Duration>,
}

/// A transport attached with [`Bus::add_transport`].
pub(crate) struct AttachedTransport {
    pub(crate) transport: Arc<dyn Transport>,
    /// Stops this link's inbound pump.
    pub(crate) stop: CancellationToken,
}

#[derive(Debug, Default)]
pub(crate) struct BusCounters {
    pub(crate) signals_sent: AtomicU64,
    pub(crate) requests_sent: AtomicU64,
    pub(crate) responses_received: AtomicU64,
    pub(crate) messages_dropped: AtomicU64,
}

impl BusCounters {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// State owned by one bus instance.
pub(crate) struct BusInner {
    pub(crate) config: BusConfig,
    pub(crate) emitter: EventEmitter,
    pub(crate) origins: OriginValidator,
    pub(crate) orderer: Mutex<CausalOrderer<Envelope>>,
    pub(crate) registry: PeerRegistry,
    pub(crate) pending: PendingRequests,
    pub(crate) handshakes: Handshakes,
    pub(crate) inbound_hooks: HookPipeline,
    pub(crate) outbound_hooks: HookPipeline,
    pub(crate) handlers: DashMap<String, Arc<HandlerEntry>>,
    pub(crate) transports: Mutex<HashMap<String, AttachedTransport>>,
    pub(crate) counters: BusCounters,
    pub(crate) destroyed: AtomicBool,
    pub(crate) maintenance_started: AtomicBool,
    pub(crate) shutdown: CancellationToken,
    pub(crate) tasks: Mutex<Vec<JoinHandle<()>>>,
    next_handler_id: AtomicU64,
}

impl Drop for BusInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// One participant on the message bus.
///
/// Cloning is cheap and every clone drives the same instance. Background
/// tasks hold weak references, so the instance goes away with its last
/// handle even without [`Bus::destroy`].
///
/// # Example
///
/// ```rust,ignore
/// let bus = Bus::new(BusConfig::with_id("tab-1"))?;
/// bus.handle_fn("double", |args, _ctx| async move {
///     Ok(json!(args["n"].as_i64().unwrap_or(0) * 2))
/// }, HandlerOptions::default())?;
///
/// let answer = bus.request("tab-1", "double", json!({ "n": 21 }), RequestOptions::default()).await?;
/// assert_eq!(answer, json!(42));
/// ```
#[derive(Clone)]
pub struct Bus {
    pub(crate) inner: Arc<BusInner>,
}

impl Bus {
    /// Build a bus from a validated configuration.
    ///
    /// # Errors
    ///
    /// `ConfigError::Invalid` when the configuration fails validation.
    pub fn new(config: BusConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let origins = config.origin_validator()?;
        if origins.allows_all() {
            warn!(
                bus_id = %config.bus_id,
                "Origin checks disabled (allow_all_origins); only use with trusted transports"
            );
        }

        let inner = BusInner {
            emitter: EventEmitter::new(),
            origins,
            orderer: Mutex::new(CausalOrderer::new(
                config.bus_id.clone(),
                config.causal_buffer_size,
            )),
            registry: PeerRegistry::new(
                config.max_peers,
                config.offline_queue_size,
                config.offline_queue_retries,
            ),
            pending: PendingRequests::new(config.max_pending_requests, config.request_timeout()),
            handshakes: Handshakes::new(),
            inbound_hooks: HookPipeline::new(),
            outbound_hooks: HookPipeline::new(),
            handlers: DashMap::new(),
            transports: Mutex::new(HashMap::new()),
            counters: BusCounters::default(),
            destroyed: AtomicBool::new(false),
            maintenance_started: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            next_handler_id: AtomicU64::new(0),
            config,
        };
        info!(bus_id = %inner.config.bus_id, hub = inner.config.hub, "Bus created");
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    pub(crate) fn upgrade(weak: &Weak<BusInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    pub(crate) fn downgrade(&self) -> Weak<BusInner> {
        Arc::downgrade(&self.inner)
    }

    // =========================================================================
    // ACCESSORS
    // =========================================================================

    pub fn id(&self) -> &str {
        &self.inner.config.bus_id
    }

    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    pub fn is_hub(&self) -> bool {
        self.inner.config.hub
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::Acquire)
    }

    /// The local emitter that receives inbound signals and lifecycle events.
    pub fn emitter(&self) -> &EventEmitter {
        &self.inner.emitter
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.inner.registry
    }

    pub fn peer_status(&self, peer_id: &str) -> Option<PeerStatus> {
        self.inner.registry.status(peer_id)
    }

    pub fn has_handler(&self, name: &str) -> bool {
        self.inner.handlers.contains_key(name)
    }

    pub fn pending_requests(&self) -> usize {
        self.inner.pending.len()
    }

    /// Fail fast once destroyed.
    pub(crate) fn ensure_alive(&self) -> Result<(), BusError> {
        if self.is_destroyed() {
            return Err(BusError::destroyed().detail("bus_id", self.id()));
        }
        Ok(())
    }

    pub(crate) fn next_handler_id(&self) -> u64 {
        self.inner.next_handler_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Spawn a background task that dies with the bus.
    pub(crate) fn spawn_task<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(task);
        let mut tasks = self.inner.tasks.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle);
    }

    pub fn stats(&self) -> BusStats {
        let inner = &self.inner;
        let peers = inner.registry.peers();
        let counter = |c: &AtomicU64| c.load(Ordering::Relaxed);
        BusStats {
            bus_id: self.id().to_string(),
            peers: peers.len(),
            connected_peers: peers
                .iter()
                .filter(|p| p.status == PeerStatus::Connected)
                .count(),
            handlers: inner.handlers.len(),
            handshakes_in_progress: inner.handshakes.in_progress(),
            causal_buffered: inner.orderer.lock().buffered_len(),
            signals_sent: counter(&inner.counters.signals_sent),
            requests_sent: counter(&inner.counters.requests_sent),
            responses_received: counter(&inner.counters.responses_received),
            messages_dropped: counter(&inner.counters.messages_dropped),
            pending: inner.pending.stats(),
        }
    }

    // =========================================================================
    // TEARDOWN
    // =========================================================================

    /// Tear the bus down. Idempotent.
    ///
    /// Pending requests fail with `DESTROYED`, transports are destroyed and
    /// every table is cleared. In-flight handler invocations are not awaited;
    /// their responses are discarded.
    pub fn destroy(&self) {
        let inner = &self.inner;
        if inner.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        inner.shutdown.cancel();

        let cancelled = inner.pending.reject_all(&BusError::destroyed());
        inner
            .emitter
            .emit(events::BUS_DESTROYED, json!({ "bus_id": self.id() }));

        inner.handshakes.clear();
        let transports: Vec<AttachedTransport> =
            inner.transports.lock().drain().map(|(_, t)| t).collect();
        for attached in &transports {
            attached.stop.cancel();
            attached.transport.destroy();
        }
        let peers = inner.registry.clear();
        inner.handlers.clear();
        inner.inbound_hooks.clear();
        inner.outbound_hooks.clear();
        inner.emitter.clear();

        for task in inner.tasks.lock().drain(..) {
            task.abort();
        }

        info!(
            bus_id = %self.id(),
            peers = peers.len(),
            cancelled,
            "Bus destroyed"
        );
    }
}

impl fmt::Debug for Bus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bus")
            .field("id", &self.id())
            .field("hub", &self.is_hub())
            .field("peers", &self.inner.registry.len())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

// =============================================================================
// REGISTRATION HANDLES
// =============================================================================

/// Returned by [`Bus::handle`]. Unregistering is idempotent and never removes
/// a newer handler registered under the same name.
#[derive(Debug, Clone)]
pub struct HandlerRegistration {
    pub(crate) bus: Weak<BusInner>,
    pub(crate) name: String,
    pub(crate) id: u64,
}

impl HandlerRegistration {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn unregister(&self) -> bool {
        let Some(inner) = self.bus.upgrade() else {
            return false;
        };
        inner
            .handlers
            .remove_if(&self.name, |_, entry| entry.id == self.id)
            .is_some()
    }
}

/// Returned by the hook registration methods.
#[derive(Debug, Clone)]
pub struct HookRegistration {
    pub(crate) bus: Weak<BusInner>,
    pub(crate) direction: HookDirection,
    pub(crate) id: HookId,
}

impl HookRegistration {
    pub fn direction(&self) -> HookDirection {
        self.direction
    }

    pub fn unregister(&self) -> bool {
        let Some(inner) = self.bus.upgrade() else {
            return false;
        };
        match self.direction {
            HookDirection::Inbound => inner.inbound_hooks.remove(self.id),
            HookDirection::Outbound => inner.outbound_hooks.remove(self.id),
        }
    }
}

/// Encode a typed payload body.
pub(crate) fn body<T: Serialize>(payload: &T) -> Value {
    serde_json::to_value(payload).unwrap_or(Value::Null)
}
