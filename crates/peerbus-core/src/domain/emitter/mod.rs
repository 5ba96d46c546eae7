//! # Local Event Emitter
//!
//! In-process fan-out of named events, independent of any transport.
//!
//! ## Matching
//!
//! | Registered name | Matches |
//! |-----------------|---------|
//! | `"user:login"`  | exactly `"user:login"` |
//! | `"user:*"`      | `"user:login"`, `"user:a:b"`; not `"user"` |
//! | `"*"`           | everything |
//!
//! Listeners run by descending priority, registration order breaking ties.
//! A failing listener is logged and the remaining listeners still run.
//!
//! [`EventEmitter::emit_sync`] is the unvalidated exact-name hot path: no
//! event construction, no wildcard lookup.

mod pattern;
mod types;

pub use pattern::{EventPattern, GLOBAL_WILDCARD, NAMESPACE_WILDCARD};
pub use types::{
    BusEvent, DispatchMode, EventSource, FastListener, Listener, ListenerId, ListenerOptions,
    OffResult,
};

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

// =============================================================================
// LISTENER TABLE
// =============================================================================

struct ListenerEntry {
    id: ListenerId,
    priority: i32,
    once: bool,
    mode: DispatchMode,
    signal: Option<CancellationToken>,
    active: Arc<AtomicBool>,
    listener: Listener,
}

impl ListenerEntry {
    fn is_live(&self) -> bool {
        self.active.load(Ordering::Acquire)
            && !self.signal.as_ref().is_some_and(CancellationToken::is_cancelled)
    }

    fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
    }
}

/// Snapshot of a listener selected for one emit.
struct Selected {
    id: ListenerId,
    priority: i32,
    mode: DispatchMode,
    listener: Listener,
}

#[derive(Default)]
struct EmitterInner {
    listeners: Mutex<HashMap<String, Vec<ListenerEntry>>>,
    fast: Mutex<HashMap<String, Vec<(ListenerId, FastListener)>>>,
    next_id: AtomicU64,
}

impl EmitterInner {
    fn next_id(&self) -> ListenerId {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn remove_listener(&self, name: &str, id: ListenerId) {
        let mut listeners = self.listeners.lock();
        if let Some(list) = listeners.get_mut(name) {
            list.retain(|entry| entry.id != id);
            if list.is_empty() {
                listeners.remove(name);
            }
        }
    }

    /// Collect live listeners for `name`, retiring `once` entries and
    /// pruning cancelled ones while the lock is held.
    fn select(&self, name: &str) -> Vec<Selected> {
        let mut selected = Vec::new();
        let mut listeners = self.listeners.lock();

        for key in pattern::candidate_keys(name) {
            let Some(list) = listeners.get_mut(&key) else {
                continue;
            };
            list.retain(ListenerEntry::is_live);
            for entry in list.iter() {
                selected.push(Selected {
                    id: entry.id,
                    priority: entry.priority,
                    mode: entry.mode,
                    listener: Arc::clone(&entry.listener),
                });
                if entry.once {
                    entry.deactivate();
                }
            }
            list.retain(|entry| !entry.once);
            if list.is_empty() {
                listeners.remove(&key);
            }
        }
        drop(listeners);

        selected.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));
        selected
    }
}

// =============================================================================
// SUBSCRIPTION
// =============================================================================

/// Handle returned by [`EventEmitter::on`].
///
/// Dropping the handle does not unregister the listener.
#[derive(Clone)]
pub struct Subscription {
    id: ListenerId,
    name: String,
    active: Arc<AtomicBool>,
    signal: Option<CancellationToken>,
    emitter: Weak<EmitterInner>,
}

impl Subscription {
    fn inactive(name: &str) -> Self {
        Self {
            id: 0,
            name: name.to_string(),
            active: Arc::new(AtomicBool::new(false)),
            signal: None,
            emitter: Weak::new(),
        }
    }

    /// Listener id; `0` for a registration that never became active.
    pub fn id(&self) -> ListenerId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
            && !self.signal.as_ref().is_some_and(CancellationToken::is_cancelled)
    }

    /// Remove the listener. Returns `false` if it was already inactive.
    pub fn unsubscribe(&self) -> bool {
        let was_active = self.active.swap(false, Ordering::AcqRel);
        if let Some(inner) = self.emitter.upgrade() {
            inner.remove_listener(&self.name, self.id);
        }
        was_active
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("active", &self.is_active())
            .finish()
    }
}

// =============================================================================
// EMITTER
// =============================================================================

/// Named-event emitter. Cloning shares the listener table.
#[derive(Clone, Default)]
pub struct EventEmitter {
    inner: Arc<EmitterInner>,
}

impl EventEmitter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener for an exact name, `"prefix:*"` or `"*"`.
    ///
    /// A token in `options.signal` that is already cancelled makes this a
    /// no-op returning an inactive subscription.
    pub fn on<F>(&self, name: &str, listener: F, options: ListenerOptions) -> Subscription
    where
        F: Fn(&BusEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        if options.signal.as_ref().is_some_and(CancellationToken::is_cancelled) {
            debug!(event = name, "Listener signal already cancelled; not registering");
            return Subscription::inactive(name);
        }

        let id = self.inner.next_id();
        let active = Arc::new(AtomicBool::new(true));
        let entry = ListenerEntry {
            id,
            priority: options.priority,
            once: options.once,
            mode: options.mode,
            signal: options.signal.clone(),
            active: Arc::clone(&active),
            listener: Arc::new(listener),
        };
        self.inner
            .listeners
            .lock()
            .entry(name.to_string())
            .or_default()
            .push(entry);

        Subscription {
            id,
            name: name.to_string(),
            active,
            signal: options.signal,
            emitter: Arc::downgrade(&self.inner),
        }
    }

    /// Register a listener that fires at most once.
    pub fn once<F>(&self, name: &str, listener: F) -> Subscription
    where
        F: Fn(&BusEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.on(name, listener, ListenerOptions::once())
    }

    /// Emit a locally sourced event. Returns the number of listeners invoked.
    pub fn emit(&self, name: &str, data: Value) -> usize {
        self.emit_event(BusEvent::local(name, data))
    }

    /// Emit a prebuilt event.
    pub fn emit_event(&self, event: BusEvent) -> usize {
        let selected = self.inner.select(&event.name);
        if selected.is_empty() {
            return 0;
        }

        let event = Arc::new(event);
        for listener in &selected {
            match listener.mode {
                DispatchMode::Sync => invoke(listener.id, &listener.listener, &event),
                DispatchMode::Async => match tokio::runtime::Handle::try_current() {
                    Ok(handle) => {
                        let id = listener.id;
                        let callback = Arc::clone(&listener.listener);
                        let event = Arc::clone(&event);
                        handle.spawn(async move { invoke(id, &callback, &event) });
                    }
                    Err(_) => invoke(listener.id, &listener.listener, &event),
                },
            }
        }
        selected.len()
    }

    /// Remove one listener (by id) or all listeners registered under `name`.
    pub fn off(&self, name: &str, id: Option<ListenerId>) -> OffResult {
        let mut listeners = self.inner.listeners.lock();
        let Some(list) = listeners.get_mut(name) else {
            return OffResult {
                removed: 0,
                remaining: 0,
            };
        };

        let before = list.len();
        list.retain(|entry| {
            let matched = id.map_or(true, |id| entry.id == id);
            if matched {
                entry.deactivate();
            }
            !matched
        });
        let remaining = list.len();
        if remaining == 0 {
            listeners.remove(name);
        }

        OffResult {
            removed: before - remaining,
            remaining,
        }
    }

    /// Live listeners registered under exactly `name`.
    pub fn listener_count(&self, name: &str) -> usize {
        self.inner
            .listeners
            .lock()
            .get(name)
            .map_or(0, |list| list.iter().filter(|e| e.is_live()).count())
    }

    /// Whether an emit of `name` would reach any validated-path listener.
    pub fn has_listeners(&self, name: &str) -> bool {
        let listeners = self.inner.listeners.lock();
        pattern::candidate_keys(name).iter().any(|key| {
            listeners
                .get(key)
                .is_some_and(|list| list.iter().any(ListenerEntry::is_live))
        })
    }

    /// Drop every listener on both paths.
    pub fn clear(&self) {
        let mut listeners = self.inner.listeners.lock();
        for entry in listeners.values().flatten() {
            entry.deactivate();
        }
        listeners.clear();
        drop(listeners);
        self.inner.fast.lock().clear();
    }

    // =========================================================================
    // HOT PATH
    // =========================================================================

    /// Register an exact-name hot-path listener.
    pub fn on_fast<F>(&self, name: &str, listener: F) -> ListenerId
    where
        F: Fn(&Value) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = self.inner.next_id();
        self.inner
            .fast
            .lock()
            .entry(name.to_string())
            .or_default()
            .push((id, Arc::new(listener)));
        id
    }

    pub fn off_fast(&self, name: &str, id: ListenerId) -> bool {
        let mut fast = self.inner.fast.lock();
        let Some(list) = fast.get_mut(name) else {
            return false;
        };
        let before = list.len();
        list.retain(|(entry_id, _)| *entry_id != id);
        let removed = list.len() != before;
        if list.is_empty() {
            fast.remove(name);
        }
        removed
    }

    /// Invoke hot-path listeners for exactly `name`, in registration order.
    pub fn emit_sync(&self, name: &str, data: &Value) -> usize {
        let listeners = match self.inner.fast.lock().get(name) {
            Some(list) => list.clone(),
            None => return 0,
        };
        for (id, listener) in &listeners {
            match panic::catch_unwind(AssertUnwindSafe(|| listener(data))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(event = name, listener_id = id, error = %e, "Hot-path listener failed");
                }
                Err(_) => {
                    error!(event = name, listener_id = id, "Hot-path listener panicked");
                }
            }
        }
        listeners.len()
    }
}

impl fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventEmitter")
            .field("names", &self.inner.listeners.lock().len())
            .field("fast_names", &self.inner.fast.lock().len())
            .finish()
    }
}

fn invoke(id: ListenerId, listener: &Listener, event: &BusEvent) {
    match panic::catch_unwind(AssertUnwindSafe(|| listener(event))) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            warn!(event = %event.name, listener_id = id, error = %e, "Listener failed");
        }
        Err(_) => {
            error!(event = %event.name, listener_id = id, "Listener panicked");
        }
    }
}
