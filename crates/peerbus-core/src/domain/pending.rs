//! # Pending Request Tracker
//!
//! Correlates outgoing requests with incoming responses.
//!
//! Flow:
//! 1. `create()` allocates an id and a [`PendingHandle`]
//! 2. The caller sends a `REQUEST` envelope carrying that id
//! 3. A matching `RESPONSE` calls `resolve()`/`reject()`
//! 4. The caller awaits [`PendingHandle::wait`], which also enforces the
//!    timeout and the optional default value
//!
//! Every terminal path removes the entry. `resolve`/`reject`/`cancel` on an
//! id that is gone are no-ops returning `false`.

use dashmap::DashMap;
use peerbus_types::{BusError, ErrorKind};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::debug;

type Outcome = Result<Value, BusError>;

/// Per-request options.
#[derive(Debug, Clone, Default)]
pub struct PendingOptions {
    /// Overrides the tracker's default timeout.
    pub timeout: Option<Duration>,
    /// Resolve with this instead of failing on timeout.
    pub default_value: Option<Value>,
    /// Fail with `ACK_TIMEOUT` if neither an ACK nor a response arrives in time.
    pub ack_timeout: Option<Duration>,
}

struct PendingEntry {
    sender: oneshot::Sender<Outcome>,
    ack: Option<oneshot::Sender<()>>,
    peer_id: String,
    handler: String,
    created_at: Instant,
}

/// Counters for the tracker.
#[derive(Debug, Default)]
struct PendingCounters {
    registered: AtomicU64,
    resolved: AtomicU64,
    rejected: AtomicU64,
    timed_out: AtomicU64,
    defaulted: AtomicU64,
}

/// Snapshot of tracker counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingStats {
    pub registered: u64,
    pub resolved: u64,
    /// Rejections, including cancellations.
    pub rejected: u64,
    pub timed_out: u64,
    /// Timeouts answered with a default value.
    pub defaulted: u64,
    pub pending: usize,
}

struct PendingInner {
    entries: DashMap<String, PendingEntry>,
    counters: PendingCounters,
}

impl PendingInner {
    fn settle(&self, id: &str, outcome: Outcome) -> bool {
        let Some((_, entry)) = self.entries.remove(id) else {
            debug!(request_id = id, "Ignoring outcome for unknown or settled request");
            return false;
        };
        let counter = if outcome.is_ok() {
            &self.counters.resolved
        } else {
            &self.counters.rejected
        };
        counter.fetch_add(1, Ordering::Relaxed);
        debug!(
            request_id = id,
            peer_id = %entry.peer_id,
            handler = %entry.handler,
            elapsed_ms = entry.created_at.elapsed().as_millis() as u64,
            ok = outcome.is_ok(),
            "Request settled"
        );
        // The waiter may already be gone.
        let _ = entry.sender.send(outcome);
        true
    }
}

/// Outstanding requests, keyed by request id.
pub struct PendingRequests {
    inner: Arc<PendingInner>,
    max_pending: usize,
    default_timeout: Duration,
}

impl PendingRequests {
    #[must_use]
    pub fn new(max_pending: usize, default_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(PendingInner {
                entries: DashMap::new(),
                counters: PendingCounters::default(),
            }),
            max_pending,
            default_timeout,
        }
    }

    /// Register a request to `peer_id`.
    ///
    /// # Errors
    ///
    /// `MAX_PENDING` when the ceiling is reached.
    pub fn create(
        &self,
        peer_id: &str,
        handler: &str,
        options: PendingOptions,
    ) -> Result<PendingHandle, BusError> {
        if self.inner.entries.len() >= self.max_pending {
            return Err(BusError::new(ErrorKind::MaxPending)
                .detail("max_pending", self.max_pending)
                .detail("handler", handler));
        }

        let id = uuid::Uuid::new_v4().to_string();
        let (sender, rx) = oneshot::channel();
        let (ack, ack_rx) = match options.ack_timeout {
            Some(_) => {
                let (tx, rx) = oneshot::channel();
                (Some(tx), Some(rx))
            }
            None => (None, None),
        };

        self.inner.entries.insert(
            id.clone(),
            PendingEntry {
                sender,
                ack,
                peer_id: peer_id.to_string(),
                handler: handler.to_string(),
                created_at: Instant::now(),
            },
        );
        self.inner.counters.registered.fetch_add(1, Ordering::Relaxed);

        Ok(PendingHandle {
            id,
            handler: handler.to_string(),
            rx,
            ack_rx,
            timeout: options.timeout.unwrap_or(self.default_timeout),
            ack_timeout: options.ack_timeout,
            default_value: options.default_value,
            inner: Arc::clone(&self.inner),
        })
    }

    pub fn resolve(&self, id: &str, value: Value) -> bool {
        self.inner.settle(id, Ok(value))
    }

    pub fn reject(&self, id: &str, error: BusError) -> bool {
        self.inner.settle(id, Err(error))
    }

    /// Abandon the local wait; the remote side is not interrupted.
    pub fn cancel(&self, id: &str, reason: BusError) -> bool {
        self.reject(id, reason)
    }

    /// Record an ACK. The entry stays pending.
    pub fn acknowledge(&self, id: &str) -> bool {
        match self.inner.entries.get_mut(id) {
            Some(mut entry) => {
                if let Some(ack) = entry.ack.take() {
                    let _ = ack.send(());
                }
                true
            }
            None => false,
        }
    }

    /// Reject every request addressed to `peer_id` with `error`.
    pub fn cancel_for_peer(&self, peer_id: &str, error: &BusError) -> usize {
        let ids: Vec<String> = self
            .inner
            .entries
            .iter()
            .filter(|entry| entry.peer_id == peer_id)
            .map(|entry| entry.key().clone())
            .collect();
        ids.iter()
            .filter(|id| self.reject(id, error.clone()))
            .count()
    }

    /// Reject everything with `error`.
    pub fn reject_all(&self, error: &BusError) -> usize {
        let ids: Vec<String> = self.inner.entries.iter().map(|e| e.key().clone()).collect();
        ids.iter()
            .filter(|id| self.reject(id, error.clone()))
            .count()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.entries.contains_key(id)
    }

    /// Target peer of a pending request.
    pub fn peer_of(&self, id: &str) -> Option<String> {
        self.inner.entries.get(id).map(|e| e.peer_id.clone())
    }

    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    pub fn stats(&self) -> PendingStats {
        let c = &self.inner.counters;
        PendingStats {
            registered: c.registered.load(Ordering::Relaxed),
            resolved: c.resolved.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
            timed_out: c.timed_out.load(Ordering::Relaxed),
            defaulted: c.defaulted.load(Ordering::Relaxed),
            pending: self.len(),
        }
    }
}

/// Caller's side of a pending request. Dropping it removes the entry.
pub struct PendingHandle {
    id: String,
    handler: String,
    rx: oneshot::Receiver<Outcome>,
    ack_rx: Option<oneshot::Receiver<()>>,
    timeout: Duration,
    ack_timeout: Option<Duration>,
    default_value: Option<Value>,
    inner: Arc<PendingInner>,
}

impl PendingHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Wait for the outcome.
    ///
    /// # Errors
    ///
    /// - `ACK_TIMEOUT` when an ack deadline shorter than the response
    ///   deadline was set and passed
    /// - `RESPONSE_TIMEOUT` when the deadline passed without a default value
    /// - whatever error the request was rejected or cancelled with
    pub async fn wait(mut self) -> Outcome {
        let deadline = tokio::time::Instant::now() + self.timeout;

        // An ack deadline at or past the response deadline never fires first.
        let ack_timeout = self.ack_timeout.filter(|ack| *ack < self.timeout);
        if let (Some(ack_rx), Some(ack_timeout)) = (self.ack_rx.take(), ack_timeout) {
            tokio::select! {
                outcome = &mut self.rx => return self.received(outcome),
                acked = tokio::time::timeout(ack_timeout, ack_rx) => {
                    if acked.is_err() && self.inner.entries.remove(&self.id).is_some() {
                        self.inner.counters.timed_out.fetch_add(1, Ordering::Relaxed);
                        return Err(BusError::new(ErrorKind::AckTimeout)
                            .detail("request_id", self.id.as_str())
                            .detail("handler", self.handler.as_str())
                            .detail("ack_timeout_ms", duration_ms(ack_timeout)));
                    }
                }
            }
        }

        match tokio::time::timeout_at(deadline, &mut self.rx).await {
            Ok(outcome) => self.received(outcome),
            Err(_) => self.timed_out(),
        }
    }

    fn received(&self, outcome: Result<Outcome, oneshot::error::RecvError>) -> Outcome {
        outcome.unwrap_or_else(|_| Err(BusError::destroyed()))
    }

    fn timed_out(&mut self) -> Outcome {
        if self.inner.entries.remove(&self.id).is_none() {
            // Settled between the deadline firing and the removal.
            if let Ok(outcome) = self.rx.try_recv() {
                return outcome;
            }
        }
        self.inner.counters.timed_out.fetch_add(1, Ordering::Relaxed);

        match self.default_value.take() {
            Some(value) => {
                self.inner.counters.defaulted.fetch_add(1, Ordering::Relaxed);
                debug!(request_id = %self.id, handler = %self.handler, "Request timed out; using default value");
                Ok(value)
            }
            None => Err(BusError::new(ErrorKind::ResponseTimeout)
                .detail("request_id", self.id.as_str())
                .detail("handler", self.handler.as_str())
                .detail("timeout_ms", duration_ms(self.timeout))),
        }
    }
}

impl Drop for PendingHandle {
    fn drop(&mut self) {
        self.inner.entries.remove(&self.id);
    }
}

impl std::fmt::Debug for PendingHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingHandle")
            .field("id", &self.id)
            .field("handler", &self.handler)
            .field("timeout", &self.timeout)
            .finish()
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
