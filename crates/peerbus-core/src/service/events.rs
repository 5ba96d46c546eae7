//! Lifecycle events raised on the local emitter.
//!
//! | Event | Data |
//! |-------|------|
//! | `peer:connected` | `{ peer_id, peer_type }` |
//! | `peer:disconnected` | `{ peer_id, reason }` |
//! | `peer:failed` | `{ peer_id, code, reason }` |
//! | `causal:overflow` | `{ evicted: [{ peer_id, seq }], capacity }` |
//! | `bus:destroyed` | `{ bus_id }` |
//!
//! Listen with `bus.on("peer:*", ...)` to follow every peer transition.

use crate::domain::{BusEvent, CausalOverflow, ListenerOptions, OffResult, Subscription};
use crate::service::Bus;
use peerbus_types::BusError;
use serde_json::{json, Value};

pub const PEER_CONNECTED: &str = "peer:connected";
pub const PEER_DISCONNECTED: &str = "peer:disconnected";
pub const PEER_FAILED: &str = "peer:failed";
pub const CAUSAL_OVERFLOW: &str = "causal:overflow";
pub const BUS_DESTROYED: &str = "bus:destroyed";

impl Bus {
    /// Listen for inbound signals and lifecycle events.
    ///
    /// # Errors
    ///
    /// `DESTROYED` once the bus is torn down.
    pub fn on<F>(
        &self,
        name: &str,
        listener: F,
        options: ListenerOptions,
    ) -> Result<Subscription, BusError>
    where
        F: Fn(&BusEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.ensure_alive()?;
        Ok(self.inner.emitter.on(name, listener, options))
    }

    pub fn once<F>(&self, name: &str, listener: F) -> Result<Subscription, BusError>
    where
        F: Fn(&BusEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.ensure_alive()?;
        Ok(self.inner.emitter.once(name, listener))
    }

    pub fn off(&self, name: &str) -> Result<OffResult, BusError> {
        self.ensure_alive()?;
        Ok(self.inner.emitter.off(name, None))
    }

    /// Emit on the local emitter only; nothing is sent to peers.
    pub fn emit_local(&self, name: &str, data: Value) -> Result<usize, BusError> {
        self.ensure_alive()?;
        Ok(self.inner.emitter.emit(name, data))
    }

    pub(crate) fn emit_connected(&self, peer_id: &str, peer_type: &str) {
        self.inner.emitter.emit(
            PEER_CONNECTED,
            json!({ "peer_id": peer_id, "peer_type": peer_type }),
        );
    }

    pub(crate) fn emit_disconnected(&self, peer_id: &str, reason: &str) {
        self.inner.emitter.emit(
            PEER_DISCONNECTED,
            json!({ "peer_id": peer_id, "reason": reason }),
        );
    }

    pub(crate) fn emit_failed(&self, peer_id: &str, error: &BusError) {
        self.inner.emitter.emit(
            PEER_FAILED,
            json!({
                "peer_id": peer_id,
                "code": error.kind().code(),
                "reason": error.message(),
            }),
        );
    }

    pub(crate) fn emit_overflow(&self, overflow: &CausalOverflow) {
        let evicted: Vec<Value> = overflow
            .evicted
            .iter()
            .map(|(peer_id, seq)| json!({ "peer_id": peer_id, "seq": seq }))
            .collect();
        self.inner.emitter.emit(
            CAUSAL_OVERFLOW,
            json!({ "evicted": evicted, "capacity": overflow.capacity }),
        );
    }
}
