//! # Integration Flows
//!
//! Buses wired together with [`ChannelTransport`] pairs. Every envelope
//! crosses the link as JSON and goes through the full inbound pipeline.

pub mod direct;
pub mod hub;
pub mod lifecycle;

use peerbus_core::{
    Bus, BusConfig, BusEvent, ChannelTransport, ListenerOptions, PeerStatus, Subscription,
    TransportOptions, TransportRegistration,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

// =============================================================================
// TEST FIXTURES
// =============================================================================

pub fn bus(id: &str) -> Bus {
    peerbus_telemetry::init_for_tests();
    Bus::new(BusConfig::for_testing(id)).expect("valid test config")
}

pub fn hub(id: &str) -> Bus {
    peerbus_telemetry::init_for_tests();
    Bus::new(BusConfig::for_testing(id).hub()).expect("valid test config")
}

/// Attach a channel pair between `a` and `b`; both sides open a handshake.
pub fn link(a: &Bus, b: &Bus) -> (TransportRegistration, TransportRegistration) {
    let (a_end, b_end) = ChannelTransport::pair(None, None);
    let a_reg = a
        .add_transport(a_end, TransportOptions::new(b.id()))
        .expect("attach a");
    let b_reg = b
        .add_transport(b_end, TransportOptions::new(a.id()))
        .expect("attach b");
    (a_reg, b_reg)
}

/// Poll `check` until it holds, giving spawned pumps time to run.
pub async fn wait_until<F>(mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    for _ in 0..400 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}

pub async fn wait_connected(bus: &Bus, peer_id: &str) -> bool {
    wait_until(|| bus.peer_status(peer_id) == Some(PeerStatus::Connected)).await
}

/// Record every event matching `pattern`.
pub fn record(bus: &Bus, pattern: &str) -> (Subscription, Arc<Mutex<Vec<BusEvent>>>) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let sub = bus.on(
        pattern,
        move |event| {
            sink.lock().push(event.clone());
            Ok(())
        },
        ListenerOptions::default(),
    )
    .expect("bus is alive");
    (sub, events)
}
