use crate::domain::PeerStatus;
use crate::service::types::MaintenanceReport;
use crate::service::Bus;
use peerbus_types::{now_millis, Envelope, MessageType};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info};

/// Check interval when only staleness pruning is configured.
const MIN_MAINTENANCE_INTERVAL: Duration = Duration::from_millis(50);

impl Bus {
    /// One maintenance pass:
    /// - remove peers silent for longer than `peer_stale_after_ms`
    /// - PING every connected peer when heartbeats are configured
    /// - retry offline queues of connected peers
    pub fn run_maintenance(&self) -> MaintenanceReport {
        let mut report = MaintenanceReport::default();
        if self.is_destroyed() {
            return report;
        }
        let config = &self.inner.config;
        let registry = &self.inner.registry;

        if let Some(max_age) = config.peer_stale_after_ms {
            for peer_id in registry.stale_peers(now_millis(), max_age) {
                info!(peer_id = %peer_id, max_age_ms = max_age, "Pruning stale peer");
                if self.remove_peer_because(&peer_id, "stale") {
                    report.pruned += 1;
                }
            }
        }

        if config.heartbeat_interval_ms.is_some() {
            for peer in registry.peers() {
                if peer.status != PeerStatus::Connected {
                    continue;
                }
                let ping = Envelope::new(MessageType::Ping, Value::Null).with_source(self.id());
                match registry.send_direct(&peer.id, &ping) {
                    Ok(()) => report.pinged += 1,
                    Err(error) => debug!(peer_id = %peer.id, error = %error, "PING failed"),
                }
            }
        }

        for peer_id in registry.peers_with_backlog() {
            report.drained += registry.drain_queue(&peer_id).sent;
        }
        report
    }

    /// Run [`Bus::run_maintenance`] periodically until the bus is destroyed.
    ///
    /// The period is the heartbeat interval, or half the staleness limit when
    /// only that is set. Returns `false` when neither is configured or the
    /// task is already running.
    pub fn start_maintenance(&self) -> bool {
        let config = &self.inner.config;
        let period = match (config.heartbeat_interval(), config.peer_stale_after_ms) {
            (Some(interval), _) => interval,
            (None, Some(stale_ms)) => Duration::from_millis(stale_ms / 2).max(MIN_MAINTENANCE_INTERVAL),
            (None, None) => return false,
        };
        if self.is_destroyed()
            || self
                .inner
                .maintenance_started
                .swap(true, std::sync::atomic::Ordering::AcqRel)
        {
            return false;
        }

        let weak = self.downgrade();
        let shutdown = self.inner.shutdown.clone();
        self.spawn_task(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(bus) = Bus::upgrade(&weak) else { break };
                let report = bus.run_maintenance();
                if report != MaintenanceReport::default() {
                    debug!(
                        pinged = report.pinged,
                        pruned = report.pruned,
                        drained = report.drained,
                        "Maintenance pass"
                    );
                }
            }
        });
        debug!(bus_id = %self.id(), period_ms = period.as_millis() as u64, "Maintenance started");
        true
    }
}
