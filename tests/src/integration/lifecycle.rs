//! # Peer Lifecycle Flows
//!
//! Disconnect and reconnect, handshake deadlines, origin enforcement on a
//! live link, transport cleanup and bus teardown.

#[cfg(test)]
mod tests {
    use super::super::*;
    use peerbus_core::{
        events, ErrorKind, HandlerOptions, RequestOptions, SignalOptions,
    };
    use serde_json::{json, Value};

    // =========================================================================
    // DISCONNECT / RECONNECT
    // =========================================================================

    #[tokio::test]
    async fn test_bye_then_reconnect() {
        let alpha = bus("alpha");
        let beta = bus("beta");
        let (_sub, beta_events) = record(&beta, "peer:*");
        let _links = link(&alpha, &beta);
        assert!(wait_connected(&beta, "alpha").await);

        alpha.disconnect("beta").unwrap();
        assert_eq!(alpha.peer_status("beta"), Some(PeerStatus::Disconnected));
        assert!(wait_until(|| beta.peer_status("alpha") == Some(PeerStatus::Disconnected)).await);
        assert!(beta_events
            .lock()
            .iter()
            .any(|e| e.name == events::PEER_DISCONNECTED && e.data["reason"] == json!("bye")));

        // Queued while disconnected, delivered after the new handshake.
        let (_tick_sub, ticks) = record(&beta, "tick");
        let routed = alpha
            .signal("tick", json!(1), SignalOptions::default())
            .await
            .unwrap();
        assert_eq!(routed.queued, vec!["beta".to_string()]);

        alpha.reconnect("beta").unwrap();
        assert!(wait_connected(&alpha, "beta").await);
        assert!(wait_connected(&beta, "alpha").await);
        assert!(wait_until(|| ticks.lock().len() == 1).await);
    }

    #[tokio::test]
    async fn test_reconnect_restarts_sequences_on_both_ends() {
        let alpha = bus("alpha");
        let beta = bus("beta");
        let (_tick_sub, ticks) = record(&beta, "tick");
        let _links = link(&alpha, &beta);
        assert!(wait_connected(&alpha, "beta").await);
        assert!(wait_connected(&beta, "alpha").await);

        for n in 1..=2 {
            alpha
                .signal("tick", json!(n), SignalOptions::default())
                .await
                .unwrap();
        }
        assert!(wait_until(|| ticks.lock().len() == 2).await);

        // beta initiates; alpha renegotiates as the responder.
        let (_sub, alpha_connected) = record(&alpha, events::PEER_CONNECTED);
        beta.reconnect("alpha").unwrap();
        assert!(wait_until(|| alpha_connected.lock().len() == 1).await);
        assert!(wait_connected(&beta, "alpha").await);

        alpha
            .signal("tick", json!(3), SignalOptions::default())
            .await
            .unwrap();
        assert!(wait_until(|| ticks.lock().len() == 3).await);
        let order: Vec<Value> = ticks.lock().iter().map(|e| e.data.clone()).collect();
        assert_eq!(order, vec![json!(1), json!(2), json!(3)]);
        assert_eq!(beta.stats().causal_buffered, 0);
    }

    #[tokio::test]
    async fn test_reconnect_unknown_peer() {
        let alpha = bus("alpha");
        assert_eq!(
            alpha.reconnect("ghost").unwrap_err().kind(),
            ErrorKind::PeerNotFound
        );
    }

    // =========================================================================
    // HANDSHAKE DEADLINES
    // =========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_silent_remote_fails_handshake() {
        let alpha = bus("alpha");
        let (_sub, failures) = record(&alpha, events::PEER_FAILED);

        // Nothing ever reads the far end.
        let (near, _far) = ChannelTransport::pair(None, None);
        alpha
            .add_transport(near, TransportOptions::new("silent"))
            .unwrap();

        let err = alpha
            .request("silent", "anything", Value::Null, RequestOptions::default())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::HandshakeTimeout);
        assert_eq!(alpha.peer_status("silent"), Some(PeerStatus::Failed));
        let failures = failures.lock();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].data["code"], json!("HANDSHAKE_TIMEOUT"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_forbidden_origin_never_connects() {
        peerbus_telemetry::init_for_tests();
        let strict = Bus::new(
            BusConfig::for_testing("strict").with_allowed_origins(["https://trusted.example"]),
        )
        .unwrap();
        let open = bus("open");

        let (strict_end, open_end) =
            ChannelTransport::pair(Some("https://strict.example"), Some("https://rogue.example"));
        let _strict_reg = strict
            .add_transport(strict_end, TransportOptions::new("open"))
            .unwrap();
        let _open_reg = open
            .add_transport(open_end, TransportOptions::new("strict"))
            .unwrap();

        let err = open
            .request("strict", "anything", Value::Null, RequestOptions::default())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::HandshakeTimeout);
        assert_eq!(open.peer_status("strict"), Some(PeerStatus::Failed));
        assert!(strict.stats().messages_dropped > 0);
    }

    #[tokio::test]
    async fn test_passive_side_waits_for_initiator() {
        let alpha = bus("alpha");
        let beta = bus("beta");
        let (a_end, b_end) = ChannelTransport::pair(None, None);
        let _a = alpha
            .add_transport(a_end, TransportOptions::new("beta"))
            .unwrap();
        let _b = beta
            .add_transport(b_end, TransportOptions::new("alpha").passive())
            .unwrap();

        assert!(wait_connected(&alpha, "beta").await);
        assert!(wait_connected(&beta, "alpha").await);
    }

    // =========================================================================
    // TEARDOWN
    // =========================================================================

    #[tokio::test]
    async fn test_cleanup_removes_peer_and_closes_link() {
        let alpha = bus("alpha");
        let beta = bus("beta");
        let (_sub, removed) = record(&alpha, events::PEER_DISCONNECTED);
        let (alpha_reg, _beta_reg) = link(&alpha, &beta);
        assert!(wait_connected(&alpha, "beta").await);

        assert_eq!(alpha_reg.peer_id(), "beta");
        alpha_reg.cleanup();

        assert!(alpha.peer("beta").is_none());
        assert_eq!(removed.lock()[0].data["reason"], json!("removed"));

        // The far end can no longer reach us.
        beta.handle_fn(
            "noop",
            |_args: Value, _ctx| async move { Ok::<_, anyhow::Error>(Value::Null) },
            HandlerOptions::default(),
        )
        .unwrap();
        let err = beta
            .request(
                "alpha",
                "noop",
                Value::Null,
                RequestOptions::default().with_timeout(std::time::Duration::from_millis(200)),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err.kind(),
            ErrorKind::PeerDisconnected | ErrorKind::ResponseTimeout
        ));
    }

    #[tokio::test]
    async fn test_destroy_fails_in_flight_requests() {
        let alpha = bus("alpha");
        let beta = bus("beta");
        beta.handle_fn(
            "slow",
            |_args: Value, _ctx| async move {
                tokio::time::sleep(std::time::Duration::from_secs(30)).await;
                Ok::<_, anyhow::Error>(Value::Null)
            },
            HandlerOptions::default(),
        )
        .unwrap();
        let _links = link(&alpha, &beta);
        assert!(wait_connected(&alpha, "beta").await);

        let caller = alpha.clone();
        let call = tokio::spawn(async move {
            caller
                .request("beta", "slow", Value::Null, RequestOptions::default())
                .await
        });
        assert!(wait_until(|| alpha.pending_requests() == 1).await);

        alpha.destroy();

        assert_eq!(call.await.unwrap().unwrap_err().kind(), ErrorKind::Destroyed);
        assert!(alpha.peers().is_empty());
        assert_eq!(
            alpha
                .request("beta", "slow", Value::Null, RequestOptions::default())
                .await
                .unwrap_err()
                .kind(),
            ErrorKind::Destroyed
        );
        beta.destroy();
    }

    #[tokio::test]
    async fn test_heartbeat_pings_connected_peers() {
        peerbus_telemetry::init_for_tests();
        let config = BusConfig {
            heartbeat_interval_ms: Some(20),
            ..BusConfig::for_testing("alpha")
        };
        let alpha = Bus::new(config).unwrap();
        let beta = bus("beta");
        let _links = link(&alpha, &beta);
        assert!(wait_connected(&alpha, "beta").await);
        let seen_before = beta.peer("alpha").map(|p| p.last_seen).unwrap_or_default();

        assert!(alpha.start_maintenance());
        assert!(
            wait_until(|| {
                beta.peer("alpha")
                    .is_some_and(|p| p.last_seen > seen_before)
            })
            .await
        );
        alpha.destroy();
    }
}
