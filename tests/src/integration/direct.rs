//! # Direct Link Flows
//!
//! Two buses over one channel link:
//!
//! 1. **Handshake**: simultaneous open converges, both sides connect
//! 2. **Requests**: round trip, handler errors, nested calls back to the caller
//! 3. **Signals**: delivery in send order with sender attribution
//! 4. **Hooks**: outbound and inbound transforms compose across the link

#[cfg(test)]
mod tests {
    use super::super::*;
    use peerbus_core::{
        events, BusError, ErrorKind, HandlerOptions, RequestOptions, SignalOptions,
    };
    use serde_json::{json, Value};

    fn register_double(bus: &Bus) {
        bus.handle_fn(
            "double",
            |args: Value, _ctx| async move {
                Ok::<_, anyhow::Error>(json!(args.as_i64().unwrap_or_default() * 2))
            },
            HandlerOptions::default(),
        )
        .unwrap();
    }

    // =========================================================================
    // HANDSHAKE
    // =========================================================================

    #[tokio::test]
    async fn test_simultaneous_open_connects_both_sides() {
        let alpha = bus("alpha");
        let beta = bus("beta");
        let (_alpha_events_sub, alpha_events) = record(&alpha, events::PEER_CONNECTED);
        let (_beta_events_sub, beta_events) = record(&beta, events::PEER_CONNECTED);

        let _links = link(&alpha, &beta);

        assert!(wait_connected(&alpha, "beta").await);
        assert!(wait_connected(&beta, "alpha").await);
        assert_eq!(alpha_events.lock().len(), 1);
        assert_eq!(beta_events.lock().len(), 1);
        assert_eq!(alpha_events.lock()[0].data["peer_id"], json!("beta"));
        assert_eq!(alpha.stats().handshakes_in_progress, 0);
        assert_eq!(beta.stats().handshakes_in_progress, 0);
    }

    // =========================================================================
    // REQUESTS
    // =========================================================================

    #[tokio::test]
    async fn test_request_round_trip() {
        let alpha = bus("alpha");
        let beta = bus("beta");
        register_double(&beta);
        let _links = link(&alpha, &beta);

        // Sent before the handshake finishes; waits in the offline queue.
        let answer = alpha
            .request("beta", "double", json!(21), RequestOptions::default())
            .await
            .unwrap();

        assert_eq!(answer, json!(42));
        assert_eq!(alpha.pending_requests(), 0);
        assert_eq!(alpha.stats().requests_sent, 1);
    }

    #[tokio::test]
    async fn test_remote_errors_keep_their_kind() {
        let alpha = bus("alpha");
        let beta = bus("beta");
        beta.handle_fn(
            "guarded",
            |_args: Value, _ctx| async move {
                Err::<Value, _>(anyhow::Error::new(BusError::with_message(
                    ErrorKind::Unauthorized,
                    "members only",
                )))
            },
            HandlerOptions::default(),
        )
        .unwrap();
        let _links = link(&alpha, &beta);
        assert!(wait_connected(&alpha, "beta").await);

        let err = alpha
            .request("beta", "guarded", Value::Null, RequestOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthorized);
        assert_eq!(err.message(), "members only");

        let err = alpha
            .request("beta", "missing", Value::Null, RequestOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoHandler);
    }

    #[tokio::test]
    async fn test_handler_can_call_back_over_the_same_link() {
        let alpha = bus("alpha");
        let beta = bus("beta");
        register_double(&alpha);

        let callback = beta.clone();
        beta.handle_fn(
            "quadruple",
            move |args: Value, ctx| {
                let bus = callback.clone();
                async move {
                    let doubled = bus
                        .request(&ctx.peer_id, "double", args, RequestOptions::default())
                        .await?;
                    let again = bus
                        .request(&ctx.peer_id, "double", doubled, RequestOptions::default())
                        .await?;
                    Ok::<_, anyhow::Error>(again)
                }
            },
            HandlerOptions::default(),
        )
        .unwrap();
        let _links = link(&alpha, &beta);

        let answer = alpha
            .request("beta", "quadruple", json!(3), RequestOptions::default())
            .await
            .unwrap();
        assert_eq!(answer, json!(12));
        beta.destroy();
    }

    #[tokio::test]
    async fn test_handler_sees_caller_identity() {
        let alpha = bus("alpha");
        let beta = bus("beta");
        beta.handle_fn(
            "whoami",
            |_args: Value, ctx| async move { Ok::<_, anyhow::Error>(json!(ctx.peer_id)) },
            HandlerOptions::default().with_allowed_peers(["alpha"]),
        )
        .unwrap();
        let _links = link(&alpha, &beta);

        let answer = alpha
            .request("beta", "whoami", Value::Null, RequestOptions::default())
            .await
            .unwrap();
        assert_eq!(answer, json!("alpha"));
    }

    // =========================================================================
    // SIGNALS
    // =========================================================================

    #[tokio::test]
    async fn test_signals_arrive_in_send_order() {
        let alpha = bus("alpha");
        let beta = bus("beta");
        let (_sub, received) = record(&beta, "tick");
        let _links = link(&alpha, &beta);
        assert!(wait_connected(&alpha, "beta").await);

        for n in 1..=20 {
            alpha
                .signal("tick", json!(n), SignalOptions::default())
                .await
                .unwrap();
        }

        assert!(wait_until(|| received.lock().len() == 20).await);
        let received = received.lock();
        let order: Vec<i64> = received
            .iter()
            .map(|e| e.data.as_i64().unwrap_or_default())
            .collect();
        assert_eq!(order, (1..=20).collect::<Vec<i64>>());
        assert!(received
            .iter()
            .all(|e| e.source.peer_id.as_deref() == Some("alpha")));
    }

    #[tokio::test]
    async fn test_signals_sent_while_connecting_are_delivered() {
        let alpha = bus("alpha");
        let beta = bus("beta");
        let (_sub, received) = record(&beta, "early");
        let _links = link(&alpha, &beta);

        let routed = alpha
            .signal("early", json!("queued"), SignalOptions::default())
            .await
            .unwrap();
        assert_eq!(routed.queued, vec!["beta".to_string()]);

        assert!(wait_until(|| received.lock().len() == 1).await);
        assert_eq!(received.lock()[0].data, json!("queued"));
    }

    // =========================================================================
    // HOOKS
    // =========================================================================

    #[tokio::test]
    async fn test_hooks_transform_across_the_link() {
        let alpha = bus("alpha");
        let beta = bus("beta");
        register_double(&beta);

        alpha.add_outbound_hook_fn(
            |data: Value, _ctx| async move {
                Ok::<_, anyhow::Error>(json!(data.as_i64().unwrap_or_default() + 1))
            },
            0,
        )
        .unwrap();
        beta.add_inbound_hook_fn(
            |data: Value, _ctx| async move {
                Ok::<_, anyhow::Error>(json!(data.as_i64().unwrap_or_default() * 10))
            },
            0,
        )
        .unwrap();
        let _links = link(&alpha, &beta);

        // alpha: 4 + 1 = 5; beta inbound: 50; handler: 100;
        // the response passes beta's outbound (none) and alpha's inbound (none).
        let answer = alpha
            .request("beta", "double", json!(4), RequestOptions::default())
            .await
            .unwrap();
        assert_eq!(answer, json!(100));
    }
}
