//! # Hub Topology Flows
//!
//! ```text
//!   [leaf a] ──┐
//!              ├── [hub] ── relays signals, forwards addressed envelopes
//!   [leaf b] ──┘
//! ```
//!
//! Leaves only know the hub. Broadcast signals fan out through it; requests
//! between leaves travel `via` the hub and the response finds its way back.

#[cfg(test)]
mod tests {
    use super::super::*;
    use peerbus_core::{
        BroadcastOptions, ErrorKind, HandlerOptions, RequestOptions, SignalOptions,
    };
    use serde_json::{json, Value};

    struct Star {
        hub: Bus,
        a: Bus,
        b: Bus,
        _links: Vec<(TransportRegistration, TransportRegistration)>,
    }

    async fn star() -> Star {
        let hub = hub("hub");
        let a = bus("a");
        let b = bus("b");
        let links = vec![link(&hub, &a), link(&hub, &b)];
        assert!(wait_connected(&hub, "a").await);
        assert!(wait_connected(&hub, "b").await);
        assert!(wait_connected(&a, "hub").await);
        assert!(wait_connected(&b, "hub").await);
        Star {
            hub,
            a,
            b,
            _links: links,
        }
    }

    fn register_whoami(bus: &Bus) {
        let me = bus.id().to_string();
        bus.handle_fn(
            "whoami",
            move |_args: Value, ctx| {
                let me = me.clone();
                async move { Ok::<_, anyhow::Error>(json!({ "me": me, "caller": ctx.peer_id })) }
            },
            HandlerOptions::default(),
        )
        .unwrap();
    }

    #[tokio::test]
    async fn test_leaf_signal_reaches_hub_and_other_leaf() {
        let star = star().await;
        let (_hub_sub, at_hub) = record(&star.hub, "news");
        let (_a_sub, at_a) = record(&star.a, "news");
        let (_b_sub, at_b) = record(&star.b, "news");

        star.a
            .signal("news", json!("hello"), SignalOptions::default())
            .await
            .unwrap();

        assert!(wait_until(|| at_b.lock().len() == 1).await);
        assert_eq!(at_hub.lock().len(), 1);
        assert!(at_a.lock().is_empty());

        let event = at_b.lock()[0].clone();
        assert_eq!(event.data, json!("hello"));
        // Attributed to the original sender, not the relaying hub.
        assert_eq!(event.source.peer_id.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_relayed_signals_keep_order_across_senders() {
        let star = star().await;
        let (_sub, at_b) = record(&star.b, "count");

        for n in 1..=5 {
            star.a
                .signal("count", json!(n), SignalOptions::default())
                .await
                .unwrap();
            star.hub
                .signal("count", json!(n * 100), SignalOptions::default())
                .await
                .unwrap();
        }

        assert!(wait_until(|| at_b.lock().len() == 10).await);
        let from_a: Vec<Value> = at_b
            .lock()
            .iter()
            .filter(|e| e.source.peer_id.as_deref() == Some("a"))
            .map(|e| e.data.clone())
            .collect();
        assert_eq!(from_a, (1..=5).map(|n| json!(n)).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_request_between_leaves_via_hub() {
        let star = star().await;
        register_whoami(&star.b);

        let answer = star
            .a
            .request(
                "b",
                "whoami",
                Value::Null,
                RequestOptions::default().via("hub"),
            )
            .await
            .unwrap();

        assert_eq!(answer, json!({ "me": "b", "caller": "a" }));
        assert_eq!(star.a.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_request_via_hub_to_unknown_leaf() {
        let star = star().await;

        let err = star
            .a
            .request(
                "nobody",
                "whoami",
                Value::Null,
                RequestOptions::default().via("hub"),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PeerNotFound);
    }

    #[tokio::test]
    async fn test_hub_broadcast_request_collects_every_leaf() {
        let star = star().await;
        register_whoami(&star.a);
        register_whoami(&star.b);

        let results = star
            .hub
            .broadcast_request("whoami", Value::Null, BroadcastOptions::default())
            .await
            .unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results["a"].as_ref().unwrap()["me"], json!("a"));
        assert_eq!(results["b"].as_ref().unwrap()["caller"], json!("hub"));
    }

    #[tokio::test]
    async fn test_broadcast_request_can_skip_failures() {
        let star = star().await;
        register_whoami(&star.a);

        let results = star
            .hub
            .broadcast_request(
                "whoami",
                Value::Null,
                BroadcastOptions::default().ignore_errors(),
            )
            .await
            .unwrap();

        assert_eq!(results.len(), 1);
        assert!(results.contains_key("a"));
    }
}
