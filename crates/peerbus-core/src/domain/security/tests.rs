//! Tests for the handler security gate

use super::*;
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};

fn manual_clock() -> (Arc<AtomicU64>, impl Fn() -> u64 + Send + Sync + 'static) {
    let now = Arc::new(AtomicU64::new(10_000));
    let handle = Arc::clone(&now);
    (now, move || handle.load(Ordering::SeqCst))
}

// =============================================================================
// TEST GROUP 1: Rate limiter
// =============================================================================

#[test]
fn test_limit_within_window() {
    let (_, clock) = manual_clock();
    let limiter = RateLimiter::with_clock(2, RATE_WINDOW_MS, clock);
    assert!(limiter.check("peer"));
    assert!(limiter.check("peer"));
    assert!(!limiter.check("peer"));
    assert_eq!(limiter.remaining("peer"), 0);
}

#[test]
fn test_window_resets() {
    let (now, clock) = manual_clock();
    let limiter = RateLimiter::with_clock(1, RATE_WINDOW_MS, clock);
    assert!(limiter.check("peer"));
    assert!(!limiter.check("peer"));

    now.fetch_add(RATE_WINDOW_MS, Ordering::SeqCst);
    assert!(limiter.check("peer"));
}

#[test]
fn test_keys_are_independent() {
    let (_, clock) = manual_clock();
    let limiter = RateLimiter::with_clock(1, RATE_WINDOW_MS, clock);
    assert!(limiter.check("a"));
    assert!(limiter.check("b"));
    assert!(!limiter.check("a"));
    assert_eq!(limiter.remaining("c"), 1);
}

// =============================================================================
// TEST GROUP 2: Gate ordering
// =============================================================================

#[test]
fn test_open_gate_allows_everything() {
    let gate = HandlerSecurity::new();
    assert!(gate.is_open());
    assert!(gate.check("h", "anyone", &json!(null)).is_ok());
}

#[test]
fn test_unauthorized_peer() {
    let gate = HandlerSecurity::new().with_allowed_peers(["admin"]);
    assert!(gate.check("h", "admin", &json!(null)).is_ok());

    let err = gate.check("h", "intruder", &json!(null)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unauthorized);
    assert_eq!(err.details().get("peer_id"), Some(&json!("intruder")));
}

#[test]
fn test_rate_limit_two_of_three() {
    let gate = HandlerSecurity::new().with_rate_limit(2);
    assert!(gate.check("x", "peer", &json!(null)).is_ok());
    assert!(gate.check("x", "peer", &json!(null)).is_ok());
    assert_eq!(
        gate.check("x", "peer", &json!(null)).unwrap_err().kind(),
        ErrorKind::RateLimited
    );
    assert!(gate.check("x", "other", &json!(null)).is_ok());
}

#[test]
fn test_validator_false_and_error_both_reject() {
    let gate = HandlerSecurity::new().with_validator(Arc::new(|payload: &Value| {
        if payload.is_string() {
            anyhow::bail!("strings are not accepted");
        }
        Ok(payload.get("n").is_some_and(Value::is_number))
    }));

    assert!(gate.check("h", "p", &json!({ "n": 1 })).is_ok());

    let err = gate.check("h", "p", &json!({ "n": "one" })).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidPayload);

    let err = gate.check("h", "p", &json!("raw")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidPayload);
    assert_eq!(err.details().get("reason"), Some(&json!("strings are not accepted")));
}

#[test]
fn test_authorization_checked_before_rate_limit() {
    let (_, clock) = manual_clock();
    let gate = HandlerSecurity::new()
        .with_allowed_peers(["friend"])
        .with_limiter(RateLimiter::with_clock(1, RATE_WINDOW_MS, clock));

    // Rejected callers do not consume the budget.
    assert_eq!(
        gate.check("h", "stranger", &json!(null)).unwrap_err().kind(),
        ErrorKind::Unauthorized
    );
    assert!(gate.check("h", "friend", &json!(null)).is_ok());
    assert_eq!(
        gate.check("h", "friend", &json!(null)).unwrap_err().kind(),
        ErrorKind::RateLimited
    );
}

#[test]
fn test_rate_limit_checked_before_validation() {
    let gate = HandlerSecurity::new()
        .with_rate_limit(1)
        .with_validator(Arc::new(|_: &Value| Ok::<bool, anyhow::Error>(false)));

    assert_eq!(
        gate.check("h", "p", &json!(null)).unwrap_err().kind(),
        ErrorKind::InvalidPayload
    );
    assert_eq!(
        gate.check("h", "p", &json!(null)).unwrap_err().kind(),
        ErrorKind::RateLimited
    );
}
