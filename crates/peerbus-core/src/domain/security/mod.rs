//! # Handler Security Gate
//!
//! Checks run before every handler invocation, stopping at the first
//! failure:
//!
//! 1. Authorization: caller must be in `allowed_peers` when set (`UNAUTHORIZED`)
//! 2. Rate limiting: per caller, per handler, per second (`RATE_LIMITED`)
//! 3. Payload validation: validator must return `Ok(true)` (`INVALID_PAYLOAD`)

mod rate_limit;

pub use rate_limit::{RateLimiter, RATE_WINDOW_MS};

use peerbus_types::{BusError, ErrorKind};
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// Payload predicate. `Ok(false)` and `Err` both reject.
pub type PayloadValidator = Arc<dyn Fn(&Value) -> anyhow::Result<bool> + Send + Sync>;

/// Gate for one registered handler.
#[derive(Default)]
pub struct HandlerSecurity {
    allowed_peers: Option<HashSet<String>>,
    limiter: Option<RateLimiter>,
    validator: Option<PayloadValidator>,
}

impl HandlerSecurity {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_allowed_peers<I, S>(mut self, peers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_peers = Some(peers.into_iter().map(Into::into).collect());
        self
    }

    #[must_use]
    pub fn with_rate_limit(mut self, per_second: u32) -> Self {
        self.limiter = Some(RateLimiter::per_second(per_second));
        self
    }

    #[must_use]
    pub fn with_limiter(mut self, limiter: RateLimiter) -> Self {
        self.limiter = Some(limiter);
        self
    }

    #[must_use]
    pub fn with_validator(mut self, validator: PayloadValidator) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn is_open(&self) -> bool {
        self.allowed_peers.is_none() && self.limiter.is_none() && self.validator.is_none()
    }

    /// Run the three checks for a call from `peer_id`.
    ///
    /// # Errors
    ///
    /// `UNAUTHORIZED`, `RATE_LIMITED` or `INVALID_PAYLOAD`.
    pub fn check(&self, handler: &str, peer_id: &str, payload: &Value) -> Result<(), BusError> {
        if let Some(allowed) = &self.allowed_peers {
            if !allowed.contains(peer_id) {
                return Err(BusError::new(ErrorKind::Unauthorized)
                    .detail("handler", handler)
                    .detail("peer_id", peer_id));
            }
        }

        if let Some(limiter) = &self.limiter {
            if !limiter.check(peer_id) {
                return Err(BusError::new(ErrorKind::RateLimited)
                    .detail("handler", handler)
                    .detail("peer_id", peer_id)
                    .detail("limit", limiter.limit()));
            }
        }

        if let Some(validator) = &self.validator {
            let rejection = match validator(payload) {
                Ok(true) => None,
                Ok(false) => Some("validator rejected payload".to_string()),
                Err(e) => Some(e.to_string()),
            };
            if let Some(reason) = rejection {
                return Err(BusError::new(ErrorKind::InvalidPayload)
                    .detail("handler", handler)
                    .detail("reason", reason));
            }
        }

        Ok(())
    }
}

impl fmt::Debug for HandlerSecurity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerSecurity")
            .field("allowed_peers", &self.allowed_peers)
            .field("limiter", &self.limiter)
            .field("validator", &self.validator.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

#[cfg(test)]
mod tests;
