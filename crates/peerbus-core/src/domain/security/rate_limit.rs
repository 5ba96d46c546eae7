//! Fixed-window rate limiter.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;

/// Width of one rate-limit window.
pub const RATE_WINDOW_MS: u64 = 1_000;

/// Records above this count trigger a sweep of expired windows.
const SWEEP_THRESHOLD: usize = 1_024;

/// Counts calls per key inside a fixed window.
pub struct RateLimiter {
    /// key -> (count, window_start_ms)
    records: Mutex<HashMap<String, (u32, u64)>>,
    limit: u32,
    window_ms: u64,
    clock: Box<dyn Fn() -> u64 + Send + Sync>,
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("limit", &self.limit)
            .field("window_ms", &self.window_ms)
            .field("keys", &self.records.lock().len())
            .field("clock", &"<closure>")
            .finish()
    }
}

impl RateLimiter {
    /// `limit` calls per second on the runtime clock.
    #[must_use]
    pub fn per_second(limit: u32) -> Self {
        let origin = tokio::time::Instant::now();
        Self::with_clock(limit, RATE_WINDOW_MS, move || {
            u64::try_from(origin.elapsed().as_millis()).unwrap_or(u64::MAX)
        })
    }

    /// Custom window and millisecond clock (for testing).
    pub fn with_clock<F>(limit: u32, window_ms: u64, clock: F) -> Self
    where
        F: Fn() -> u64 + Send + Sync + 'static,
    {
        Self {
            records: Mutex::new(HashMap::new()),
            limit,
            window_ms: window_ms.max(1),
            clock: Box::new(clock),
        }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Count one call for `key`; `false` once the window's budget is spent.
    pub fn check(&self, key: &str) -> bool {
        let now = (self.clock)();
        let mut records = self.records.lock();
        if records.len() > SWEEP_THRESHOLD {
            let window = self.window_ms;
            records.retain(|_, (_, start)| now.saturating_sub(*start) < window);
        }

        let record = records.entry(key.to_string()).or_insert((0, now));
        if now.saturating_sub(record.1) >= self.window_ms {
            *record = (0, now);
        }
        if record.0 >= self.limit {
            return false;
        }
        record.0 += 1;
        true
    }

    /// Calls left for `key` in the current window.
    pub fn remaining(&self, key: &str) -> u32 {
        let now = (self.clock)();
        match self.records.lock().get(key) {
            Some((count, start)) if now.saturating_sub(*start) < self.window_ms => {
                self.limit.saturating_sub(*count)
            }
            _ => self.limit,
        }
    }
}
