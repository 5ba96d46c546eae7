//! Causal delivery buffer.

use super::vector::VectorClock;
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, warn};

/// Messages evicted because the buffer hit its ceiling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CausalOverflow {
    /// `(sender, sequence)` of each evicted message, oldest first.
    pub evicted: Vec<(String, u64)>,
    pub capacity: usize,
}

/// Result of one [`CausalOrderer::receive`].
#[derive(Debug)]
pub struct CausalDelivery<T> {
    /// Messages now deliverable, in delivery order.
    pub delivered: Vec<T>,
    pub overflow: Option<CausalOverflow>,
}

impl<T> CausalDelivery<T> {
    fn empty() -> Self {
        Self {
            delivered: Vec::new(),
            overflow: None,
        }
    }
}

/// Callback fired whenever messages are evicted.
pub type OverflowHandler = Box<dyn Fn(&CausalOverflow) + Send + Sync>;

struct Buffered<T> {
    sender: String,
    clock: VectorClock,
    message: T,
    arrival: u64,
}

impl<T> Buffered<T> {
    fn seq(&self) -> u64 {
        self.clock.get(&self.sender)
    }
}

/// Holds back messages until every earlier message from the same sender has
/// been delivered.
///
/// The buffer never exceeds `capacity`; on overflow the oldest arrivals are
/// evicted and reported.
pub struct CausalOrderer<T> {
    local: VectorClock,
    buffer: Vec<Buffered<T>>,
    capacity: usize,
    arrivals: u64,
    on_overflow: Option<OverflowHandler>,
}

impl<T> CausalOrderer<T> {
    #[must_use]
    pub fn new(owner: impl Into<String>, capacity: usize) -> Self {
        Self {
            local: VectorClock::new(owner),
            buffer: Vec::new(),
            capacity: capacity.max(1),
            arrivals: 0,
            on_overflow: None,
        }
    }

    /// Install the overflow callback.
    pub fn set_overflow_handler<F>(&mut self, handler: F)
    where
        F: Fn(&CausalOverflow) + Send + Sync + 'static,
    {
        self.on_overflow = Some(Box::new(handler));
    }

    /// Clock of everything delivered so far.
    pub fn local_clock(&self) -> &VectorClock {
        &self.local
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn buffered_for(&self, sender: &str) -> usize {
        self.buffer.iter().filter(|b| b.sender == sender).count()
    }

    /// Offer a message stamped with `clock` from `sender`.
    ///
    /// A clock without a component for `sender` bypasses ordering. Stale or
    /// duplicate sequences are dropped.
    pub fn receive(&mut self, sender: &str, clock: VectorClock, message: T) -> CausalDelivery<T> {
        let seq = clock.get(sender);
        if seq == 0 {
            return CausalDelivery {
                delivered: vec![message],
                overflow: None,
            };
        }
        if seq <= self.local.get(sender) {
            debug!(sender, seq, "Dropping already-delivered causal message");
            return CausalDelivery::empty();
        }
        if self.buffer.iter().any(|b| b.sender == sender && b.seq() == seq) {
            debug!(sender, seq, "Dropping duplicate buffered causal message");
            return CausalDelivery::empty();
        }

        if self.local.can_deliver(&clock, sender) {
            self.local.update(&clock);
            let mut delivered = vec![message];
            self.drain_ready(&mut delivered);
            return CausalDelivery {
                delivered,
                overflow: None,
            };
        }

        self.arrivals += 1;
        self.buffer.push(Buffered {
            sender: sender.to_string(),
            clock,
            message,
            arrival: self.arrivals,
        });
        debug!(sender, seq, buffered = self.buffer.len(), "Buffered out-of-order message");

        CausalDelivery {
            delivered: Vec::new(),
            overflow: self.enforce_capacity(),
        }
    }

    /// Deliver a sender's buffered messages in sequence order regardless of
    /// gaps, advancing the local clock past them.
    pub fn flush(&mut self, sender: &str) -> Vec<T> {
        let (mut flushed, kept): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.buffer).into_iter().partition(|b| b.sender == sender);
        self.buffer = kept;
        flushed.sort_by_key(Buffered::seq);
        if let Some(last) = flushed.last() {
            self.local.update(&last.clock);
        }
        flushed.into_iter().map(|b| b.message).collect()
    }

    /// Drop everything known about `sender`.
    pub fn forget(&mut self, sender: &str) {
        self.buffer.retain(|b| b.sender != sender);
        self.local.reset(sender);
    }

    /// Repeatedly release buffered messages unblocked by the last delivery.
    fn drain_ready(&mut self, delivered: &mut Vec<T>) {
        while let Some(pos) = self
            .buffer
            .iter()
            .position(|b| self.local.can_deliver(&b.clock, &b.sender))
        {
            let ready = self.buffer.remove(pos);
            self.local.update(&ready.clock);
            delivered.push(ready.message);
        }
    }

    fn enforce_capacity(&mut self) -> Option<CausalOverflow> {
        if self.buffer.len() <= self.capacity {
            return None;
        }

        self.buffer.sort_by_key(|b| b.arrival);
        let excess = self.buffer.len() - self.capacity;
        let evicted: Vec<(String, u64)> = self
            .buffer
            .drain(..excess)
            .map(|b| {
                let seq = b.seq();
                (b.sender, seq)
            })
            .collect();

        let overflow = CausalOverflow {
            evicted,
            capacity: self.capacity,
        };
        warn!(
            evicted = overflow.evicted.len(),
            capacity = self.capacity,
            "Causal buffer overflow"
        );
        if let Some(handler) = &self.on_overflow {
            handler(&overflow);
        }
        Some(overflow)
    }
}

impl<T> fmt::Debug for CausalOrderer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CausalOrderer")
            .field("local", &self.local)
            .field("buffered", &self.buffer.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}
