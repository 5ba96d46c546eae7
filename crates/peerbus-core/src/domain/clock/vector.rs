//! Vector clock.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Relation between two clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CausalOrder {
    Before,
    After,
    Equal,
    Concurrent,
}

/// Per-peer logical counters owned by one peer.
///
/// Unseen peers read as `0`. The owner's component only moves through
/// [`tick`](Self::tick); [`update`](Self::update) is a component-wise max.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorClock {
    owner: String,
    counters: BTreeMap<String, u64>,
}

impl VectorClock {
    #[must_use]
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            counters: BTreeMap::new(),
        }
    }

    /// Clock carrying a single component, as stamped on one link.
    #[must_use]
    pub fn single(peer: impl Into<String>, value: u64) -> Self {
        let peer = peer.into();
        let mut clock = Self::new(peer.clone());
        if value > 0 {
            clock.counters.insert(peer, value);
        }
        clock
    }

    #[must_use]
    pub fn from_counters(owner: impl Into<String>, counters: BTreeMap<String, u64>) -> Self {
        let mut counters = counters;
        counters.retain(|_, v| *v > 0);
        Self {
            owner: owner.into(),
            counters,
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn counters(&self) -> &BTreeMap<String, u64> {
        &self.counters
    }

    pub fn get(&self, peer: &str) -> u64 {
        self.counters.get(peer).copied().unwrap_or(0)
    }

    /// Advance the owner's component and return the new value.
    pub fn tick(&mut self) -> u64 {
        let counter = self.counters.entry(self.owner.clone()).or_insert(0);
        *counter += 1;
        *counter
    }

    /// Merge by component-wise maximum.
    pub fn update(&mut self, other: &VectorClock) {
        for (peer, &value) in &other.counters {
            let counter = self.counters.entry(peer.clone()).or_insert(0);
            *counter = (*counter).max(value);
        }
    }

    /// Merged copy; the result keeps `self`'s owner.
    #[must_use]
    pub fn merged(&self, other: &VectorClock) -> VectorClock {
        let mut clock = self.clone();
        clock.update(other);
        clock
    }

    /// Drop a peer's component.
    pub fn reset(&mut self, peer: &str) {
        self.counters.remove(peer);
    }

    pub fn compare(&self, other: &VectorClock) -> CausalOrder {
        let mut less = false;
        let mut greater = false;
        for peer in self.counters.keys().chain(other.counters.keys()) {
            match self.get(peer).cmp(&other.get(peer)) {
                Ordering::Less => less = true,
                Ordering::Greater => greater = true,
                Ordering::Equal => {}
            }
            if less && greater {
                return CausalOrder::Concurrent;
            }
        }
        match (less, greater) {
            (true, false) => CausalOrder::Before,
            (false, true) => CausalOrder::After,
            (false, false) => CausalOrder::Equal,
            (true, true) => CausalOrder::Concurrent,
        }
    }

    /// Every component `<=` and at least one `<`.
    pub fn happened_before(&self, other: &VectorClock) -> bool {
        self.compare(other) == CausalOrder::Before
    }

    /// Neither clock happened before the other. Equal clocks count as
    /// concurrent.
    pub fn is_concurrent_with(&self, other: &VectorClock) -> bool {
        matches!(
            self.compare(other),
            CausalOrder::Concurrent | CausalOrder::Equal
        )
    }

    /// Whether a message stamped `message` from `sender` is next in line:
    /// the recorded value for `sender` is exactly one below the message's.
    pub fn can_deliver(&self, message: &VectorClock, sender: &str) -> bool {
        let incoming = message.get(sender);
        incoming > 0 && self.get(sender) == incoming - 1
    }
}
