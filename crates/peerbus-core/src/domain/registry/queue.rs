//! Per-peer offline queue.

use peerbus_types::Envelope;
use std::collections::VecDeque;

/// Envelope waiting for its peer to come back.
#[derive(Debug, Clone)]
pub(crate) struct QueuedEnvelope {
    pub(crate) envelope: Envelope,
    /// Take the link's next sequence number when finally sent.
    pub(crate) stamp: bool,
    pub(crate) attempts: u32,
}

/// What happened to a pushed envelope.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum PushOutcome {
    Queued,
    /// Queued after evicting the oldest entry.
    Evicted(Envelope),
    /// Queue disabled (zero capacity).
    Rejected,
}

/// Bounded FIFO. Pushing into a full queue drops the oldest entry.
#[derive(Debug, Clone)]
pub(crate) struct OfflineQueue {
    entries: VecDeque<QueuedEnvelope>,
    capacity: usize,
    max_attempts: u32,
}

impl OfflineQueue {
    pub(crate) fn new(capacity: usize, max_attempts: u32) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity,
            max_attempts: max_attempts.max(1),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub(crate) fn push(&mut self, envelope: Envelope, stamp: bool) -> PushOutcome {
        if self.capacity == 0 {
            return PushOutcome::Rejected;
        }
        let evicted = if self.entries.len() >= self.capacity {
            self.entries.pop_front()
        } else {
            None
        };
        self.entries.push_back(QueuedEnvelope {
            envelope,
            stamp,
            attempts: 0,
        });
        match evicted {
            Some(oldest) => PushOutcome::Evicted(oldest.envelope),
            None => PushOutcome::Queued,
        }
    }

    pub(crate) fn take_all(&mut self) -> Vec<QueuedEnvelope> {
        self.entries.drain(..).collect()
    }

    /// Put undelivered entries back ahead of anything queued meanwhile.
    pub(crate) fn restore_front(&mut self, entries: Vec<QueuedEnvelope>) {
        for entry in entries.into_iter().rev() {
            self.entries.push_front(entry);
        }
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
    }

    pub(crate) fn clear(&mut self) -> usize {
        let dropped = self.entries.len();
        self.entries.clear();
        dropped
    }
}
