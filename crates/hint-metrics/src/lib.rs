//! Delivery counters for the hint telemetry stack.
//!
//! [`ChannelMetrics`] holds one relaxed atomic per delivery outcome and
//! can be shared between the producer side (enqueue, drop) and the
//! delivery worker (sent, resubmitted, failed). [`ChannelSnapshot`] is the
//! plain, serialisable view of it.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Monotonic counter. Relaxed ordering: values are statistics only.
#[derive(Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.add(1);
    }

    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn value(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value())
    }
}

/// Outcome counters of one delivery channel.
#[derive(Debug, Default)]
pub struct ChannelMetrics {
    /// Items accepted by the channel.
    pub enqueued: Counter,
    /// Items evicted by drop-oldest backpressure or a queue shrink.
    pub dropped: Counter,
    /// Items acknowledged by the peer.
    pub sent: Counter,
    /// Transient send failures that put the item back in front.
    pub resubmitted: Counter,
    /// Items discarded after a fatal send or a preprocessing failure.
    pub failed: Counter,
}

impl ChannelMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy the current values.
    pub fn snapshot(&self) -> ChannelSnapshot {
        ChannelSnapshot {
            enqueued: self.enqueued.value(),
            dropped: self.dropped.value(),
            sent: self.sent.value(),
            resubmitted: self.resubmitted.value(),
            failed: self.failed.value(),
        }
    }
}

/// Point-in-time copy of [`ChannelMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSnapshot {
    pub enqueued: u64,
    pub dropped: u64,
    pub sent: u64,
    pub resubmitted: u64,
    pub failed: u64,
}

impl ChannelSnapshot {
    /// Items neither delivered nor discarded yet.
    pub fn in_flight(&self) -> u64 {
        self.enqueued
            .saturating_sub(self.dropped)
            .saturating_sub(self.sent)
            .saturating_sub(self.failed)
    }
}
