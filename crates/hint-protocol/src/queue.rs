/// Bounded delivery queue with drop-oldest backpressure.
///
/// `enqueue` never blocks and never fails: when the queue is full the oldest
/// item is evicted through the drop hook and the new one is appended.
/// `dequeue` suspends until an item is available. Items are handed out in
/// FIFO order; the queue never looks inside them.
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use hint_metrics::ChannelMetrics;
use parking_lot::Mutex;
use tokio::sync::Notify;

/// Why an item left the queue without being delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Evicted to make room for a newer item.
    Overflow,
    /// Evicted because the capacity was reduced.
    Shrink,
    /// Discarded when the channel shut down.
    Shutdown,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DropReason::Overflow => write!(f, "overflow"),
            DropReason::Shrink => write!(f, "shrink"),
            DropReason::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// Called exactly once for every item the queue discards.
pub type DropHook<T> = Arc<dyn Fn(T, DropReason) + Send + Sync>;

struct Inner<T> {
    items: VecDeque<T>,
    capacity: usize,
}

pub struct DeliveryQueue<T> {
    name: Arc<str>,
    inner: Mutex<Inner<T>>,
    notify: Notify,
    on_drop: DropHook<T>,
    metrics: Option<Arc<ChannelMetrics>>,
}

impl<T: Send> DeliveryQueue<T> {
    /// A queue holding at most `capacity` items (at least one).
    pub fn new(name: &str, capacity: usize, on_drop: DropHook<T>) -> Self {
        Self {
            name: Arc::from(name),
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity.max(1)),
                capacity: capacity.max(1),
            }),
            notify: Notify::new(),
            on_drop,
            metrics: None,
        }
    }

    /// Count enqueues and drops into `metrics`.
    pub fn with_metrics(mut self, metrics: Arc<ChannelMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Append `item`, evicting the oldest item if the queue is full.
    pub fn enqueue(&self, item: T) {
        let evicted = {
            let mut inner = self.inner.lock();
            let evicted = if inner.items.len() >= inner.capacity {
                inner.items.pop_front()
            } else {
                None
            };
            inner.items.push_back(item);
            evicted
        };
        if let Some(metrics) = &self.metrics {
            metrics.enqueued.inc();
        }
        self.notify.notify_one();

        if let Some(old) = evicted {
            tracing::debug!(channel = %self.name, "queue full, dropping oldest item");
            self.discard(old, DropReason::Overflow);
        }
    }

    /// Wait for the next item.
    pub async fn dequeue(&self) -> T {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(item) = self.try_dequeue() {
                return item;
            }
            notified.await;
        }
    }

    pub fn try_dequeue(&self) -> Option<T> {
        self.inner.lock().items.pop_front()
    }

    /// Change the capacity (at least one). Retained items keep their order;
    /// the oldest items beyond the new capacity are dropped.
    pub fn set_capacity(&self, capacity: usize) {
        let excess: Vec<T> = {
            let mut inner = self.inner.lock();
            inner.capacity = capacity.max(1);
            let excess = inner.items.len().saturating_sub(inner.capacity);
            inner.items.drain(..excess).collect()
        };
        if !excess.is_empty() {
            tracing::debug!(
                channel = %self.name,
                capacity,
                dropped = excess.len(),
                "queue shrunk, dropping oldest items"
            );
        }
        for item in excess {
            self.discard(item, DropReason::Shrink);
        }
    }

    /// Drop every queued item through the drop hook.
    pub fn clear(&self, reason: DropReason) -> usize {
        let items: Vec<T> = self.inner.lock().items.drain(..).collect();
        let count = items.len();
        for item in items {
            self.discard(item, reason);
        }
        count
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().capacity
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().items.is_empty()
    }

    fn discard(&self, item: T, reason: DropReason) {
        if let Some(metrics) = &self.metrics {
            metrics.dropped.inc();
        }
        (self.on_drop)(item, reason);
    }
}
