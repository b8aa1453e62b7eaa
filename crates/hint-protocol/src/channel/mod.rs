/// Delivery channels: batch and stream submitters sharing one send loop.
///
/// A channel owns a [`DeliveryQueue`] and knows how to turn a queued item
/// into a wire [`Query`]. [`Submitter`] drives any channel: it takes items
/// off the queue, sends them to the locked peer address and classifies the
/// outcome:
///
/// - accepted: counted as sent, the channel gets the item back to release it;
/// - transient failure: the run ends at once and hands the item back; the
///   supervisor holds it through the resubmit delay and the next run sends
///   it first, ahead of anything queued;
/// - fatal failure: the item is discarded and its resources released.
mod batch;
mod stream;

pub use batch::BatchChannel;
pub use stream::{period_micros, RangeKey, StreamChannel, DEFAULT_RANGE, SAMPLE_TYPE_I16};

use std::sync::Arc;
use std::time::Duration;

use hint_metrics::{ChannelMetrics, ChannelSnapshot};
use hint_transport::{FullJid, Query, Sender};
use parking_lot::Mutex;

use crate::queue::{DeliveryQueue, DropHook};
use crate::runtime::DeliveryWorker;

/// Default delay before a transiently failed item is retried.
pub const DEFAULT_RESUBMIT_DELAY: Duration = Duration::from_secs(1);

// ── Shared channel state ──────────────────────────────────────────────

/// Queue, counters and retry policy of one channel.
pub struct ChannelCore<T> {
    name: Arc<str>,
    queue: Arc<DeliveryQueue<T>>,
    metrics: Arc<ChannelMetrics>,
    resubmit_delay: Mutex<Duration>,
}

impl<T: Send> ChannelCore<T> {
    pub fn new(name: &str, queue_size: usize, on_drop: DropHook<T>) -> Self {
        let metrics = Arc::new(ChannelMetrics::new());
        let queue = DeliveryQueue::new(name, queue_size, on_drop).with_metrics(metrics.clone());
        Self {
            name: Arc::from(name),
            queue: Arc::new(queue),
            metrics,
            resubmit_delay: Mutex::new(DEFAULT_RESUBMIT_DELAY),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn queue(&self) -> &Arc<DeliveryQueue<T>> {
        &self.queue
    }

    pub fn metrics(&self) -> &Arc<ChannelMetrics> {
        &self.metrics
    }

    pub fn resubmit_delay(&self) -> Duration {
        *self.resubmit_delay.lock()
    }

    pub fn set_resubmit_delay(&self, delay: Duration) {
        *self.resubmit_delay.lock() = delay;
    }
}

// ── Channel interface ─────────────────────────────────────────────────

/// What differs between channels: the item type, its wire form and what
/// happens to an item once it has left the channel.
pub trait DeliveryChannel: Send + Sync + 'static {
    type Item: Send + 'static;

    fn core(&self) -> &ChannelCore<Self::Item>;

    /// Wire form of `item`.
    fn compose_payload(&self, item: &Self::Item) -> Query;

    /// The peer accepted `item`.
    fn on_delivered(&self, _item: Self::Item) {}

    /// `item` will never be delivered (fatal failure or shutdown).
    fn on_failed(&self, _item: Self::Item) {}

    fn name(&self) -> &str {
        self.core().name()
    }

    /// Current queue capacity.
    fn queue_size(&self) -> usize {
        self.core().queue().capacity()
    }

    /// Resize the queue; the oldest items beyond the new size are dropped.
    fn set_queue_size(&self, size: usize) {
        self.core().queue().set_capacity(size);
    }

    fn resubmit_delay(&self) -> Duration {
        self.core().resubmit_delay()
    }

    fn set_resubmit_delay(&self, delay: Duration) {
        self.core().set_resubmit_delay(delay);
    }

    fn stats(&self) -> ChannelSnapshot {
        self.core().metrics().snapshot()
    }
}

// ── Send loop ─────────────────────────────────────────────────────────

/// Sends the items of one channel through a [`Sender`].
pub struct Submitter<C: DeliveryChannel> {
    channel: Arc<C>,
    sender: Arc<dyn Sender>,
}

impl<C: DeliveryChannel> Submitter<C> {
    pub fn new(channel: Arc<C>, sender: Arc<dyn Sender>) -> Self {
        Self { channel, sender }
    }

    pub fn channel(&self) -> &Arc<C> {
        &self.channel
    }

    /// Send items to `dest` until one fails transiently; that item is
    /// returned. `resume` is sent first.
    pub async fn submit_until_failure(&self, dest: &FullJid, mut resume: Option<C::Item>) -> Option<C::Item> {
        let core = self.channel.core();
        loop {
            let item = match resume.take() {
                Some(item) => item,
                None => core.queue().dequeue().await,
            };

            let payload = self.channel.compose_payload(&item);
            tracing::debug!(channel = %core.name(), to = %dest, "submitting item");
            match self.sender.send_request(dest, &payload).await {
                Ok(()) => {
                    core.metrics().sent.inc();
                    self.channel.on_delivered(item);
                }
                Err(err) if err.is_transient() => {
                    core.metrics().resubmitted.inc();
                    tracing::debug!(channel = %core.name(), to = %dest, error = %err, "send failed, resubmitting");
                    return Some(item);
                }
                Err(err) => {
                    core.metrics().failed.inc();
                    tracing::warn!(channel = %core.name(), to = %dest, error = %err, "send failed, discarding item");
                    self.channel.on_failed(item);
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl<C: DeliveryChannel> DeliveryWorker for Submitter<C> {
    type Item = C::Item;

    fn name(&self) -> &str {
        self.channel.name()
    }

    async fn run(&self, dest: FullJid, resume: Option<C::Item>) -> anyhow::Result<Option<C::Item>> {
        Ok(self.submit_until_failure(&dest, resume).await)
    }

    fn resume_delay(&self) -> Duration {
        self.channel.resubmit_delay()
    }

    fn discard(&self, item: C::Item) {
        self.channel.on_failed(item);
    }
}
