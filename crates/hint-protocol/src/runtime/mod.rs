/// Telemetry runtime. Wires the session, the peer lock and both delivery
/// channels into one running service.
///
/// The runtime locks to the configured collector peer, runs the batch and
/// stream submitters under a [`ChannelSupervisor`] (itself kept alive by a
/// [`SupervisedTask`]) and hands the application a cloneable
/// [`RuntimeHandle`].
mod r#loop;

pub use r#loop::ChannelSupervisor;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use hint_metrics::ChannelSnapshot;
use hint_transport::{BareJid, FullJid, PresenceDirectory, Sender, SessionEvents};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::backoff::BackoffConfig;
use crate::channel::{BatchChannel, DeliveryChannel, RangeKey, StreamChannel, Submitter};
use crate::error::HintProtocolError;
use crate::peer_lock::{LockChange, PeerHandle, PeerLock};
use crate::queue::DropReason;
use crate::sample::{SampleBatch, StreamBlock};
use crate::supervisor::SupervisedTask;

// ── Configuration ─────────────────────────────────────────────────────

/// Configuration for the telemetry runtime.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Collector identity to lock to.
    pub peer: BareJid,
    /// Module name the batches are grouped under.
    pub module_name: String,
    pub batch_queue_size: usize,
    pub stream_queue_size: usize,
    /// Delay before a transiently failed item is retried.
    pub resubmit_delay: Duration,
    /// Pause after every delivery worker run.
    pub worker_pause: Duration,
    /// Stream range per (part, subpart); overrides the block's own range.
    pub stream_ranges: HashMap<RangeKey, f64>,
    /// Restart backoff of the channel supervisor.
    pub supervisor_backoff: BackoffConfig,
}

impl RuntimeConfig {
    pub fn new(peer: BareJid, module_name: &str) -> Self {
        Self {
            peer,
            module_name: module_name.to_string(),
            batch_queue_size: 16,
            stream_queue_size: 16,
            resubmit_delay: Duration::from_secs(1),
            worker_pause: Duration::from_secs(1),
            stream_ranges: HashMap::new(),
            supervisor_backoff: BackoffConfig::default(),
        }
    }
}

// ── Delivery workers ──────────────────────────────────────────────────

/// One delivery channel as seen by the [`ChannelSupervisor`].
///
/// A run delivers to `dest` until it has to give up; an item returned from
/// the run is held for [`resume_delay`](Self::resume_delay) and then seeds
/// the next run. Runs are cancelled by dropping them.
#[async_trait::async_trait]
pub trait DeliveryWorker: Send + Sync + 'static {
    type Item: Send + 'static;

    fn name(&self) -> &str;

    async fn run(&self, dest: FullJid, resume: Option<Self::Item>) -> anyhow::Result<Option<Self::Item>>;

    /// How long a returned item is held before the next run.
    fn resume_delay(&self) -> Duration {
        Duration::ZERO
    }

    /// Dispose of an item that will never be resumed.
    fn discard(&self, _item: Self::Item) {}
}

// ── Handle ────────────────────────────────────────────────────────────

/// Delivery statistics of both channels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RuntimeStats {
    pub batches: ChannelSnapshot,
    pub stream: ChannelSnapshot,
}

struct RuntimeInner {
    peer: PeerHandle,
    lock: Arc<PeerLock>,
    batches: Arc<BatchChannel>,
    stream: Arc<StreamChannel>,
    channels: Arc<ChannelSupervisor>,
    supervisor: SupervisedTask,
    cancel: CancellationToken,
    lock_task: Mutex<Option<JoinHandle<()>>>,
}

/// Application side of a running [`TelemetryRuntime`]. Cheap to clone.
#[derive(Clone)]
pub struct RuntimeHandle {
    inner: Arc<RuntimeInner>,
}

impl RuntimeHandle {
    /// Queue one batch. Never waits; the oldest queued group may be dropped.
    pub fn enqueue_batch(&self, batch: SampleBatch) {
        self.inner.batches.enqueue_batch(batch);
    }

    /// Queue batches to be sent in one request.
    pub fn enqueue_batches(&self, batches: Vec<SampleBatch>) {
        self.inner.batches.enqueue_batches(batches);
    }

    /// Hand a stream block to the compressor. Never waits.
    pub fn submit_block(&self, block: StreamBlock) -> Result<(), HintProtocolError> {
        self.inner.stream.submit_block(block)
    }

    pub fn batches(&self) -> &Arc<BatchChannel> {
        &self.inner.batches
    }

    pub fn stream(&self) -> &Arc<StreamChannel> {
        &self.inner.stream
    }

    /// Lock state of the collector peer.
    pub fn peer(&self) -> &PeerHandle {
        &self.inner.peer
    }

    pub fn lock_changes(&self) -> broadcast::Receiver<LockChange> {
        self.inner.lock.subscribe_changes()
    }

    pub fn stats(&self) -> RuntimeStats {
        RuntimeStats {
            batches: self.inner.batches.stats(),
            stream: self.inner.stream.stats(),
        }
    }

    /// Stop all delivery and release every item still held.
    pub async fn shutdown(&self) {
        self.inner.supervisor.await_termination().await;
        self.inner.cancel.cancel();
        self.inner.stream.shutdown().await;

        let resumed = self.inner.channels.discard_pending();
        let queued = self.inner.batches.core().queue().clear(DropReason::Shutdown);
        tracing::debug!(resumed, queued, "telemetry runtime shut down");

        let lock_task = self.inner.lock_task.lock().take();
        if let Some(task) = lock_task {
            let _ = task.await;
        }
    }
}

// ── TelemetryRuntime ──────────────────────────────────────────────────

/// The telemetry runtime. Spawn it and talk to it through the handle.
pub struct TelemetryRuntime;

impl TelemetryRuntime {
    /// Start delivering to `config.peer` over `session`.
    pub fn spawn<S>(session: Arc<S>, config: RuntimeConfig) -> RuntimeHandle
    where
        S: Sender + SessionEvents + PresenceDirectory + 'static,
    {
        let cancel = CancellationToken::new();

        let lock = Arc::new(PeerLock::new(session.clone()));
        let peer = lock.register(config.peer.clone());
        let lock_task = lock.spawn(session.as_ref(), cancel.clone());

        let batches = Arc::new(BatchChannel::new(&config.module_name, config.batch_queue_size));
        batches.set_resubmit_delay(config.resubmit_delay);
        let stream = Arc::new(StreamChannel::spawn(
            config.stream_queue_size,
            config.stream_ranges.clone(),
            cancel.child_token(),
        ));
        stream.set_resubmit_delay(config.resubmit_delay);

        let mut channels = ChannelSupervisor::new(peer.clone(), config.worker_pause);
        channels.add_worker(Arc::new(Submitter::new(batches.clone(), session.clone())));
        channels.add_worker(Arc::new(Submitter::new(stream.clone(), session)));
        let channels = Arc::new(channels);

        let supervisor = SupervisedTask::new("channel-supervisor", config.supervisor_backoff, {
            let channels = channels.clone();
            move |cancel: CancellationToken| {
                let channels = channels.clone();
                async move {
                    channels.run(cancel).await;
                    anyhow::Ok(())
                }
            }
        });
        supervisor.start();
        tracing::info!(peer = %config.peer, module = %config.module_name, "telemetry runtime started");

        RuntimeHandle {
            inner: Arc::new(RuntimeInner {
                peer,
                lock,
                batches,
                stream,
                channels,
                supervisor,
                cancel,
                lock_task: Mutex::new(Some(lock_task)),
            }),
        }
    }
}
