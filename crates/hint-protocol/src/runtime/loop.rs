/// Channel supervisor control loop.
///
/// Keeps one run per delivery worker going while the target peer is locked.
/// Each pass of the loop clears the lock-changed signal, starts a run for
/// every worker without one (seeded with what its previous run returned)
/// and then waits for either a run to finish or the lock to change. Runs
/// are not interrupted by a lock change: a run bound to a stale address
/// fails transiently and is restarted with the new one.
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use hint_transport::FullJid;
use parking_lot::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::DeliveryWorker;
use crate::peer_lock::PeerHandle;

/// Type-erased worker plus the item its last run handed back.
trait WorkerSlot: Send + Sync {
    fn name(&self) -> &str;
    fn has_resume(&self) -> bool;
    /// One wrapped run: a returned item is held for the worker's resume
    /// delay, every run is followed by `pause`, failures are logged and
    /// cancellation ends it at once.
    fn launch(&self, dest: FullJid, pause: Duration, cancel: CancellationToken) -> BoxFuture<'static, ()>;
    fn discard_resume(&self) -> bool;
}

struct Slot<W: DeliveryWorker> {
    worker: Arc<W>,
    resume: Arc<Mutex<Option<W::Item>>>,
}

impl<W: DeliveryWorker> WorkerSlot for Slot<W> {
    fn name(&self) -> &str {
        self.worker.name()
    }

    fn has_resume(&self) -> bool {
        self.resume.lock().is_some()
    }

    fn launch(&self, dest: FullJid, pause: Duration, cancel: CancellationToken) -> BoxFuture<'static, ()> {
        let worker = self.worker.clone();
        let resume = self.resume.clone();
        async move {
            let name = worker.name().to_string();
            let seed = resume.lock().take();
            let mut run = tokio::spawn({
                let worker = worker.clone();
                async move { worker.run(dest, seed).await }
            });

            let joined = tokio::select! {
                _ = cancel.cancelled() => {
                    run.abort();
                    // The run may have finished before the abort landed.
                    if let Ok(Ok(item)) = run.await {
                        *resume.lock() = item;
                    }
                    return;
                }
                joined = &mut run => joined,
            };
            let mut hold = Duration::ZERO;
            match joined {
                Ok(Ok(item)) => {
                    if item.is_some() {
                        hold = worker.resume_delay();
                    }
                    // Stored before waiting so teardown can discard it.
                    *resume.lock() = item;
                }
                Ok(Err(err)) => {
                    tracing::warn!(worker = %name, error = %format!("{err:#}"), "delivery worker failed");
                }
                Err(err) => {
                    tracing::error!(worker = %name, error = %err, "delivery worker crashed");
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(hold + pause) => {}
            }
        }
        .boxed()
    }

    fn discard_resume(&self) -> bool {
        let item = self.resume.lock().take();
        match item {
            Some(item) => {
                self.worker.discard(item);
                true
            }
            None => false,
        }
    }
}

pub struct ChannelSupervisor {
    target: PeerHandle,
    pause: Duration,
    slots: Vec<Arc<dyn WorkerSlot>>,
}

impl ChannelSupervisor {
    /// Supervise workers delivering to `target`; every run is followed by
    /// `pause`.
    pub fn new(target: PeerHandle, pause: Duration) -> Self {
        Self {
            target,
            pause,
            slots: Vec::new(),
        }
    }

    pub fn add_worker<W: DeliveryWorker>(&mut self, worker: Arc<W>) {
        self.slots.push(Arc::new(Slot {
            worker,
            resume: Arc::new(Mutex::new(None)),
        }));
    }

    pub fn target(&self) -> &PeerHandle {
        &self.target
    }

    pub fn worker_count(&self) -> usize {
        self.slots.len()
    }

    /// Drive the workers until `cancel` fires, then cancel every run and
    /// wait for all of them to finish.
    pub async fn run(&self, cancel: CancellationToken) {
        let runs_cancel = cancel.child_token();
        let mut lock_rx = self.target.watch();
        let mut runs: JoinSet<usize> = JoinSet::new();
        let mut active = vec![false; self.slots.len()];

        loop {
            let locked = lock_rx.borrow_and_update().clone();
            if let Some(dest) = locked {
                for (idx, slot) in self.slots.iter().enumerate() {
                    if active[idx] {
                        continue;
                    }
                    tracing::debug!(worker = %slot.name(), to = %dest, resuming = slot.has_resume(), "starting delivery worker");
                    let run = slot.launch(dest.clone(), self.pause, runs_cancel.clone());
                    runs.spawn(async move {
                        run.await;
                        idx
                    });
                    active[idx] = true;
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                changed = lock_rx.changed() => {
                    if changed.is_err() {
                        tracing::debug!("peer lock gone, stopping delivery workers");
                        break;
                    }
                }
                Some(joined) = runs.join_next(), if !runs.is_empty() => match joined {
                    Ok(idx) => active[idx] = false,
                    Err(err) => tracing::error!(error = %err, "delivery run wrapper failed"),
                },
            }
        }

        runs_cancel.cancel();
        while runs.join_next().await.is_some() {}
    }

    /// Discard the items held back for resumption. Returns how many there
    /// were.
    pub fn discard_pending(&self) -> usize {
        self.slots.iter().filter(|slot| slot.discard_resume()).count()
    }
}
