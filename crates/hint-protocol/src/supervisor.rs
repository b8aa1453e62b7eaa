//! Crash-resilient task supervisor.
//!
//! A [`SupervisedTask`] runs one asynchronous worker at a time and keeps it
//! running while the task is desired to run:
//!
//! - a crash (error or panic) restarts the worker after a delay drawn from an
//!   [`ExponentialBackoff`];
//! - cancellation through [`restart`](SupervisedTask::restart) restarts it at
//!   once;
//! - cancellation through [`stop`](SupervisedTask::stop) ends it for good;
//! - a normal return counts as a deliberate stop.
//!
//! Cancellation is cooperative: each run gets a [`CancellationToken`] and
//! must return promptly once it fires. Whatever a cancelled run returns is
//! treated as a clean exit. Worker failures never reach the caller; they
//! only show up as restart timing and in the log.

use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::backoff::{BackoffConfig, ExponentialBackoff};

type WorkerFactory =
    Arc<dyn Fn(CancellationToken) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

struct TaskState {
    desired_run: bool,
    backoff: ExponentialBackoff,
    /// Cancelled to interrupt the current run; replaced after each cancel.
    cancel: CancellationToken,
    driver_active: bool,
    driver: Option<JoinHandle<()>>,
}

pub struct SupervisedTask {
    name: Arc<str>,
    factory: WorkerFactory,
    state: Arc<Mutex<TaskState>>,
}

impl SupervisedTask {
    /// Wrap `worker`, called once per run. Nothing runs until
    /// [`start`](Self::start).
    pub fn new<F, Fut>(name: &str, backoff: BackoffConfig, worker: F) -> Self
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            name: Arc::from(name),
            factory: Arc::new(move |cancel| worker(cancel).boxed()),
            state: Arc::new(Mutex::new(TaskState {
                desired_run: false,
                backoff: ExponentialBackoff::new(backoff),
                cancel: CancellationToken::new(),
                driver_active: false,
                driver: None,
            })),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Mark as desired to run, reset the backoff and make sure a worker runs.
    pub fn start(&self) {
        let mut state = self.state.lock();
        state.desired_run = true;
        state.backoff.reset();
        if !state.driver_active {
            state.driver_active = true;
            state.driver = Some(tokio::spawn(drive(
                self.name.clone(),
                self.factory.clone(),
                self.state.clone(),
            )));
        }
    }

    /// Mark as not desired to run and cancel the current worker.
    pub fn stop(&self) {
        let mut state = self.state.lock();
        state.desired_run = false;
        let token = std::mem::take(&mut state.cancel);
        token.cancel();
    }

    /// Start if stopped; otherwise reset the backoff and restart the worker
    /// immediately, also cutting short a pending crash delay.
    pub fn restart(&self) {
        let mut state = self.state.lock();
        if !state.desired_run {
            drop(state);
            self.start();
            return;
        }
        state.backoff.reset();
        let token = std::mem::take(&mut state.cancel);
        token.cancel();
    }

    /// Stop and wait until the worker has fully exited.
    pub async fn await_termination(&self) {
        self.stop();
        let driver = self.state.lock().driver.take();
        if let Some(driver) = driver {
            // Worker failures were already handled by the driver.
            let _ = driver.await;
        }
    }

    pub fn desired_run(&self) -> bool {
        self.state.lock().desired_run
    }

    /// Whether a worker is running or scheduled to be restarted.
    pub fn is_running(&self) -> bool {
        self.state.lock().driver_active
    }
}

impl Drop for SupervisedTask {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Exit the driver unless the task is still desired to run.
fn should_exit(state: &Mutex<TaskState>) -> bool {
    let mut state = state.lock();
    if state.desired_run {
        false
    } else {
        state.driver_active = false;
        true
    }
}

async fn drive(name: Arc<str>, factory: WorkerFactory, state: Arc<Mutex<TaskState>>) {
    loop {
        if should_exit(&state) {
            tracing::debug!(task = %name, "supervised task stopped");
            return;
        }
        let token = state.lock().cancel.clone();

        let joined = tokio::spawn(factory(token.clone())).await;
        if token.is_cancelled() {
            tracing::debug!(task = %name, "worker cancelled");
            continue;
        }

        let failure = match joined {
            Ok(Ok(())) => {
                let mut state = state.lock();
                state.desired_run = false;
                state.driver_active = false;
                tracing::debug!(task = %name, "worker returned, not restarting");
                return;
            }
            Ok(Err(err)) => format!("{err:#}"),
            Err(join_err) if join_err.is_panic() => "worker panicked".to_string(),
            Err(join_err) => join_err.to_string(),
        };

        let delay = state.lock().backoff.next_delay();
        tracing::error!(task = %name, error = %failure, ?delay, "worker crashed, restarting after delay");
        tokio::select! {
            _ = token.cancelled() => {}
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
