//! Hint telemetry resilience core.
//!
//! Keeps telemetry flowing to a remote collector that comes and goes, and
//! shields quota-limited upstream APIs from being hammered after failures.
//!
//! Building blocks, leaf first:
//! - [`ExponentialBackoff`]: capped exponential retry delays.
//! - [`SupervisedTask`]: restarts a worker after crashes, with backoff.
//! - [`RequestCache`]: per-parameter cache behind one shared backoff window.
//! - [`PeerLock`]: which concrete address of a peer is reachable right now.
//! - [`DeliveryQueue`]: bounded drop-oldest FIFO.
//! - [`CompressionStage`]: compresses stream blocks off the scheduler.
//! - [`ChannelSupervisor`]: (re)starts delivery workers while the peer is locked.
//!
//! [`TelemetryRuntime`] wires all of it to a session.

pub mod backoff;
pub mod buddies;
pub mod cache;
pub mod channel;
pub mod compression;
pub mod error;
pub mod peer_lock;
pub mod queue;
pub mod runtime;
pub mod sample;
pub mod supervisor;

pub use backoff::{BackoffConfig, ExponentialBackoff};
pub use buddies::Buddies;
pub use cache::{CacheEntry, RequestBackend, RequestCache, RequestCacheConfig, RequestParams};
pub use channel::{BatchChannel, ChannelCore, DeliveryChannel, StreamChannel, Submitter};
pub use compression::{CompressedBlock, CompressionStage};
pub use error::{CacheError, HintProtocolError, RequestError};
pub use peer_lock::{LockChange, PeerHandle, PeerLock};
pub use queue::{DeliveryQueue, DropHook, DropReason};
pub use runtime::{
    ChannelSupervisor, DeliveryWorker, RuntimeConfig, RuntimeHandle, RuntimeStats, TelemetryRuntime,
};
pub use sample::{InvalidSensorPath, Part, ResourceHandle, Sample, SampleBatch, SensorPath, StreamBlock};
pub use supervisor::SupervisedTask;
