/// Pipeline scenario: sensors produce while the collector flaps.
///
/// The producer enqueues one batch and submits one stream block per
/// tick. A flapper takes the collector offline and brings it back on a new
/// resource every `flap_ms`, and every `fail_every`-th tick scripts one
/// transient send failure. At the end the runtime is shut down and the
/// summary reports how many stream block handles were released.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use hint_protocol::{Part, RuntimeConfig, SampleBatch, SensorPath, StreamBlock, TelemetryRuntime};
use hint_transport::{BareJid, LoopbackSession, SendError};

use crate::events::{emit, EventChannels, EventPipelineSummary, EventPresence, EventStarted};

pub struct PipelineConfig {
    pub duration: Duration,
    pub tick: Duration,
    pub flap: Duration,
    pub fail_every: u32,
    pub queue_size: usize,
    pub block_samples: usize,
    pub report: Duration,
}

pub async fn run(config: PipelineConfig) -> anyhow::Result<()> {
    emit(&EventStarted::new("pipeline"));
    let start = Instant::now();

    let collector: BareJid = "collector@hint.local".parse()?;
    let session = LoopbackSession::new();
    session.set_available(collector.with_resource("sink-0")?);

    let mut runtime_config = RuntimeConfig::new(collector.clone(), "stress-hub");
    runtime_config.batch_queue_size = config.queue_size;
    runtime_config.stream_queue_size = config.queue_size;
    runtime_config.resubmit_delay = Duration::from_millis(200);
    runtime_config.worker_pause = Duration::from_millis(100);
    let runtime = TelemetryRuntime::spawn(Arc::new(session.clone()), runtime_config);

    let released = Arc::new(AtomicU64::new(0));
    let mut batches_produced = 0u64;
    let mut blocks_produced = 0u64;

    let mut produce = tokio::time::interval(config.tick);
    let mut flap = tokio::time::interval(config.flap);
    let mut report = tokio::time::interval(config.report);
    flap.tick().await;
    let mut flaps = 0u32;
    let mut online = true;
    let deadline = tokio::time::sleep(config.duration);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => break,

            _ = produce.tick() => {
                let now = Utc::now();
                runtime.enqueue_batch(
                    SampleBatch::new(now, SensorPath::new("stress-hub", Part::Bme280, "0"))
                        .with_sample(Some("temp"), 293.15 + (batches_produced % 10) as f64)
                        .with_sample(Some("humi"), 0.45),
                );
                batches_produced += 1;

                let samples: Vec<i16> = (0..config.block_samples)
                    .map(|i| ((i as f64 / 8.0).sin() * 1000.0) as i16)
                    .collect();
                let counter = released.clone();
                let block = StreamBlock::new(
                    now,
                    SensorPath::new("stress-hub", Part::Lsm303d, "0").with_subpart("accel-x"),
                    blocks_produced * config.block_samples as u64,
                    config.tick / config.block_samples.max(1) as u32,
                    samples,
                )
                .with_handle(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                });
                if let Err(err) = runtime.submit_block(block) {
                    tracing::warn!(error = %err, "stream block rejected");
                }
                blocks_produced += 1;

                if config.fail_every > 0 && batches_produced % u64::from(config.fail_every) == 0 {
                    session.fail_next(SendError::transient("stress: injected timeout"));
                }
            }

            _ = flap.tick() => {
                let elapsed_s = start.elapsed().as_secs_f64();
                if online {
                    session.set_offline(&collector);
                    emit(&EventPresence::new(None, elapsed_s));
                } else {
                    flaps += 1;
                    let resource = format!("sink-{flaps}");
                    session.set_available(collector.with_resource(&resource)?);
                    emit(&EventPresence::new(Some(&resource), elapsed_s));
                }
                online = !online;
            }

            _ = report.tick() => {
                let stats = runtime.stats();
                emit(&EventChannels::new(
                    runtime.peer().current().map(|j| j.to_string()),
                    stats.batches,
                    stats.stream,
                    session.delivered_count(),
                    start.elapsed().as_secs_f64(),
                ));
            }
        }
    }

    runtime.shutdown().await;
    let stats = runtime.stats();
    let blocks_released = released.load(Ordering::SeqCst);
    emit(&EventPipelineSummary {
        event: "summary",
        batches_produced,
        blocks_produced,
        blocks_released,
        delivered: session.delivered_count(),
        batches: stats.batches,
        stream: stats.stream,
        duration_s: start.elapsed().as_secs_f64(),
    });

    if blocks_released != blocks_produced {
        tracing::warn!(
            produced = blocks_produced,
            released = blocks_released,
            "not every stream block handle was released"
        );
    }
    Ok(())
}
