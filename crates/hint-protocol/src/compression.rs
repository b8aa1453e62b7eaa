//! Compression offload stage for stream blocks.
//!
//! Producers hand raw [`StreamBlock`]s to an unbounded front buffer and
//! never wait. A single compressor task takes one block at a time, runs the
//! bzip2 transform on the blocking pool and pushes the result into the
//! stream channel's [`DeliveryQueue`], where the usual drop-oldest policy
//! applies.
//!
//! A failed transform discards that one block and releases its handle. If
//! the compressor task itself dies it is relaunched; blocks still in the
//! front buffer are kept. Both block types release their handle when
//! dropped, so a block lost to an aborted task is released too.

use std::fmt;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use bzip2::write::BzEncoder;
use bzip2::Compression;
use chrono::{DateTime, Utc};
use hint_metrics::ChannelMetrics;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::HintProtocolError;
use crate::queue::DeliveryQueue;
use crate::sample::{ResourceHandle, SensorPath, StreamBlock};

/// A stream block ready for the wire.
pub struct CompressedBlock {
    pub path: SensorPath,
    pub t0: DateTime<Utc>,
    pub seq0: u64,
    pub period: Duration,
    pub range: Option<f64>,
    /// bzip2 of the little-endian `i16` samples.
    pub data: Vec<u8>,
    handle: Option<Box<dyn ResourceHandle>>,
}

impl CompressedBlock {
    /// Release the resource handle of the originating block, if any.
    pub fn release(mut self) {
        if let Some(handle) = self.handle.take() {
            handle.release();
        }
    }

    pub fn has_handle(&self) -> bool {
        self.handle.is_some()
    }
}

impl Drop for CompressedBlock {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.release();
        }
    }
}

impl fmt::Debug for CompressedBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompressedBlock")
            .field("path", &self.path.to_string())
            .field("t0", &self.t0)
            .field("seq0", &self.seq0)
            .field("bytes", &self.data.len())
            .finish()
    }
}

/// Compress samples as the wire expects them: little-endian `i16`, bzip2
/// at the highest level.
pub fn compress_samples(samples: &[i16]) -> Result<Vec<u8>, HintProtocolError> {
    let raw: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
    let mut encoder = BzEncoder::new(Vec::new(), Compression::best());
    encoder
        .write_all(&raw)
        .and_then(|()| encoder.finish())
        .map_err(|e| HintProtocolError::Compression(e.to_string()))
}

type FrontReceiver = Arc<Mutex<mpsc::UnboundedReceiver<StreamBlock>>>;

pub struct CompressionStage {
    front: mpsc::UnboundedSender<StreamBlock>,
    rx: FrontReceiver,
    cancel: CancellationToken,
    driver: JoinHandle<()>,
}

impl CompressionStage {
    /// Start the compressor feeding `queue`.
    pub fn spawn(
        queue: Arc<DeliveryQueue<CompressedBlock>>,
        metrics: Option<Arc<ChannelMetrics>>,
        cancel: CancellationToken,
    ) -> Self {
        let (front, rx) = mpsc::unbounded_channel();
        let rx = Arc::new(Mutex::new(rx));
        let driver = tokio::spawn(drive(rx.clone(), queue, metrics, cancel.clone()));
        Self {
            front,
            rx,
            cancel,
            driver,
        }
    }

    /// Hand a raw block to the compressor. Never waits.
    ///
    /// After shutdown the block's handle is released and an error returned.
    pub fn submit(&self, block: StreamBlock) -> Result<(), HintProtocolError> {
        self.front.send(block).map_err(|mpsc::error::SendError(block)| {
            block.release();
            HintProtocolError::Shutdown
        })
    }

    /// Stop the compressor and release every block still waiting for it.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.driver.await;
        let mut rx = self.rx.lock().await;
        rx.close();
        let mut released = 0usize;
        while let Ok(block) = rx.try_recv() {
            block.release();
            released += 1;
        }
        if released > 0 {
            tracing::debug!(released, "released uncompressed blocks on shutdown");
        }
    }
}

/// Relaunch the compressor until cancelled or the front buffer closes.
async fn drive(
    rx: FrontReceiver,
    queue: Arc<DeliveryQueue<CompressedBlock>>,
    metrics: Option<Arc<ChannelMetrics>>,
    cancel: CancellationToken,
) {
    loop {
        let mut task = tokio::spawn(compressor(rx.clone(), queue.clone(), metrics.clone()));
        tokio::select! {
            _ = cancel.cancelled() => {
                task.abort();
                let _ = task.await;
                return;
            }
            joined = &mut task => match joined {
                Ok(()) => return,
                Err(err) if err.is_cancelled() => return,
                Err(err) => {
                    tracing::error!(error = %err, "compressor task exited prematurely, relaunching");
                }
            },
        }
    }
}

async fn compressor(
    rx: FrontReceiver,
    queue: Arc<DeliveryQueue<CompressedBlock>>,
    metrics: Option<Arc<ChannelMetrics>>,
) {
    loop {
        let Some(mut block) = rx.lock().await.recv().await else {
            return;
        };

        let span = block.span();
        let samples = std::mem::take(&mut block.samples);
        let started = std::time::Instant::now();
        let compressed = tokio::task::spawn_blocking(move || compress_samples(&samples)).await;
        let elapsed = started.elapsed();

        let data = match compressed {
            Ok(Ok(data)) => data,
            Ok(Err(err)) => {
                discard(block, metrics.as_deref(), &err.to_string());
                continue;
            }
            Err(join_err) => {
                discard(block, metrics.as_deref(), &join_err.to_string());
                continue;
            }
        };

        let share = if span.is_zero() {
            0.0
        } else {
            elapsed.as_secs_f64() / span.as_secs_f64() * 100.0
        };
        tracing::debug!(
            path = %block.path,
            ms = elapsed.as_secs_f64() * 1000.0,
            percent = share,
            "sample compression done"
        );

        queue.enqueue(CompressedBlock {
            path: block.path.clone(),
            t0: block.timestamp,
            seq0: block.seq0,
            period: block.period,
            range: block.range,
            data,
            handle: block.take_handle(),
        });
    }
}

fn discard(block: StreamBlock, metrics: Option<&ChannelMetrics>, error: &str) {
    tracing::error!(path = %block.path, seq0 = block.seq0, error, "failed to compress block");
    block.release();
    if let Some(metrics) = metrics {
        metrics.failed.inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::DropReason;
    use crate::sample::Part;
    use bzip2::read::BzDecoder;
    use std::io::Read;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn block(seq0: u64, samples: Vec<i16>) -> StreamBlock {
        StreamBlock::new(
            Utc::now(),
            SensorPath::new("hub", Part::Lsm303d, "0").with_subpart("accel-x"),
            seq0,
            Duration::from_millis(1),
            samples,
        )
    }

    fn decompress(data: &[u8]) -> Vec<i16> {
        let mut raw = Vec::new();
        BzDecoder::new(data).read_to_end(&mut raw).unwrap();
        raw.chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .collect()
    }

    #[test]
    fn samples_are_little_endian_bzip2() {
        let samples = vec![0, 1, -1, i16::MAX, i16::MIN, 1234];
        let data = compress_samples(&samples).unwrap();
        assert_eq!(&data[..3], b"BZh");
        assert_eq!(data[3], b'9');
        assert_eq!(decompress(&data), samples);
    }

    #[tokio::test]
    async fn blocks_flow_into_queue_in_order() {
        let queue = Arc::new(DeliveryQueue::new("stream", 16, Arc::new(|b: CompressedBlock, _: DropReason| b.release())));
        let stage = CompressionStage::spawn(queue.clone(), None, CancellationToken::new());

        let released = Arc::new(AtomicUsize::new(0));
        for seq0 in 0..3u64 {
            let counter = released.clone();
            stage
                .submit(block(seq0 * 100, vec![seq0 as i16; 100]).with_handle(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                }))
                .unwrap();
        }

        for seq0 in 0..3u64 {
            let item = queue.dequeue().await;
            assert_eq!(item.seq0, seq0 * 100);
            assert!(item.has_handle());
            assert_eq!(decompress(&item.data), vec![seq0 as i16; 100]);
            item.release();
        }
        assert_eq!(released.load(Ordering::SeqCst), 3);
        stage.shutdown().await;
    }

    #[tokio::test]
    async fn compressor_is_relaunched_after_panic() {
        // The drop hook panics on the first overflow, killing the compressor.
        let drops = Arc::new(AtomicUsize::new(0));
        let counter = drops.clone();
        let hook = Arc::new(move |b: CompressedBlock, reason: DropReason| {
            assert_eq!(reason, DropReason::Overflow);
            b.release();
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("drop hook failure");
            }
        });
        let queue = Arc::new(DeliveryQueue::new("stream", 1, hook));
        let stage = CompressionStage::spawn(queue.clone(), None, CancellationToken::new());

        stage.submit(block(0, vec![0; 10])).unwrap();
        stage.submit(block(1, vec![1; 10])).unwrap();
        stage.submit(block(2, vec![2; 10])).unwrap();

        // Block 2 evicting block 1 proves the relaunched compressor runs.
        tokio::time::timeout(Duration::from_secs(10), async {
            while drops.load(Ordering::SeqCst) < 2 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(queue.try_dequeue().unwrap().seq0, 2);
        stage.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_releases_pending_blocks() {
        let queue = Arc::new(DeliveryQueue::new(
            "stream",
            16,
            Arc::new(|b: CompressedBlock, _: DropReason| b.release()),
        ));
        let stage = CompressionStage::spawn(queue.clone(), None, CancellationToken::new());
        stage.cancel.cancel();
        while !stage.driver.is_finished() {
            tokio::task::yield_now().await;
        }

        let released = Arc::new(AtomicUsize::new(0));
        let counter = released.clone();
        stage
            .submit(block(0, vec![0; 10]).with_handle(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        stage.shutdown().await;
        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert!(queue.is_empty());
    }
}
