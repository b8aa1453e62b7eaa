use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use hint_transport::{Query, StreamPayload};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use super::{ChannelCore, DeliveryChannel};
use crate::compression::{CompressedBlock, CompressionStage};
use crate::error::HintProtocolError;
use crate::queue::{DropReason, DropHook};
use crate::sample::{Part, StreamBlock};

/// Sample type tag of signed 16 bit samples.
pub const SAMPLE_TYPE_I16: &str = "h";

/// Range reported when neither the configuration nor the block sets one.
pub const DEFAULT_RANGE: f64 = 1.0;

/// Range lookup key: part and subpart of a sensor path.
pub type RangeKey = (Part, Option<String>);

/// High-rate sample blocks, compressed before they are queued.
pub struct StreamChannel {
    core: ChannelCore<CompressedBlock>,
    stage: Mutex<Option<CompressionStage>>,
    ranges: Mutex<HashMap<RangeKey, f64>>,
}

impl StreamChannel {
    /// Create the channel and start its compressor.
    pub fn spawn(queue_size: usize, ranges: HashMap<RangeKey, f64>, cancel: CancellationToken) -> Self {
        let on_drop: DropHook<CompressedBlock> =
            Arc::new(|block: CompressedBlock, _: DropReason| block.release());
        let core = ChannelCore::new("stream", queue_size, on_drop);
        let stage = CompressionStage::spawn(core.queue().clone(), Some(core.metrics().clone()), cancel);
        Self {
            core,
            stage: Mutex::new(Some(stage)),
            ranges: Mutex::new(ranges),
        }
    }

    /// Hand a block to the compressor. Never waits.
    ///
    /// Fails only after shutdown, in which case the block's handle has been
    /// released.
    pub fn submit_block(&self, block: StreamBlock) -> Result<(), HintProtocolError> {
        match self.stage.lock().as_ref() {
            Some(stage) => stage.submit(block),
            None => {
                block.release();
                Err(HintProtocolError::Shutdown)
            }
        }
    }

    pub fn set_range(&self, part: Part, subpart: Option<&str>, range: f64) {
        self.ranges
            .lock()
            .insert((part, subpart.map(str::to_string)), range);
    }

    fn range_for(&self, block: &CompressedBlock) -> f64 {
        let key = (block.path.part, block.path.subpart.clone());
        self.ranges
            .lock()
            .get(&key)
            .copied()
            .or(block.range)
            .unwrap_or(DEFAULT_RANGE)
    }

    /// Stop the compressor and release every block the channel still holds.
    pub async fn shutdown(&self) {
        let stage = self.stage.lock().take();
        if let Some(stage) = stage {
            stage.shutdown().await;
        }
        self.core.queue().clear(DropReason::Shutdown);
    }
}

/// Sample period in whole microseconds, rounded to nearest.
pub fn period_micros(period: Duration) -> i64 {
    i64::try_from((period.as_nanos() + 500) / 1000).unwrap_or(i64::MAX)
}

impl DeliveryChannel for StreamChannel {
    type Item = CompressedBlock;

    fn core(&self) -> &ChannelCore<CompressedBlock> {
        &self.core
    }

    fn compose_payload(&self, block: &CompressedBlock) -> Query {
        Query::Stream(StreamPayload {
            path: block.path.to_string(),
            t0: block.t0,
            seq0: block.seq0,
            period: period_micros(block.period),
            range: self.range_for(block),
            sample_type: SAMPLE_TYPE_I16.to_string(),
            data: block.data.clone(),
        })
    }

    fn on_delivered(&self, block: CompressedBlock) {
        block.release();
    }

    fn on_failed(&self, block: CompressedBlock) {
        block.release();
    }
}
