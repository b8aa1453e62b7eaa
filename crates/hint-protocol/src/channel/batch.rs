use std::sync::Arc;

use hint_transport::{NumericSample, Query, SampleBatchPayload, SampleBatchesPayload};
use parking_lot::Mutex;

use super::{ChannelCore, DeliveryChannel};
use crate::queue::DropReason;
use crate::sample::SampleBatch;

/// Discrete sensor batches, grouped under the module name on the wire.
///
/// Each queue item is one group of batches sent in a single request.
pub struct BatchChannel {
    core: ChannelCore<Vec<SampleBatch>>,
    module_name: Mutex<String>,
}

impl BatchChannel {
    pub fn new(module_name: &str, queue_size: usize) -> Self {
        Self {
            core: ChannelCore::new(
                "batches",
                queue_size,
                Arc::new(|_: Vec<SampleBatch>, _: DropReason| {}),
            ),
            module_name: Mutex::new(module_name.to_string()),
        }
    }

    pub fn enqueue_batch(&self, batch: SampleBatch) {
        self.core.queue().enqueue(vec![batch]);
    }

    /// Queue `batches` to be sent together. Empty groups are ignored.
    pub fn enqueue_batches(&self, batches: Vec<SampleBatch>) {
        if batches.is_empty() {
            return;
        }
        self.core.queue().enqueue(batches);
    }

    pub fn module_name(&self) -> String {
        self.module_name.lock().clone()
    }

    pub fn set_module_name(&self, name: &str) {
        *self.module_name.lock() = name.to_string();
    }
}

impl DeliveryChannel for BatchChannel {
    type Item = Vec<SampleBatch>;

    fn core(&self) -> &ChannelCore<Vec<SampleBatch>> {
        &self.core
    }

    fn compose_payload(&self, item: &Vec<SampleBatch>) -> Query {
        let mut payload = SampleBatchesPayload::new(&self.module_name.lock());
        payload.batches = item
            .iter()
            .map(|batch| SampleBatchPayload {
                timestamp: batch.timestamp,
                bare_path: batch.bare_path.to_string(),
                samples: batch
                    .samples
                    .iter()
                    .map(|(subpart, value)| NumericSample {
                        subpart: subpart.clone(),
                        value: *value,
                    })
                    .collect(),
            })
            .collect();
        Query::SampleBatches(payload)
    }
}
