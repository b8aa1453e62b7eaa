use std::sync::Arc;

use hint_metrics::ChannelMetrics;
use hint_protocol::{DeliveryQueue, DropReason};
use parking_lot::Mutex;
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    Enqueue,
    Dequeue,
    Resize(usize),
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        6 => Just(Op::Enqueue),
        3 => Just(Op::Dequeue),
        1 => (0..12usize).prop_map(Op::Resize),
    ]
}

proptest! {
    /// Every item is either still queued, dequeued or dropped through the
    /// hook, exactly once, and the queue always holds the newest items.
    #[test]
    fn drop_oldest_accounting(capacity in 1..12usize, ops in prop::collection::vec(arb_op(), 0..200)) {
        let dropped = Arc::new(Mutex::new(Vec::new()));
        let hook = {
            let dropped = dropped.clone();
            Arc::new(move |item: u32, _: DropReason| dropped.lock().push(item))
        };
        let metrics = Arc::new(ChannelMetrics::new());
        let queue = DeliveryQueue::new("prop", capacity, hook).with_metrics(metrics.clone());

        let mut next = 0u32;
        let mut taken = Vec::new();
        for op in ops {
            match op {
                Op::Enqueue => {
                    queue.enqueue(next);
                    next += 1;
                }
                Op::Dequeue => taken.extend(queue.try_dequeue()),
                Op::Resize(size) => queue.set_capacity(size),
            }
            prop_assert!(queue.len() <= queue.capacity());
        }

        let mut remaining = Vec::new();
        while let Some(item) = queue.try_dequeue() {
            remaining.push(item);
        }

        let dropped = dropped.lock().clone();
        let mut seen: Vec<u32> = taken.iter().chain(&dropped).chain(&remaining).copied().collect();
        seen.sort_unstable();
        prop_assert_eq!(seen, (0..next).collect::<Vec<_>>());

        // FIFO: what leaves the queue normally leaves in order.
        prop_assert!(taken.windows(2).all(|w| w[0] < w[1]));
        prop_assert!(remaining.windows(2).all(|w| w[0] < w[1]));
        // Drops always hit the oldest item still queued.
        prop_assert!(dropped.windows(2).all(|w| w[0] < w[1]));

        prop_assert_eq!(metrics.enqueued.value(), u64::from(next));
        prop_assert_eq!(metrics.dropped.value(), dropped.len() as u64);
    }
}
