use std::time::Duration;

use hint_protocol::{BackoffConfig, ExponentialBackoff};
use proptest::prelude::*;

fn arb_config() -> impl Strategy<Value = BackoffConfig> {
    (1..60_000u64, 0..8u32, 1..600_000u64).prop_map(|(start, base, max)| BackoffConfig {
        start: Duration::from_millis(start),
        base,
        max: Duration::from_millis(max),
    })
}

proptest! {
    /// Delays never shrink and never pass the cap.
    #[test]
    fn delays_monotonic_and_capped(config in arb_config(), draws in 1..64usize) {
        let mut backoff = ExponentialBackoff::new(config);
        let cap = config.max.max(config.start);
        let mut last = Duration::ZERO;
        for _ in 0..draws {
            let delay = backoff.next_delay();
            prop_assert!(delay >= last);
            prop_assert!(delay <= cap);
            last = delay;
        }
        prop_assert!(backoff.failing());
    }

    /// The first draw after a reset is always the configured start.
    #[test]
    fn reset_restores_start(config in arb_config(), draws in 0..32usize) {
        let mut backoff = ExponentialBackoff::new(config);
        for _ in 0..draws {
            backoff.next_delay();
        }
        backoff.reset();
        prop_assert!(!backoff.failing());
        prop_assert_eq!(backoff.next_delay(), config.start);
    }
}
