/// Exponential backoff: capped, stateful delay generator.
///
/// Each draw returns the current delay and multiplies it by `base` for the
/// next draw, saturating at `max`. Drawing marks the sequence as failing;
/// only [`reset`](ExponentialBackoff::reset) clears that again.
use std::time::Duration;

/// Parameters of an [`ExponentialBackoff`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffConfig {
    /// First delay handed out after a reset.
    pub start: Duration,
    /// Multiplier applied after every draw.
    pub base: u32,
    /// Upper bound for any delay.
    pub max: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            start: Duration::from_secs(1),
            base: 2,
            max: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    start: Duration,
    base: u32,
    max: Duration,
    current: Duration,
    failing: bool,
}

impl ExponentialBackoff {
    /// Create a sequence from `config`.
    ///
    /// A `max` below `start` is raised to `start`; a `base` of zero is
    /// treated as one (constant delay).
    pub fn new(config: BackoffConfig) -> Self {
        let max = config.max.max(config.start);
        Self {
            start: config.start,
            base: config.base.max(1),
            max,
            current: config.start,
            failing: false,
        }
    }

    /// Return the next delay and advance the sequence.
    pub fn next_delay(&mut self) -> Duration {
        self.failing = true;
        let delay = self.current;
        self.current = self
            .current
            .checked_mul(self.base)
            .map_or(self.max, |d| d.min(self.max));
        delay
    }

    /// Back to the first delay; no longer failing.
    pub fn reset(&mut self) {
        self.current = self.start;
        self.failing = false;
    }

    /// Whether a delay was drawn since the last reset.
    pub fn failing(&self) -> bool {
        self.failing
    }

    /// The delay the next draw will return.
    pub fn peek(&self) -> Duration {
        self.current
    }

    pub fn config(&self) -> BackoffConfig {
        BackoffConfig {
            start: self.start,
            base: self.base,
            max: self.max,
        }
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}

/// Never exhausted.
impl Iterator for ExponentialBackoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        Some(self.next_delay())
    }
}
