use std::fmt::{Debug, Formatter};
use std::time::Duration;

use rand::Rng;

/// A retry strategy driven by bounded exponential back-off.
///
/// The first delay is `min`, every following one doubles the previous,
/// until `max` is reached. After that `max` is returned forever, or until
/// [`reset`] is called.
///
/// [`reset`]: ExponentialBackoff::reset
#[derive(Clone)]
pub struct ExponentialBackoff {
    current: Duration,
    min: Duration,
    max: Duration,
}

impl Debug for ExponentialBackoff {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExponentialBackoff")
            .field("min", &self.min)
            .field("max", &self.max)
            .field("current", &self.current)
            .finish()
    }
}

impl ExponentialBackoff {
    /// Constructs a new exponential back-off strategy bounded by `[min, max]`.
    ///
    /// `max` lower than `min` is raised to `min`, so the strategy degrades to
    /// a constant delay instead of shrinking.
    pub fn new(min: Duration, max: Duration) -> ExponentialBackoff {
        let max = max.max(min);

        ExponentialBackoff {
            current: min,
            min,
            max,
        }
    }

    pub fn from_millis(min: u64, max: u64) -> ExponentialBackoff {
        Self::new(Duration::from_millis(min), Duration::from_millis(max))
    }

    pub const fn min_delay(&self) -> Duration {
        self.min
    }

    pub const fn max_delay(&self) -> Duration {
        self.max
    }

    /// The next `Duration` to wait for.
    pub fn next_delay(&mut self) -> Duration {
        if self.current >= self.max {
            return self.max;
        }

        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);

        delay
    }

    pub async fn wait(&mut self) {
        let duration = self.next_delay();
        tokio::time::sleep(duration).await
    }

    pub fn reset(&mut self) {
        self.current = self.min
    }
}

/// Random delay added on top of a back-off delay, so that many clients
/// failing at the same moment do not retry in lockstep.
#[derive(Clone, Copy, Debug)]
pub struct Jitter {
    max: Duration,
}

impl Jitter {
    /// A zero `max` disables jitter.
    pub const fn new(max: Duration) -> Jitter {
        Jitter { max }
    }

    pub fn next_jitter(&self) -> Duration {
        let max = self.max.as_millis() as u64;
        if max == 0 {
            return Duration::ZERO;
        }

        Duration::from_millis(rand::rng().random_range(0..max))
    }
}
