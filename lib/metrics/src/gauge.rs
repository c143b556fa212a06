use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use crate::metric::{MetricObserver, Observation};

/// A value that goes up and down. Signed, so a decrement racing ahead of
/// its increment shows up as a negative reading instead of wrapping.
#[derive(Clone, Debug, Default)]
pub struct Gauge {
    state: Arc<AtomicI64>,
}

impl Gauge {
    pub fn inc(&self, value: i64) {
        self.state.fetch_add(value, Ordering::Relaxed);
    }

    pub fn dec(&self, value: i64) {
        self.state.fetch_sub(value, Ordering::Relaxed);
    }

    pub fn set(&self, value: i64) {
        self.state.store(value, Ordering::Relaxed);
    }

    pub fn fetch(&self) -> i64 {
        self.state.load(Ordering::Relaxed)
    }
}

impl MetricObserver for Gauge {
    type Recorder = Self;

    fn recorder(&self) -> Self::Recorder {
        self.clone()
    }

    fn observe(&self) -> Observation {
        Observation::Gauge(self.fetch())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn up_and_down() {
        let gauge = Gauge::default();
        assert_eq!(gauge.fetch(), 0);

        gauge.inc(5);
        assert_eq!(gauge.fetch(), 5);
        gauge.dec(2);
        assert_eq!(gauge.fetch(), 3);
        gauge.dec(4);
        assert_eq!(gauge.fetch(), -1);

        gauge.set(10);
        assert_eq!(gauge.fetch(), 10);
    }
}
