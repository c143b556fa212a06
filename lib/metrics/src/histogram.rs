use std::iter::once;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::metric::{MakeMetricObserver, MetricObserver, Observation};

/// Observations less than or equal to `le`, not cumulative.
#[derive(Clone, Debug, PartialEq)]
pub struct ObservationBucket {
    pub count: u64,
    pub le: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct HistogramObservation {
    pub buckets: Vec<ObservationBucket>,
    pub count: u64,
    pub sum: f64,
}

#[derive(Clone, Debug)]
pub struct Histogram {
    state: Arc<Mutex<HistogramObservation>>,
}

impl Histogram {
    /// `buckets` must be sorted, an `+Inf` bucket is always appended.
    pub fn new(buckets: impl Iterator<Item = f64>) -> Self {
        let buckets = buckets
            .chain(once(f64::INFINITY))
            .map(|le| ObservationBucket { le, count: 0 })
            .collect::<Vec<_>>();

        Self {
            state: Arc::new(Mutex::new(HistogramObservation {
                buckets,
                count: 0,
                sum: 0.0,
            })),
        }
    }

    /// NaN matches no bucket and is ignored.
    pub fn record(&self, value: f64) {
        let mut state = self.state.lock();

        if let Some(bucket) = state.buckets.iter_mut().find(|b| value <= b.le) {
            bucket.count = bucket.count.wrapping_add(1);
            state.count = state.count.wrapping_add(1);
            state.sum += value;
        }
    }

    pub fn get(&self) -> HistogramObservation {
        self.state.lock().clone()
    }
}

impl MetricObserver for Histogram {
    type Recorder = Self;

    fn recorder(&self) -> Self::Recorder {
        self.clone()
    }

    fn observe(&self) -> Observation {
        Observation::Histogram(self.get())
    }
}

impl MakeMetricObserver for Histogram {
    type Options = Vec<f64>;

    fn create(options: &Self::Options) -> Self {
        if options.is_empty() {
            return Histogram::new(exponential_buckets(1.0, 2.0, 10));
        }

        let mut buckets = options.clone();
        buckets.sort_by(f64::total_cmp);
        buckets.dedup();

        Histogram::new(buckets.into_iter())
    }
}

pub fn exponential_buckets(start: f64, factor: f64, length: usize) -> impl Iterator<Item = f64> {
    (0..length).map(move |i| start * factor.powi(i as i32))
}
