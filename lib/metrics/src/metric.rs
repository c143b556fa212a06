use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};

use crate::attributes::Attributes;
use crate::histogram::HistogramObservation;

/// The value of one series at the time it was reported
#[derive(Clone, Debug, PartialEq)]
pub enum Observation {
    Counter(u64),
    Gauge(i64),
    Histogram(HistogramObservation),
}

/// Types that wish to be used with `Metric` must implement this trait
/// that exposes the necessary reporting API
///
/// `Metric` maintains a distinct `MetricObserver` for each unique set of `Attributes`
pub trait MetricObserver: MakeMetricObserver + std::fmt::Debug + Send + 'static {
    /// The type that is used to modify the value reported by this MetricObserver
    type Recorder;

    fn recorder(&self) -> Self::Recorder;

    fn observe(&self) -> Observation;
}

/// How to construct new instances of `Self`, a blanket impl covers types
/// that implement Default.
pub trait MakeMetricObserver {
    type Options: Sized + Send + Sync + std::fmt::Debug;

    fn create(options: &Self::Options) -> Self;
}

impl<T: Default> MakeMetricObserver for T {
    type Options = ();

    fn create(_: &Self::Options) -> Self {
        Default::default()
    }
}

/// A named metric, holding one observer per attribute set.
#[derive(Clone)]
pub struct Metric<T: MetricObserver> {
    pub(crate) name: &'static str,
    pub(crate) description: &'static str,
    pub(crate) shard: Arc<Mutex<BTreeMap<Attributes, T>>>,

    pub(crate) options: T::Options,
}

impl<T: MetricObserver> Metric<T> {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn recorder(&self, attributes: impl Into<Attributes>) -> T::Recorder {
        self.observer(attributes).recorder()
    }

    pub fn observer(&self, attributes: impl Into<Attributes>) -> MappedMutexGuard<'_, T> {
        MutexGuard::map(self.shard.lock(), |values| {
            values
                .entry(attributes.into())
                .or_insert_with(|| T::create(&self.options))
        })
    }
}
