use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::attributes::{Attributes, assert_legal_key};
use crate::metric::{Metric, MetricObserver, Observation};
use crate::{Counter, Gauge, Histogram};

type Metrics<T> = Arc<Mutex<BTreeMap<&'static str, Metric<T>>>>;

/// A set of named metrics. Registering a name twice returns the same
/// metric, so recorders taken from either share their series.
#[derive(Clone, Default)]
pub struct Registry {
    counters: Metrics<Counter>,
    gauges: Metrics<Gauge>,
    histograms: Metrics<Histogram>,
}

impl Registry {
    pub fn new() -> Self {
        Registry::default()
    }

    pub fn register_counter(&self, name: &'static str, description: &'static str) -> Metric<Counter> {
        assert_legal_key(name);

        self.counters
            .lock()
            .entry(name)
            .or_insert_with(|| Metric {
                name,
                description,
                shard: Arc::new(Mutex::new(BTreeMap::new())),
                options: (),
            })
            .clone()
    }

    pub fn register_gauge(&self, name: &'static str, description: &'static str) -> Metric<Gauge> {
        assert_legal_key(name);

        self.gauges
            .lock()
            .entry(name)
            .or_insert_with(|| Metric {
                name,
                description,
                shard: Arc::new(Mutex::new(BTreeMap::new())),
                options: (),
            })
            .clone()
    }

    pub fn register_histogram(
        &self,
        name: &'static str,
        description: &'static str,
        buckets: impl Iterator<Item = f64>,
    ) -> Metric<Histogram> {
        assert_legal_key(name);

        let options = buckets.collect::<Vec<f64>>();

        self.histograms
            .lock()
            .entry(name)
            .or_insert_with(|| Metric {
                name,
                description,
                shard: Arc::new(Mutex::new(BTreeMap::new())),
                options,
            })
            .clone()
    }

    /// Walks counters, then gauges, then histograms, each in name order.
    pub fn report(&self, reporter: &mut impl Reporter) {
        report_generic(reporter, &self.counters);
        report_generic(reporter, &self.gauges);
        report_generic(reporter, &self.histograms);
    }
}

fn report_generic<M: MetricObserver>(reporter: &mut impl Reporter, metrics: &Metrics<M>) {
    metrics.lock().values().for_each(|set| {
        reporter.start_metric(set.name, set.description);
        set.shard
            .lock()
            .iter()
            .for_each(|(attrs, metric)| reporter.report(attrs, metric.observe()));
        reporter.finish_metric()
    })
}

pub trait Reporter {
    fn start_metric(&mut self, name: &'static str, description: &'static str);

    fn report(&mut self, attrs: &Attributes, observation: Observation);

    /// Finish recording a given metric
    fn finish_metric(&mut self);
}
