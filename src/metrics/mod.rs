//! Run-scoped metric registry.
//!
//! A [`Registry`] owns every named metric of a run. Metrics are created lazily
//! on first use through [`Registry::register`]; a name keeps its kind for the
//! whole run. Samples can carry tags, in which case they are aggregated both
//! into the metric's overall series and into the sub-series for that exact
//! tag set.

mod sink;

pub use sink::{percentile_label, Sink};

use crate::error::MetricError;
use crate::types::{MetricSummary, SubSeriesSummary, Tags};
use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

pub const HTTP_REQS: &str = "http_reqs";
pub const HTTP_REQ_FAILED: &str = "http_req_failed";
pub const HTTP_REQ_DURATION: &str = "http_req_duration";
pub const HTTP_REQ_LOOKING_UP: &str = "http_req_looking_up";
pub const HTTP_REQ_CONNECTING: &str = "http_req_connecting";
pub const HTTP_REQ_TLS_HANDSHAKING: &str = "http_req_tls_handshaking";
pub const HTTP_REQ_SENDING: &str = "http_req_sending";
pub const HTTP_REQ_WAITING: &str = "http_req_waiting";
pub const HTTP_REQ_RECEIVING: &str = "http_req_receiving";
pub const DATA_RECEIVED: &str = "data_received";
pub const ITERATIONS: &str = "iterations";
pub const ITERATION_DURATION: &str = "iteration_duration";
pub const ITERATION_ERRORS: &str = "iteration_errors";
pub const CHECKS: &str = "checks";
pub const VUS: &str = "vus";
pub const VUS_MAX: &str = "vus_max";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Counter,
    Gauge,
    Rate,
    Trend,
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
            MetricKind::Rate => "rate",
            MetricKind::Trend => "trend",
        };
        f.write_str(name)
    }
}

/// An aggregate that can be read off a series.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Stat {
    Count,
    Sum,
    Rate,
    Value,
    Min,
    Max,
    Avg,
    Med,
    Percentile(f64),
}

/// One observation handed to the registry.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub value: f64,
    pub tags: Tags,
    pub time: DateTime<Utc>,
}

impl Sample {
    pub fn new(value: f64, tags: Tags) -> Self {
        Self::at(value, tags, Utc::now())
    }

    pub fn at(value: f64, tags: Tags, time: DateTime<Utc>) -> Self {
        Self { value, tags, time }
    }
}

#[derive(Debug)]
struct Series {
    overall: Sink,
    by_tags: BTreeMap<Tags, Sink>,
}

#[derive(Debug)]
struct MetricEntry {
    name: String,
    kind: MetricKind,
    series: Mutex<Series>,
}

/// Cheap, cloneable reference to a registered metric. Handles for the same
/// name compare equal.
#[derive(Debug, Clone)]
pub struct MetricHandle(Arc<MetricEntry>);

impl PartialEq for MetricHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for MetricHandle {}

impl MetricHandle {
    fn new(name: &str, kind: MetricKind) -> Self {
        Self(Arc::new(MetricEntry {
            name: name.to_string(),
            kind,
            series: Mutex::new(Series {
                overall: Sink::new(kind),
                by_tags: BTreeMap::new(),
            }),
        }))
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn kind(&self) -> MetricKind {
        self.0.kind
    }

    pub fn record(&self, sample: &Sample) {
        if !sample.value.is_finite() {
            debug!("dropping non-finite sample {} for {}", sample.value, self.0.name);
            return;
        }
        let mut series = lock(&self.0.series);
        series.overall.add(sample.value, sample.time);
        if !sample.tags.is_empty() {
            series
                .by_tags
                .entry(sample.tags.clone())
                .or_insert_with(|| Sink::new(self.0.kind))
                .add(sample.value, sample.time);
        }
    }

    pub fn stat(&self, stat: Stat) -> Option<f64> {
        lock(&self.0.series).overall.stat(stat)
    }

    /// Stat of the sub-series for exactly `tags`.
    pub fn tagged_stat(&self, tags: &Tags, stat: Stat) -> Option<f64> {
        lock(&self.0.series).by_tags.get(tags)?.stat(stat)
    }

    fn summary(&self, percentiles: &[f64]) -> MetricSummary {
        let series = lock(&self.0.series);
        MetricSummary {
            kind: self.0.kind,
            values: series.overall.summary(percentiles),
            submetrics: series
                .by_tags
                .iter()
                .map(|(tags, sink)| SubSeriesSummary {
                    tags: tags.clone(),
                    values: sink.summary(percentiles),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Default)]
pub struct Registry {
    metrics: RwLock<HashMap<String, MetricHandle>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the handle for `name`, creating the metric on first use.
    pub fn register(&self, name: &str, kind: MetricKind) -> Result<MetricHandle, MetricError> {
        {
            let metrics = self.metrics.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(handle) = metrics.get(name) {
                return check_kind(handle, kind);
            }
        }

        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
        let handle = metrics
            .entry(name.to_string())
            .or_insert_with(|| MetricHandle::new(name, kind));
        check_kind(handle, kind)
    }

    pub fn get(&self, name: &str) -> Option<MetricHandle> {
        self.metrics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn add(&self, handle: &MetricHandle, value: f64, tags: &Tags) {
        handle.record(&Sample::new(value, tags.clone()));
    }

    /// Registers `name` if needed and records one sample into it.
    pub fn add_named(
        &self,
        name: &str,
        kind: MetricKind,
        value: f64,
        tags: &Tags,
    ) -> Result<(), MetricError> {
        let handle = self.register(name, kind)?;
        self.add(&handle, value, tags);
        Ok(())
    }

    pub fn stat(&self, name: &str, stat: Stat) -> Option<f64> {
        self.get(name)?.stat(stat)
    }

    /// Freezes every metric into its summary form. Trends report the given
    /// percentiles.
    pub fn snapshot(&self, percentiles: &[f64]) -> BTreeMap<String, MetricSummary> {
        let handles: Vec<MetricHandle> = self
            .metrics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        handles
            .iter()
            .map(|h| (h.name().to_string(), h.summary(percentiles)))
            .collect()
    }
}

fn check_kind(handle: &MetricHandle, requested: MetricKind) -> Result<MetricHandle, MetricError> {
    if handle.kind() == requested {
        Ok(handle.clone())
    } else {
        Err(MetricError::ConflictingMetricKind {
            name: handle.name().to_string(),
            existing: handle.kind(),
            requested,
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SeriesSummary;
    use chrono::TimeZone;

    fn tags(pairs: &[(&str, &str)]) -> Tags {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_register_is_idempotent() {
        let registry = Registry::new();
        let a = registry.register("my_counter", MetricKind::Counter).unwrap();
        let b = registry.register("my_counter", MetricKind::Counter).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_register_conflicting_kind_fails() {
        let registry = Registry::new();
        registry.register("my_counter", MetricKind::Counter).unwrap();
        let err = registry.register("my_counter", MetricKind::Gauge).unwrap_err();
        assert_eq!(
            err,
            MetricError::ConflictingMetricKind {
                name: "my_counter".into(),
                existing: MetricKind::Counter,
                requested: MetricKind::Gauge,
            }
        );
    }

    #[test]
    fn test_tagged_samples_feed_overall_and_sub_series() {
        let registry = Registry::new();
        let trend = registry.register("my_trend", MetricKind::Trend).unwrap();
        let tagged = tags(&[("my_tag", "I'm a tag")]);
        registry.add(&trend, 10.0, &tagged);
        registry.add(&trend, 30.0, &Tags::new());

        assert_eq!(trend.stat(Stat::Count), Some(2.0));
        assert_eq!(trend.tagged_stat(&tagged, Stat::Count), Some(1.0));
        assert_eq!(trend.tagged_stat(&tagged, Stat::Max), Some(10.0));

        let snapshot = registry.snapshot(&[95.0]);
        let summary = &snapshot["my_trend"];
        assert_eq!(summary.kind, MetricKind::Trend);
        assert_eq!(summary.submetrics.len(), 1);
        assert!(summary.submetric(&tagged).is_some());
    }

    #[test]
    fn test_tag_values_with_separators_keep_their_own_series() {
        let registry = Registry::new();
        let counter = registry.register("requests", MetricKind::Counter).unwrap();
        let joined = tags(&[("a", "1,b:2")]);
        let split = tags(&[("a", "1"), ("b", "2")]);
        registry.add(&counter, 1.0, &joined);
        registry.add(&counter, 5.0, &split);

        let snapshot = registry.snapshot(&[]);
        let summary = &snapshot["requests"];
        assert_eq!(summary.submetrics.len(), 2);
        assert_eq!(
            summary.submetric(&joined),
            Some(&SeriesSummary::Counter { count: 1, sum: 1.0 })
        );
        assert_eq!(
            summary.submetric(&split),
            Some(&SeriesSummary::Counter { count: 1, sum: 5.0 })
        );
    }

    #[test]
    fn test_non_finite_samples_are_dropped() {
        let registry = Registry::new();
        let trend = registry.register("t", MetricKind::Trend).unwrap();
        registry.add(&trend, f64::NAN, &Tags::new());
        registry.add(&trend, f64::INFINITY, &Tags::new());
        assert_eq!(trend.stat(Stat::Count), Some(0.0));
    }

    #[test]
    fn test_concurrent_adds_are_order_independent() {
        let registry = Arc::new(Registry::new());
        let time = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let mut threads = Vec::new();
        for worker in 0..8u32 {
            let registry = Arc::clone(&registry);
            threads.push(std::thread::spawn(move || {
                let counter = registry.register("c", MetricKind::Counter).unwrap();
                let gauge = registry.register("g", MetricKind::Gauge).unwrap();
                let rate = registry.register("r", MetricKind::Rate).unwrap();
                let trend = registry.register("t", MetricKind::Trend).unwrap();
                for i in 0..100u32 {
                    let v = f64::from(worker * 100 + i);
                    counter.record(&Sample::at(1.0, Tags::new(), time));
                    gauge.record(&Sample::at(v, Tags::new(), time));
                    rate.record(&Sample::at(f64::from(i % 2), Tags::new(), time));
                    trend.record(&Sample::at(v, Tags::new(), time));
                }
            }));
        }
        for t in threads {
            t.join().unwrap();
        }

        let snapshot = registry.snapshot(&[50.0, 99.0]);
        assert_eq!(
            snapshot["c"].values,
            SeriesSummary::Counter {
                count: 800,
                sum: 800.0
            }
        );
        assert_eq!(registry.stat("g", Stat::Value), Some(799.0));
        assert_eq!(registry.stat("r", Stat::Rate), Some(0.5));
        assert_eq!(registry.stat("t", Stat::Min), Some(0.0));
        assert_eq!(registry.stat("t", Stat::Max), Some(799.0));
        assert_eq!(registry.stat("t", Stat::Med), Some(399.5));
    }
}
