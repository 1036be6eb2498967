use super::{MetricKind, Stat};
use crate::types::SeriesSummary;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// Accumulator for one series. Every update is commutative, so the final
/// state does not depend on the order concurrent VUs wrote in.
#[derive(Debug, Clone)]
pub enum Sink {
    Counter(CounterSink),
    Gauge(GaugeSink),
    Rate(RateSink),
    Trend(TrendSink),
}

impl Sink {
    pub fn new(kind: MetricKind) -> Self {
        match kind {
            MetricKind::Counter => Sink::Counter(CounterSink::default()),
            MetricKind::Gauge => Sink::Gauge(GaugeSink::default()),
            MetricKind::Rate => Sink::Rate(RateSink::default()),
            MetricKind::Trend => Sink::Trend(TrendSink::default()),
        }
    }

    pub fn add(&mut self, value: f64, time: DateTime<Utc>) {
        match self {
            Sink::Counter(s) => s.add(value),
            Sink::Gauge(s) => s.add(value, time),
            Sink::Rate(s) => s.add(value),
            Sink::Trend(s) => s.add(value),
        }
    }

    pub fn summary(&self, percentiles: &[f64]) -> SeriesSummary {
        match self {
            Sink::Counter(s) => SeriesSummary::Counter {
                count: s.count,
                sum: s.sum,
            },
            Sink::Gauge(s) => SeriesSummary::Gauge {
                value: s.value(),
                min: s.min.unwrap_or(0.0),
                max: s.max.unwrap_or(0.0),
            },
            Sink::Rate(s) => SeriesSummary::Rate {
                passes: s.passes,
                total: s.total,
                rate: s.rate(),
            },
            Sink::Trend(s) => SeriesSummary::Trend {
                count: s.count(),
                sum: s.sum,
                min: s.min(),
                max: s.max(),
                avg: s.avg(),
                med: s.percentile(50.0),
                percentiles: percentiles
                    .iter()
                    .map(|p| (percentile_label(*p), s.percentile(*p)))
                    .collect::<BTreeMap<_, _>>(),
            },
        }
    }

    /// Value of `stat` for this series, `None` when the kind has no such stat.
    pub fn stat(&self, stat: Stat) -> Option<f64> {
        match (self, stat) {
            (Sink::Counter(s), Stat::Count) => Some(s.count as f64),
            (Sink::Counter(s), Stat::Sum) => Some(s.sum),
            (Sink::Gauge(s), Stat::Value) => Some(s.value()),
            (Sink::Gauge(s), Stat::Min) => Some(s.min.unwrap_or(0.0)),
            (Sink::Gauge(s), Stat::Max) => Some(s.max.unwrap_or(0.0)),
            (Sink::Rate(s), Stat::Rate) => Some(s.rate()),
            (Sink::Rate(s), Stat::Count) => Some(s.total as f64),
            (Sink::Rate(s), Stat::Sum) => Some(s.passes as f64),
            (Sink::Trend(s), Stat::Count) => Some(s.count() as f64),
            (Sink::Trend(s), Stat::Sum) => Some(s.sum),
            (Sink::Trend(s), Stat::Min) => Some(s.min()),
            (Sink::Trend(s), Stat::Max) => Some(s.max()),
            (Sink::Trend(s), Stat::Avg) => Some(s.avg()),
            (Sink::Trend(s), Stat::Med) => Some(s.percentile(50.0)),
            (Sink::Trend(s), Stat::Percentile(p)) => Some(s.percentile(p)),
            _ => None,
        }
    }
}

/// `p(95)` for 95.0, `p(99.9)` for 99.9.
pub fn percentile_label(p: f64) -> String {
    format!("p({})", p)
}

#[derive(Debug, Clone, Default)]
pub struct CounterSink {
    pub count: u64,
    pub sum: f64,
}

impl CounterSink {
    fn add(&mut self, value: f64) {
        if value < 0.0 {
            return;
        }
        self.count += 1;
        self.sum += value;
    }
}

#[derive(Debug, Clone, Default)]
pub struct GaugeSink {
    last: Option<(DateTime<Utc>, f64)>,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl GaugeSink {
    fn add(&mut self, value: f64, time: DateTime<Utc>) {
        // Latest timestamp wins; equal timestamps keep the larger value.
        let newer = match self.last {
            None => true,
            Some((t, v)) => time > t || (time == t && value.total_cmp(&v).is_gt()),
        };
        if newer {
            self.last = Some((time, value));
        }
        self.min = Some(self.min.map_or(value, |m| m.min(value)));
        self.max = Some(self.max.map_or(value, |m| m.max(value)));
    }

    pub fn value(&self) -> f64 {
        self.last.map(|(_, v)| v).unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, Default)]
pub struct RateSink {
    pub passes: u64,
    pub total: u64,
}

impl RateSink {
    fn add(&mut self, value: f64) {
        self.total += 1;
        if value != 0.0 {
            self.passes += 1;
        }
    }

    pub fn rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.passes as f64 / self.total as f64
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TrendSink {
    /// Kept sorted so percentiles never need a full sort.
    values: Vec<f64>,
    sum: f64,
}

impl TrendSink {
    fn add(&mut self, value: f64) {
        let index = self.values.partition_point(|v| *v <= value);
        self.values.insert(index, value);
        self.sum += value;
    }

    pub fn count(&self) -> u64 {
        self.values.len() as u64
    }

    pub fn min(&self) -> f64 {
        self.values.first().copied().unwrap_or(0.0)
    }

    pub fn max(&self) -> f64 {
        self.values.last().copied().unwrap_or(0.0)
    }

    pub fn avg(&self) -> f64 {
        if self.values.is_empty() {
            0.0
        } else {
            self.sum / self.values.len() as f64
        }
    }

    /// Percentile `p` in `[0, 100]`, interpolating linearly between ranks.
    pub fn percentile(&self, p: f64) -> f64 {
        match self.values.len() {
            0 => 0.0,
            1 => self.values[0],
            n => {
                let rank = (p.clamp(0.0, 100.0) / 100.0) * (n as f64 - 1.0);
                let lower = self.values[rank.floor() as usize];
                let upper = self.values[rank.ceil() as usize];
                lower + (upper - lower) * (rank - rank.floor())
            }
        }
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn test_counter_ignores_negative_increments() {
        let mut sink = Sink::new(MetricKind::Counter);
        sink.add(2.0, at(0));
        sink.add(-5.0, at(1));
        sink.add(3.0, at(2));
        assert_eq!(sink.summary(&[]), SeriesSummary::Counter { count: 2, sum: 5.0 });
    }

    #[test]
    fn test_gauge_latest_timestamp_wins() {
        let mut sink = Sink::new(MetricKind::Gauge);
        sink.add(7.0, at(10));
        sink.add(3.0, at(20));
        sink.add(9.0, at(5));
        assert_eq!(
            sink.summary(&[]),
            SeriesSummary::Gauge {
                value: 3.0,
                min: 3.0,
                max: 9.0
            }
        );
    }

    #[test]
    fn test_gauge_tie_is_resolved_by_value_not_arrival() {
        let mut a = Sink::new(MetricKind::Gauge);
        a.add(1.0, at(1));
        a.add(2.0, at(1));
        let mut b = Sink::new(MetricKind::Gauge);
        b.add(2.0, at(1));
        b.add(1.0, at(1));
        assert_eq!(a.stat(Stat::Value), Some(2.0));
        assert_eq!(b.stat(Stat::Value), Some(2.0));
    }

    #[test]
    fn test_rate_treats_non_zero_as_pass() {
        let mut sink = Sink::new(MetricKind::Rate);
        for v in [1.0, 0.0, 5.0, 0.0] {
            sink.add(v, at(0));
        }
        assert_eq!(
            sink.summary(&[]),
            SeriesSummary::Rate {
                passes: 2,
                total: 4,
                rate: 0.5
            }
        );
    }

    #[test]
    fn test_trend_percentiles_interpolate() {
        let mut sink = TrendSink::default();
        for v in [40.0, 10.0, 30.0, 20.0] {
            sink.add(v);
        }
        assert_eq!(sink.values(), &[10.0, 20.0, 30.0, 40.0]);
        assert_eq!(sink.percentile(0.0), 10.0);
        assert_eq!(sink.percentile(50.0), 25.0);
        assert_eq!(sink.percentile(100.0), 40.0);
        assert!((sink.percentile(90.0) - 37.0).abs() < 1e-9);
        assert_eq!(sink.avg(), 25.0);
    }

    #[test]
    fn test_empty_trend_reports_zeroes() {
        let sink = Sink::new(MetricKind::Trend);
        assert_eq!(sink.stat(Stat::Percentile(95.0)), Some(0.0));
        assert_eq!(sink.stat(Stat::Count), Some(0.0));
    }

    #[test]
    fn test_stat_not_produced_by_kind() {
        let sink = Sink::new(MetricKind::Counter);
        assert_eq!(sink.stat(Stat::Percentile(95.0)), None);
        assert_eq!(sink.stat(Stat::Rate), None);
    }
}
