use crate::metrics::MetricKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use uuid::Uuid;

/// Tag set attached to a sample. Ordered so equal sets hash and print alike.
pub type Tags = BTreeMap<String, String>;

/// Renders a tag set as `k1:v1,k2:v2` for display.
pub fn format_tags(tags: &Tags) -> String {
    tags.iter()
        .map(|(k, v)| format!("{}:{}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    #[serde(with = "duration_str")]
    pub duration: Duration,
    pub target: u64,
}

impl Stage {
    pub fn new(duration: Duration, target: u64) -> Self {
        Self { duration, target }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RunStatus {
    Completed,
    Aborted,
}

/// Aggregated state of one series (a metric, or one of its tagged sub-series).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SeriesSummary {
    Counter {
        count: u64,
        sum: f64,
    },
    Gauge {
        value: f64,
        min: f64,
        max: f64,
    },
    Rate {
        passes: u64,
        total: u64,
        rate: f64,
    },
    Trend {
        count: u64,
        sum: f64,
        min: f64,
        max: f64,
        avg: f64,
        med: f64,
        percentiles: BTreeMap<String, f64>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSummary {
    pub kind: MetricKind,
    pub values: SeriesSummary,
    /// One entry per distinct tag set, ordered by tags.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub submetrics: Vec<SubSeriesSummary>,
}

impl MetricSummary {
    /// The sub-series recorded under exactly `tags`.
    pub fn submetric(&self, tags: &Tags) -> Option<&SeriesSummary> {
        self.submetrics
            .iter()
            .find(|sub| &sub.tags == tags)
            .map(|sub| &sub.values)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubSeriesSummary {
    pub tags: Tags,
    pub values: SeriesSummary,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckTally {
    pub passes: u64,
    pub fails: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChecksSummary {
    pub passes: u64,
    pub fails: u64,
    pub by_name: BTreeMap<String, CheckTally>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdResult {
    pub metric: String,
    pub expression: String,
    pub passed: bool,
    /// The observed value, absent when the metric was never written.
    pub observed: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeSeriesPoint {
    pub timestamp: i64,
    pub elapsed_secs: f64,
    pub vus: u64,
    pub target_vus: u64,
    pub iterations: u64,
    pub iterations_per_second: f64,
    pub avg_iteration_duration: f64,
    pub p95_iteration_duration: f64,
    pub error_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_secs: f64,
    pub status: RunStatus,
    pub metrics: BTreeMap<String, MetricSummary>,
    pub checks: ChecksSummary,
    pub thresholds: Vec<ThresholdResult>,
    pub time_series_data: Vec<TimeSeriesPoint>,
}

impl RunSummary {
    pub fn thresholds_passed(&self) -> bool {
        self.thresholds.iter().all(|t| t.passed)
    }

    /// Overall series of a metric, if it was registered during the run.
    pub fn metric(&self, name: &str) -> Option<&SeriesSummary> {
        self.metrics.get(name).map(|m| &m.values)
    }
}

/// Parses `500ms`, `10s`, `1m`, `1h` and combinations such as `1m30s`.
/// A bare number is taken as seconds.
pub fn parse_duration(input: &str) -> Option<Duration> {
    let s = input.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(secs) = s.parse::<f64>() {
        return (secs >= 0.0 && secs.is_finite()).then(|| Duration::from_secs_f64(secs));
    }

    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if digits == 0 {
            return None;
        }
        let value: f64 = rest[..digits].parse().ok()?;
        rest = &rest[digits..];
        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let millis = match &rest[..unit_len] {
            "ms" => value,
            "s" => value * 1_000.0,
            "m" => value * 60_000.0,
            "h" => value * 3_600_000.0,
            _ => return None,
        };
        rest = &rest[unit_len..];
        total += Duration::from_secs_f64(millis / 1_000.0);
    }
    Some(total)
}

/// Human-readable form of a duration, e.g. `1m30s`, `45s`, `250ms`.
pub fn format_duration(d: Duration) -> String {
    let total_secs = d.as_secs();
    let millis = d.subsec_millis();

    if total_secs == 0 {
        format!("{}ms", millis)
    } else if total_secs < 60 {
        if millis > 0 {
            format!("{}s{}ms", total_secs, millis)
        } else {
            format!("{}s", total_secs)
        }
    } else {
        let mins = total_secs / 60;
        let secs = total_secs % 60;
        if secs > 0 {
            format!("{}m{}s", mins, secs)
        } else {
            format!("{}m", mins)
        }
    }
}

pub mod duration_str {
    use super::{format_duration, parse_duration};
    use serde::{de, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).ok_or_else(|| de::Error::custom(format!("invalid duration {:?}", s)))
    }
}

pub mod option_duration_str {
    use super::parse_duration;
    use serde::{de, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => super::duration_str::serialize(d, serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            Some(s) => parse_duration(&s)
                .map(Some)
                .ok_or_else(|| de::Error::custom(format!("invalid duration {:?}", s))),
            None => Ok(None),
        }
    }
}
