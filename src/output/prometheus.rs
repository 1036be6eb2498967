//! Prometheus text exposition of a run's metrics, written to a file or pushed
//! to a Pushgateway.
//!
//! Every metric is prefixed with `loadmaster_`. Counters, gauges and rates
//! map to a single series each; trends expand into `_count`, `_sum`, `_min`,
//! `_max`, `_avg`, `_med` and one series per reported percentile (`_p95`,
//! `_p99_9`, ...), optionally narrowed to a configured set of stats.
//! Sub-series become label sets.

use super::Output;
use crate::config::Options;
use crate::error::ConfigError;
use crate::metrics::Stat;
use crate::thresholds::parse_stat;
use crate::types::{MetricSummary, RunSummary, SeriesSummary};
use anyhow::Context;
use async_trait::async_trait;
use log::{debug, info};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use std::collections::BTreeMap;
use std::fmt::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const METRIC_PREFIX: &str = "loadmaster_";

type Labels = Vec<(String, String)>;

/// Renders `metrics`. An empty `trend_stats` keeps every trend stat.
pub fn render_exposition(metrics: &BTreeMap<String, MetricSummary>, trend_stats: &[Stat]) -> String {
    // name -> (type, samples)
    let mut families: BTreeMap<String, (&'static str, Vec<(Labels, f64)>)> = BTreeMap::new();
    for (name, metric) in metrics {
        for (labels, values) in series_of(metric) {
            for (suffix, kind, value) in samples(values, trend_stats) {
                let family = format!("{}{}{}", METRIC_PREFIX, sanitize(name), suffix);
                families
                    .entry(family)
                    .or_insert_with(|| (kind, Vec::new()))
                    .1
                    .push((labels.clone(), value));
            }
        }
    }

    let mut out = String::new();
    for (family, (kind, samples)) in &families {
        let _ = writeln!(out, "# TYPE {} {}", family, kind);
        for (labels, value) in samples {
            let _ = writeln!(out, "{}{} {}", family, render_labels(labels), value);
        }
    }
    out
}

fn series_of(metric: &MetricSummary) -> Vec<(Labels, &SeriesSummary)> {
    let mut series = vec![(Labels::new(), &metric.values)];
    for sub in &metric.submetrics {
        let labels = sub
            .tags
            .iter()
            .map(|(k, v)| (sanitize(k), v.clone()))
            .collect();
        series.push((labels, &sub.values));
    }
    series
}

fn samples(values: &SeriesSummary, trend_stats: &[Stat]) -> Vec<(String, &'static str, f64)> {
    match values {
        SeriesSummary::Counter { sum, .. } => vec![(String::new(), "counter", *sum)],
        SeriesSummary::Gauge { value, .. } => vec![(String::new(), "gauge", *value)],
        SeriesSummary::Rate { rate, .. } => vec![(String::new(), "gauge", *rate)],
        SeriesSummary::Trend {
            count,
            sum,
            min,
            max,
            avg,
            med,
            percentiles,
        } => {
            let wanted = |stat: Stat| trend_stats.is_empty() || trend_stats.contains(&stat);
            let mut samples: Vec<(String, &'static str, f64)> = [
                ("_count", Stat::Count, *count as f64),
                ("_sum", Stat::Sum, *sum),
                ("_min", Stat::Min, *min),
                ("_max", Stat::Max, *max),
                ("_avg", Stat::Avg, *avg),
                ("_med", Stat::Med, *med),
            ]
            .into_iter()
            .filter(|(_, stat, _)| wanted(*stat))
            .map(|(suffix, _, value)| (suffix.to_string(), "gauge", value))
            .collect();
            for (label, value) in percentiles {
                if parse_stat(label).map_or(trend_stats.is_empty(), wanted) {
                    samples.push((percentile_suffix(label), "gauge", *value));
                }
            }
            samples
        }
    }
}

/// `p(95)` -> `_p95`, `p(99.9)` -> `_p99_9`.
fn percentile_suffix(label: &str) -> String {
    let inner = label
        .strip_prefix("p(")
        .and_then(|l| l.strip_suffix(')'))
        .unwrap_or(label);
    format!("_p{}", inner.replace('.', "_"))
}

fn sanitize(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if out.starts_with(|c: char| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    out
}

fn render_labels(labels: &Labels) -> String {
    if labels.is_empty() {
        return String::new();
    }
    let rendered: Vec<String> = labels
        .iter()
        .map(|(k, v)| {
            let escaped = v
                .replace('\\', "\\\\")
                .replace('"', "\\\"")
                .replace('\n', "\\n");
            format!("{}=\"{}\"", k, escaped)
        })
        .collect();
    format!("{{{}}}", rendered.join(","))
}

pub struct PrometheusFileOutput {
    path: PathBuf,
    trend_stats: Vec<Stat>,
}

impl PrometheusFileOutput {
    pub fn new(path: impl Into<PathBuf>, trend_stats: Vec<Stat>) -> Self {
        Self {
            path: path.into(),
            trend_stats,
        }
    }
}

#[async_trait]
impl Output for PrometheusFileOutput {
    fn description(&self) -> String {
        format!("prometheus ({})", self.path.display())
    }

    async fn finish(&self, summary: &RunSummary) -> anyhow::Result<()> {
        tokio::fs::write(&self.path, render_exposition(&summary.metrics, &self.trend_stats))
            .await
            .with_context(|| format!("failed to write {}", self.path.display()))?;
        info!("💾 Prometheus metrics written to {}", self.path.display());
        Ok(())
    }
}

enum PushAuth {
    Basic {
        username: String,
        password: Option<String>,
    },
    Bearer(String),
}

/// Adds the metrics to a Pushgateway group: `POST <url>/metrics/job/<job>`.
/// With a push interval the metrics recorded so far are also pushed while
/// the run is live.
pub struct PushgatewayOutput {
    client: reqwest::Client,
    url: String,
    job: String,
    auth: Option<PushAuth>,
    push_interval: Option<Duration>,
    trend_stats: Vec<Stat>,
}

impl PushgatewayOutput {
    pub fn from_options(url: &str, options: &Options) -> Result<Self, ConfigError> {
        let mut headers = HeaderMap::new();
        for (name, value) in &options.pushgateway_headers {
            let header_name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| invalid("pushgatewayHeaders", name, e))?;
            let header_value =
                HeaderValue::from_str(value).map_err(|e| invalid("pushgatewayHeaders", value, e))?;
            headers.insert(header_name, header_value);
        }

        let mut builder = reqwest::Client::builder()
            .timeout(options.http_timeout)
            .user_agent(concat!("loadmaster/", env!("CARGO_PKG_VERSION")))
            .default_headers(headers)
            .danger_accept_invalid_certs(options.pushgateway_insecure_skip_tls_verify);
        if let (Some(cert), Some(key)) = (
            &options.pushgateway_client_certificate,
            &options.pushgateway_client_certificate_key,
        ) {
            builder = builder.identity(load_identity(cert, key)?);
        }
        let client = builder
            .build()
            .map_err(|e| invalid("pushgatewayUrl", url, e))?;

        let auth = match (&options.pushgateway_bearer_token, &options.pushgateway_username) {
            (Some(token), _) => Some(PushAuth::Bearer(token.clone())),
            (None, Some(username)) => Some(PushAuth::Basic {
                username: username.clone(),
                password: options.pushgateway_password.clone(),
            }),
            (None, None) => None,
        };

        Ok(Self {
            client,
            url: url.trim_end_matches('/').to_string(),
            job: options.pushgateway_job.clone(),
            auth,
            push_interval: options.pushgateway_push_interval,
            trend_stats: options.trend_stats()?,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/metrics/job/{}", self.url, self.job)
    }

    async fn push(&self, metrics: &BTreeMap<String, MetricSummary>) -> anyhow::Result<()> {
        let endpoint = self.endpoint();
        let mut request = self
            .client
            .post(&endpoint)
            .header(CONTENT_TYPE, "text/plain; version=0.0.4")
            .body(render_exposition(metrics, &self.trend_stats));
        request = match &self.auth {
            Some(PushAuth::Basic { username, password }) => {
                request.basic_auth(username, password.as_deref())
            }
            Some(PushAuth::Bearer(token)) => request.bearer_auth(token),
            None => request,
        };
        request
            .send()
            .await
            .with_context(|| format!("could not push metrics to {}", endpoint))?
            .error_for_status()
            .with_context(|| format!("pushgateway at {} rejected the metrics", endpoint))?;
        Ok(())
    }
}

/// Client identity from a PEM certificate and its PKCS#8 PEM key.
fn load_identity(cert: &Path, key: &Path) -> Result<reqwest::Identity, ConfigError> {
    let read = |path: &Path| {
        std::fs::read(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })
    };
    let (cert_pem, key_pem) = (read(cert)?, read(key)?);
    reqwest::Identity::from_pkcs8_pem(&cert_pem, &key_pem)
        .map_err(|e| invalid("pushgatewayClientCertificate", &cert.display().to_string(), e))
}

fn invalid(name: &str, value: &str, reason: impl std::fmt::Display) -> ConfigError {
    ConfigError::InvalidValue {
        name: name.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

#[async_trait]
impl Output for PushgatewayOutput {
    fn description(&self) -> String {
        format!("pushgateway ({})", self.endpoint())
    }

    fn snapshot_interval(&self) -> Option<Duration> {
        self.push_interval
    }

    async fn publish_snapshot(&self, metrics: &BTreeMap<String, MetricSummary>) -> anyhow::Result<()> {
        self.push(metrics).await?;
        debug!("Pushed {} metrics to {}", metrics.len(), self.endpoint());
        Ok(())
    }

    async fn finish(&self, summary: &RunSummary) -> anyhow::Result<()> {
        self.push(&summary.metrics).await?;
        info!("📤 Metrics pushed to {}", self.endpoint());
        Ok(())
    }
}
