//! Run options.
//!
//! Options are consolidated from, in increasing precedence: built-in
//! defaults, the scenario file's `options` object, `LOADMASTER_*` environment
//! variables, and command-line flags (applied by the binary).

use crate::error::ConfigError;
use crate::metrics::Stat;
use crate::thresholds::{self, Threshold};
use crate::types::{duration_str, option_duration_str, parse_duration, Stage};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration;

pub const ENV_PREFIX: &str = "LOADMASTER_";

/// Percentiles every trend reports, whatever else is configured.
pub const BASE_PERCENTILES: [f64; 4] = [50.0, 90.0, 95.0, 99.0];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Options {
    pub stages: Vec<Stage>,
    #[serde(with = "duration_str")]
    pub tick: Duration,
    pub max_vus: Option<u64>,
    #[serde(with = "duration_str")]
    pub http_timeout: Duration,
    #[serde(with = "duration_str")]
    pub grace_period: Duration,
    pub abort_on_consecutive_failures: Option<u64>,
    pub thresholds: BTreeMap<String, Vec<String>>,
    /// Extra trend percentiles for the summary.
    pub summary_percentiles: Vec<f64>,
    pub summary_export: Option<PathBuf>,
    pub prometheus_export: Option<PathBuf>,
    /// Trend stats exported to Prometheus, e.g. `["avg", "p(99)"]`. Empty
    /// exports all of them.
    pub prometheus_trend_stats: Vec<String>,
    pub pushgateway_url: Option<String>,
    pub pushgateway_job: String,
    /// Extra headers sent with every push.
    pub pushgateway_headers: BTreeMap<String, String>,
    pub pushgateway_username: Option<String>,
    #[serde(skip_serializing)]
    pub pushgateway_password: Option<String>,
    #[serde(skip_serializing)]
    pub pushgateway_bearer_token: Option<String>,
    pub pushgateway_insecure_skip_tls_verify: bool,
    /// PEM client certificate, used together with `pushgatewayClientCertificateKey`.
    pub pushgateway_client_certificate: Option<PathBuf>,
    pub pushgateway_client_certificate_key: Option<PathBuf>,
    /// Pushes the metrics recorded so far at this interval while the run is
    /// live. Without it only the final summary is pushed.
    #[serde(with = "option_duration_str")]
    pub pushgateway_push_interval: Option<Duration>,
    pub amqp_url: Option<String>,
    pub amqp_queue: String,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            stages: Vec::new(),
            tick: Duration::from_secs(1),
            max_vus: None,
            http_timeout: Duration::from_secs(30),
            grace_period: Duration::from_secs(30),
            abort_on_consecutive_failures: None,
            thresholds: BTreeMap::new(),
            summary_percentiles: Vec::new(),
            summary_export: None,
            prometheus_export: None,
            prometheus_trend_stats: Vec::new(),
            pushgateway_url: None,
            pushgateway_job: "loadmaster".to_string(),
            pushgateway_headers: BTreeMap::new(),
            pushgateway_username: None,
            pushgateway_password: None,
            pushgateway_bearer_token: None,
            pushgateway_insecure_skip_tls_verify: false,
            pushgateway_client_certificate: None,
            pushgateway_client_certificate_key: None,
            pushgateway_push_interval: None,
            amqp_url: None,
            amqp_queue: "test_results".to_string(),
        }
    }
}

impl Options {
    /// Defaults overlaid with a scenario file's `options` object.
    pub fn from_json(value: &serde_json::Value, origin: &str) -> Result<Self, ConfigError> {
        serde_json::from_value(value.clone()).map_err(|source| ConfigError::Parse {
            path: origin.to_string(),
            source,
        })
    }

    /// Applies `LOADMASTER_*` variables from `env` on top of `self`.
    pub fn apply_env(&mut self, env: &HashMap<String, String>) -> Result<(), ConfigError> {
        let var = |name: &str| env.get(&format!("{}{}", ENV_PREFIX, name));

        if let Some(v) = var("STAGES") {
            self.stages = parse_stages(v)?;
        }
        if let Some(v) = var("TICK") {
            self.tick = env_duration("TICK", v)?;
        }
        if let Some(v) = var("MAX_VUS") {
            self.max_vus = Some(env_u64("MAX_VUS", v)?);
        }
        if let Some(v) = var("HTTP_TIMEOUT") {
            self.http_timeout = env_duration("HTTP_TIMEOUT", v)?;
        }
        if let Some(v) = var("GRACE_PERIOD") {
            self.grace_period = env_duration("GRACE_PERIOD", v)?;
        }
        if let Some(v) = var("ABORT_ON_CONSECUTIVE_FAILURES") {
            self.abort_on_consecutive_failures = Some(env_u64("ABORT_ON_CONSECUTIVE_FAILURES", v)?);
        }
        if let Some(v) = var("SUMMARY_EXPORT") {
            self.summary_export = Some(PathBuf::from(v));
        }
        if let Some(v) = var("PROMETHEUS_EXPORT") {
            self.prometheus_export = Some(PathBuf::from(v));
        }
        if let Some(v) = var("PUSHGATEWAY_URL") {
            self.pushgateway_url = Some(v.clone());
        }
        if let Some(v) = var("PUSHGATEWAY_JOB") {
            self.pushgateway_job = v.clone();
        }
        if let Some(v) = var("PUSHGATEWAY_USERNAME") {
            self.pushgateway_username = Some(v.clone());
        }
        if let Some(v) = var("PUSHGATEWAY_PASSWORD") {
            self.pushgateway_password = Some(v.clone());
        }
        if let Some(v) = var("PUSHGATEWAY_BEARER_TOKEN") {
            self.pushgateway_bearer_token = Some(v.clone());
        }
        if let Some(v) = var("PUSHGATEWAY_INSECURE_SKIP_TLS_VERIFY") {
            self.pushgateway_insecure_skip_tls_verify = env_bool("PUSHGATEWAY_INSECURE_SKIP_TLS_VERIFY", v)?;
        }
        if let Some(v) = var("PUSHGATEWAY_CLIENT_CERTIFICATE") {
            self.pushgateway_client_certificate = Some(PathBuf::from(v));
        }
        if let Some(v) = var("PUSHGATEWAY_CLIENT_CERTIFICATE_KEY") {
            self.pushgateway_client_certificate_key = Some(PathBuf::from(v));
        }
        if let Some(v) = var("PUSHGATEWAY_PUSH_INTERVAL") {
            self.pushgateway_push_interval = Some(env_duration("PUSHGATEWAY_PUSH_INTERVAL", v)?);
        }
        // LOADMASTER_PUSHGATEWAY_HEADERS_X_ORG_ID=7 sends `X-Org-Id: 7`.
        let header_prefix = format!("{}PUSHGATEWAY_HEADERS_", ENV_PREFIX);
        for (key, value) in env {
            if let Some(name) = key.strip_prefix(&header_prefix).filter(|n| !n.is_empty()) {
                self.pushgateway_headers
                    .insert(name.replace('_', "-").to_ascii_lowercase(), value.clone());
            }
        }
        if let Some(v) = var("PROMETHEUS_TREND_STATS") {
            self.prometheus_trend_stats = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(v) = var("AMQP_URL") {
            self.amqp_url = Some(v.clone());
        }
        if let Some(v) = var("AMQP_QUEUE") {
            self.amqp_queue = v.clone();
        }
        Ok(())
    }

    /// Checks everything that can be checked before a run and returns the
    /// parsed thresholds.
    pub fn validate(&self) -> Result<Vec<Threshold>, ConfigError> {
        if self.stages.is_empty() {
            return Err(ConfigError::NoStages);
        }
        if self.tick.is_zero() {
            return Err(invalid("tick", "0s", "must be greater than zero"));
        }
        if self.http_timeout.is_zero() {
            return Err(invalid("httpTimeout", "0s", "must be greater than zero"));
        }
        if self.max_vus == Some(0) && self.max_target() > 0 {
            return Err(invalid("maxVus", "0", "stages require at least one VU"));
        }
        if let Some(p) = self
            .summary_percentiles
            .iter()
            .find(|p| !(0.0..=100.0).contains(*p))
        {
            return Err(invalid(
                "summaryPercentiles",
                &p.to_string(),
                "percentiles must be within 0..=100",
            ));
        }
        self.trend_stats()?;
        if self.pushgateway_client_certificate.is_some()
            != self.pushgateway_client_certificate_key.is_some()
        {
            return Err(invalid(
                "pushgatewayClientCertificate",
                "",
                "a client certificate and its key must be given together",
            ));
        }
        if self.pushgateway_bearer_token.is_some() && self.pushgateway_username.is_some() {
            return Err(invalid(
                "pushgatewayBearerToken",
                "",
                "use either basic auth or a bearer token",
            ));
        }
        if self.pushgateway_push_interval.is_some_and(|i| i.is_zero()) {
            return Err(invalid("pushgatewayPushInterval", "0s", "must be greater than zero"));
        }
        thresholds::parse_all(&self.thresholds)
    }

    /// The parsed `prometheusTrendStats`.
    pub fn trend_stats(&self) -> Result<Vec<Stat>, ConfigError> {
        self.prometheus_trend_stats
            .iter()
            .map(|name| match thresholds::parse_stat(name) {
                Some(
                    stat @ (Stat::Count
                    | Stat::Sum
                    | Stat::Min
                    | Stat::Max
                    | Stat::Avg
                    | Stat::Med
                    | Stat::Percentile(_)),
                ) => Ok(stat),
                _ => Err(invalid("prometheusTrendStats", name, "not a trend stat")),
            })
            .collect()
    }

    pub fn max_target(&self) -> u64 {
        self.stages.iter().map(|s| s.target).max().unwrap_or(0)
    }

    /// Hard VU cap: the configured one, or the largest stage target.
    pub fn max_vus(&self) -> u64 {
        self.max_vus.unwrap_or_else(|| self.max_target())
    }

    pub fn total_duration(&self) -> Duration {
        self.stages.iter().map(|s| s.duration).sum()
    }

    /// Base percentiles plus configured extras and any percentile the
    /// Prometheus trend stats ask for, sorted and deduplicated.
    pub fn percentiles(&self) -> Vec<f64> {
        let exported = self.trend_stats().unwrap_or_default();
        let mut all: Vec<f64> = BASE_PERCENTILES
            .iter()
            .chain(self.summary_percentiles.iter())
            .copied()
            .chain(exported.into_iter().filter_map(|stat| match stat {
                Stat::Percentile(p) => Some(p),
                _ => None,
            }))
            .collect();
        all.sort_by(f64::total_cmp);
        all.dedup();
        all
    }
}

/// Parses `10s:5,5s:5,5s:0`.
pub fn parse_stages(input: &str) -> Result<Vec<Stage>, ConfigError> {
    input
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(parse_stage)
        .collect()
}

pub fn parse_stage(input: &str) -> Result<Stage, ConfigError> {
    let (duration, target) = input
        .split_once(':')
        .ok_or_else(|| ConfigError::InvalidStage(input.to_string()))?;
    let duration =
        parse_duration(duration).ok_or_else(|| ConfigError::InvalidStage(input.to_string()))?;
    let target = target
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidStage(input.to_string()))?;
    Ok(Stage::new(duration, target))
}

fn env_duration(name: &str, value: &str) -> Result<Duration, ConfigError> {
    parse_duration(value).ok_or_else(|| invalid(&format!("{}{}", ENV_PREFIX, name), value, "not a duration"))
}

fn env_bool(name: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        _ => Err(invalid(&format!("{}{}", ENV_PREFIX, name), value, "not a boolean")),
    }
}

fn env_u64(name: &str, value: &str) -> Result<u64, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| invalid(&format!("{}{}", ENV_PREFIX, name), value, "not a non-negative integer"))
}

fn invalid(name: &str, value: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        name: name.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}
