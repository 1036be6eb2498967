//! JSON scenario files: run options plus an iteration described as steps.
//!
//! ```json
//! {
//!   "options": { "stages": [{ "duration": "10s", "target": 5 }] },
//!   "steps": [
//!     { "get": "http://localhost:8080/" },
//!     { "check": { "predicates": { "status is 200": { "status": 200 } } } },
//!     { "metric": { "name": "my_counter", "kind": "counter", "value": 1 } }
//!   ]
//! }
//! ```

use crate::check::Checks;
use crate::config::Options;
use crate::error::ConfigError;
use crate::http::{HttpResponse, RequestSpec};
use crate::metrics::MetricKind;
use crate::types::{duration_str, Tags};
use crate::vu::{Iteration, VuContext};
use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use log::info;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

const MAX_DURATION_SLOT: &str = "max_duration";

/// A URL, or a full request description.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RequestEntry {
    Url(String),
    Spec(RequestSpec),
}

impl RequestEntry {
    fn to_spec(&self) -> RequestSpec {
        match self {
            RequestEntry::Url(url) => RequestSpec::get(url.as_str()),
            RequestEntry::Spec(spec) => spec.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Step {
    Get(RequestEntry),
    Request(RequestSpec),
    Batch(Vec<RequestEntry>),
    Check(CheckStep),
    Metric(MetricStep),
    Sleep(#[serde(with = "duration_str")] Duration),
    /// Fails the iteration with the given message.
    Fail(String),
}

impl Step {
    fn label(&self) -> &'static str {
        match self {
            Step::Get(_) => "get",
            Step::Request(_) => "request",
            Step::Batch(_) => "batch",
            Step::Check(_) => "check",
            Step::Metric(_) => "metric",
            Step::Sleep(_) => "sleep",
            Step::Fail(_) => "fail",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheckStep {
    /// Index into the last batch; absent means the last response.
    #[serde(default)]
    pub target: Option<usize>,
    pub predicates: BTreeMap<String, PredicateSpec>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PredicateSpec {
    Status(u16),
    BodyEquals(String),
    BodyContains(String),
    /// Header is present, and equal to `equals` when given.
    Header {
        name: String,
        #[serde(default)]
        equals: Option<String>,
    },
    /// Total exchange duration in milliseconds.
    DurationBelow(f64),
    /// `path` is dot separated, array elements by index: `data.items.0.id`.
    JsonField {
        path: String,
        equals: serde_json::Value,
    },
}

impl PredicateSpec {
    pub fn evaluate(&self, response: &HttpResponse) -> anyhow::Result<bool> {
        Ok(match self {
            PredicateSpec::Status(status) => response.status() == *status,
            PredicateSpec::BodyEquals(body) => response.body() == body,
            PredicateSpec::BodyContains(needle) => response.body().contains(needle.as_str()),
            PredicateSpec::Header { name, equals } => match (response.header(name), equals) {
                (Some(actual), Some(expected)) => actual == expected,
                (found, None) => found.is_some(),
                (None, Some(_)) => false,
            },
            PredicateSpec::DurationBelow(limit) => response.timings().duration < *limit,
            PredicateSpec::JsonField { path, equals } => {
                let json = response
                    .json()
                    .with_context(|| format!("response from {} is not JSON", response.url()))?;
                json.pointer(&json_pointer(path)) == Some(equals)
            }
        })
    }
}

/// `data.items.0` -> `/data/items/0`, escaping `~` and `/` inside segments.
fn json_pointer(path: &str) -> String {
    path.split('.')
        .map(|segment| format!("/{}", segment.replace('~', "~0").replace('/', "~1")))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum ValueSource {
    /// `timings.duration` of the last response.
    #[serde(rename = "duration")]
    Duration,
    /// `timings.connecting + timings.tls_handshaking` of the last response.
    #[serde(rename = "connecting+tls", alias = "connectingTls")]
    ConnectingTls,
    /// Largest response duration this VU has seen so far.
    #[serde(rename = "maxDuration")]
    MaxDuration,
    /// Outcome of the last check step, 1 or 0.
    #[serde(rename = "checkPassed")]
    CheckPassed,
    #[serde(rename = "status")]
    Status,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricStep {
    pub name: String,
    pub kind: MetricKind,
    #[serde(default)]
    pub value: Option<f64>,
    #[serde(default)]
    pub from: Option<ValueSource>,
    #[serde(default)]
    pub tags: Tags,
}

#[derive(Debug, Deserialize)]
struct ScenarioFile {
    #[serde(default)]
    options: Option<serde_json::Value>,
    steps: Vec<Step>,
}

/// Steps run in order by every VU iteration.
#[derive(Debug, Clone)]
pub struct Script {
    steps: Vec<Step>,
}

#[derive(Debug)]
pub struct Scenario {
    pub options: Options,
    pub script: Script,
}

impl Scenario {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let origin = path.display().to_string();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: origin.clone(),
            source,
        })?;
        Self::parse(&contents, &origin)
    }

    pub fn parse(contents: &str, origin: &str) -> Result<Self, ConfigError> {
        let file: ScenarioFile =
            serde_json::from_str(contents).map_err(|source| ConfigError::Parse {
                path: origin.to_string(),
                source,
            })?;
        let options = match &file.options {
            Some(value) => Options::from_json(value, origin)?,
            None => Options::default(),
        };
        let script = Script::new(file.steps)?;
        info!("📄 Loaded scenario {} with {} steps", origin, script.steps.len());
        Ok(Self { options, script })
    }
}

impl Script {
    /// Rejects steps that can never succeed, such as a check with no
    /// preceding request.
    pub fn new(steps: Vec<Step>) -> Result<Self, ConfigError> {
        let mut last_responses: Option<usize> = None;
        let mut checked = false;
        for (index, step) in steps.iter().enumerate() {
            let invalid = |reason: String| ConfigError::InvalidValue {
                name: format!("steps[{}]", index),
                value: step.label().to_string(),
                reason,
            };
            match step {
                Step::Get(_) | Step::Request(_) => last_responses = Some(1),
                Step::Batch(entries) => {
                    if entries.is_empty() {
                        return Err(invalid("batch has no requests".into()));
                    }
                    last_responses = Some(entries.len());
                }
                Step::Check(check) => {
                    let available = last_responses
                        .ok_or_else(|| invalid("no request precedes this check".into()))?;
                    if let Some(target) = check.target.filter(|t| *t >= available) {
                        return Err(invalid(format!(
                            "target {} is out of range for {} responses",
                            target, available
                        )));
                    }
                    checked = true;
                }
                Step::Metric(metric) => match (metric.value, metric.from) {
                    (Some(_), None) => {}
                    (None, Some(ValueSource::CheckPassed)) if !checked => {
                        return Err(invalid("no check precedes this metric".into()))
                    }
                    (None, Some(ValueSource::CheckPassed)) => {}
                    (None, Some(_)) if last_responses.is_none() => {
                        return Err(invalid("no request precedes this metric".into()))
                    }
                    (None, Some(_)) => {}
                    _ => return Err(invalid("exactly one of `value` or `from` is required".into())),
                },
                Step::Sleep(_) | Step::Fail(_) => {}
            }
        }
        Ok(Self { steps })
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    async fn step(&self, vu: &mut VuContext, step: &Step, state: &mut StepState) -> anyhow::Result<()> {
        match step {
            Step::Get(entry) => {
                let mut spec = entry.to_spec();
                spec.method = "GET".to_string();
                state.responses = vec![vu.http().request(&spec).await];
            }
            Step::Request(spec) => {
                state.responses = vec![vu.http().request(spec).await];
            }
            Step::Batch(entries) => {
                let specs: Vec<RequestSpec> = entries.iter().map(RequestEntry::to_spec).collect();
                state.responses = vu.http().batch(&specs).await;
            }
            Step::Check(check) => {
                let response = state.target(check.target)?;
                let checks = check
                    .predicates
                    .iter()
                    .fold(Checks::new(), |checks, (name, predicate)| {
                        checks.with(name.as_str(), move |r: &HttpResponse| predicate.evaluate(r))
                    });
                let passed = vu.check(response, &checks);
                state.last_check = Some(passed);
            }
            Step::Metric(metric) => {
                let value = match (metric.value, metric.from) {
                    (Some(value), _) => value,
                    (None, Some(source)) => state.resolve(source, vu)?,
                    (None, None) => bail!("metric {} has no value", metric.name),
                };
                let handle = vu.metric(&metric.name, metric.kind)?;
                vu.add(&handle, value, &metric.tags);
            }
            Step::Sleep(duration) => tokio::time::sleep(*duration).await,
            Step::Fail(message) => bail!("{}", message),
        }
        Ok(())
    }
}

#[derive(Default)]
struct StepState {
    responses: Vec<HttpResponse>,
    last_check: Option<bool>,
}

impl StepState {
    fn target(&self, index: Option<usize>) -> anyhow::Result<&HttpResponse> {
        match index {
            Some(i) => self
                .responses
                .get(i)
                .ok_or_else(|| anyhow!("no response at index {}", i)),
            None => self
                .responses
                .last()
                .ok_or_else(|| anyhow!("no response to inspect")),
        }
    }

    fn resolve(&self, source: ValueSource, vu: &mut VuContext) -> anyhow::Result<f64> {
        Ok(match source {
            ValueSource::Duration => self.target(None)?.timings().duration,
            ValueSource::ConnectingTls => {
                let timings = self.target(None)?.timings();
                timings.connecting + timings.tls_handshaking
            }
            ValueSource::MaxDuration => {
                let duration = self.target(None)?.timings().duration;
                let max = vu.value(MAX_DURATION_SLOT).map_or(duration, |m| m.max(duration));
                vu.set_value(MAX_DURATION_SLOT, max);
                max
            }
            ValueSource::CheckPassed => match self.last_check {
                Some(true) => 1.0,
                Some(false) => 0.0,
                None => bail!("no check has run in this iteration"),
            },
            ValueSource::Status => f64::from(self.target(None)?.status()),
        })
    }
}

#[async_trait]
impl Iteration for Script {
    async fn run(&self, vu: &mut VuContext) -> anyhow::Result<()> {
        let mut state = StepState::default();
        for (index, step) in self.steps.iter().enumerate() {
            self.step(vu, step, &mut state)
                .await
                .with_context(|| format!("step {} ({}) failed", index + 1, step.label()))?;
        }
        Ok(())
    }
}
