//! Pass/fail criteria over final metric aggregates, e.g.
//! `"http_req_duration": ["p(95)<500"]` or
//! `"checks{check:status is 200}": ["rate>0.99"]`.

use crate::error::ConfigError;
use crate::metrics::{Registry, Stat};
use crate::types::{Tags, ThresholdResult};
use log::warn;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl Op {
    fn apply(self, observed: f64, expected: f64) -> bool {
        match self {
            Op::Lt => observed < expected,
            Op::Le => observed <= expected,
            Op::Gt => observed > expected,
            Op::Ge => observed >= expected,
            Op::Eq => observed == expected,
            Op::Ne => observed != expected,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Threshold {
    pub metric: String,
    pub tags: Tags,
    pub expression: String,
    pub stat: Stat,
    pub op: Op,
    pub value: f64,
}

impl Threshold {
    /// `metric` may select a sub-series: `name{key:value,...}`.
    pub fn parse(metric: &str, expression: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidThreshold {
            metric: metric.to_string(),
            expression: expression.to_string(),
            reason: reason.to_string(),
        };

        let (name, tags) = parse_metric_selector(metric).ok_or_else(|| invalid("bad tag selector"))?;

        let op_start = expression
            .find(['<', '>', '=', '!'])
            .ok_or_else(|| invalid("missing comparison operator"))?;
        let rest = &expression[op_start..];
        let (op, op_len) = if rest.starts_with("<=") {
            (Op::Le, 2)
        } else if rest.starts_with(">=") {
            (Op::Ge, 2)
        } else if rest.starts_with("==") {
            (Op::Eq, 2)
        } else if rest.starts_with("!=") {
            (Op::Ne, 2)
        } else if rest.starts_with('<') {
            (Op::Lt, 1)
        } else if rest.starts_with('>') {
            (Op::Gt, 1)
        } else {
            return Err(invalid("unknown comparison operator"));
        };

        let stat = parse_stat(expression[..op_start].trim()).ok_or_else(|| invalid("unknown stat"))?;
        let value: f64 = rest[op_len..]
            .trim()
            .parse()
            .map_err(|_| invalid("right-hand side is not a number"))?;

        Ok(Self {
            metric: name,
            tags,
            expression: expression.to_string(),
            stat,
            op,
            value,
        })
    }

    pub fn evaluate(&self, registry: &Registry) -> ThresholdResult {
        let observed = registry.get(&self.metric).and_then(|handle| {
            if self.tags.is_empty() {
                handle.stat(self.stat)
            } else {
                handle.tagged_stat(&self.tags, self.stat)
            }
        });
        if observed.is_none() {
            warn!(
                "threshold {:?} on {:?} has no data to evaluate, marking it failed",
                self.expression, self.metric
            );
        }
        ThresholdResult {
            metric: self.selector(),
            expression: self.expression.clone(),
            passed: observed.is_some_and(|v| self.op.apply(v, self.value)),
            observed,
        }
    }

    fn selector(&self) -> String {
        if self.tags.is_empty() {
            self.metric.clone()
        } else {
            format!("{}{{{}}}", self.metric, crate::types::format_tags(&self.tags))
        }
    }
}

pub fn parse_all(config: &BTreeMap<String, Vec<String>>) -> Result<Vec<Threshold>, ConfigError> {
    let mut thresholds = Vec::new();
    for (metric, expressions) in config {
        for expression in expressions {
            thresholds.push(Threshold::parse(metric, expression)?);
        }
    }
    Ok(thresholds)
}

/// `count`, `sum`, `rate`, `value`, `min`, `max`, `avg`, `med` or `p(N)`.
pub fn parse_stat(s: &str) -> Option<Stat> {
    match s {
        "count" => Some(Stat::Count),
        "sum" => Some(Stat::Sum),
        "rate" => Some(Stat::Rate),
        "value" => Some(Stat::Value),
        "min" => Some(Stat::Min),
        "max" => Some(Stat::Max),
        "avg" => Some(Stat::Avg),
        "med" => Some(Stat::Med),
        _ => {
            let p: f64 = s.strip_prefix("p(")?.strip_suffix(')')?.trim().parse().ok()?;
            (0.0..=100.0).contains(&p).then_some(Stat::Percentile(p))
        }
    }
}

fn parse_metric_selector(selector: &str) -> Option<(String, Tags)> {
    let Some(open) = selector.find('{') else {
        return Some((selector.trim().to_string(), Tags::new()));
    };
    let inner = selector[open + 1..].strip_suffix('}')?;
    let mut tags = Tags::new();
    for pair in inner.split(',').filter(|p| !p.trim().is_empty()) {
        let (k, v) = pair.split_once(':')?;
        tags.insert(k.trim().to_string(), v.trim().to_string());
    }
    Some((selector[..open].trim().to_string(), tags))
}
