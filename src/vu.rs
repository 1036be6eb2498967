//! Virtual users and the iteration contract they execute.

use crate::check::{CheckRecorder, Checks};
use crate::error::MetricError;
use crate::http::HttpClient;
use crate::metrics::{MetricHandle, MetricKind, Registry};
use crate::types::Tags;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// User logic run by every VU, over and over, until the run drains.
///
/// `setup` and `teardown` run once per run on a dedicated context, before the
/// first and after the last iteration.
#[async_trait]
pub trait Iteration: Send + Sync {
    async fn setup(&self, _vu: &mut VuContext) -> anyhow::Result<()> {
        Ok(())
    }

    async fn run(&self, vu: &mut VuContext) -> anyhow::Result<()>;

    async fn teardown(&self, _vu: &mut VuContext) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Everything a VU may touch. The HTTP client (connection pool and cookie
/// jar) and the value slots are private to the VU; the registry and check
/// recorder are the run's shared sinks.
pub struct VuContext {
    id: u64,
    iteration: u64,
    http: HttpClient,
    registry: Arc<Registry>,
    checks: Arc<CheckRecorder>,
    values: HashMap<String, f64>,
}

impl VuContext {
    pub fn new(
        id: u64,
        http: HttpClient,
        registry: Arc<Registry>,
        checks: Arc<CheckRecorder>,
    ) -> Self {
        Self {
            id,
            iteration: 0,
            http,
            registry,
            checks,
            values: HashMap::new(),
        }
    }

    /// 1-based VU index; `0` is the setup/teardown context.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Number of iterations this VU has started, counting the current one.
    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    pub(crate) fn begin_iteration(&mut self) {
        self.iteration += 1;
    }

    pub fn http(&self) -> &HttpClient {
        &self.http
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn check<S>(&self, subject: &S, checks: &Checks<'_, S>) -> bool {
        self.checks.check(subject, checks, &Tags::new())
    }

    pub fn metric(&self, name: &str, kind: MetricKind) -> Result<MetricHandle, MetricError> {
        self.registry.register(name, kind)
    }

    pub fn add(&self, handle: &MetricHandle, value: f64, tags: &Tags) {
        self.registry.add(handle, value, tags);
    }

    /// A per-VU value slot that survives across iterations.
    pub fn value(&self, key: &str) -> Option<f64> {
        self.values.get(key).copied()
    }

    pub fn set_value(&mut self, key: &str, value: f64) {
        self.values.insert(key.to_string(), value);
    }
}
