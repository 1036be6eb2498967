//! Where run results go: progress points while the run is live and the final
//! summary at the end. Output failures are logged by the caller and never
//! fail the run.

mod amqp;
mod prometheus;

pub use amqp::AmqpOutput;
pub use prometheus::{render_exposition, PrometheusFileOutput, PushgatewayOutput};

use crate::config::Options;
use crate::error::ConfigError;
use crate::summary;
use crate::types::{MetricSummary, RunSummary, TimeSeriesPoint};
use anyhow::Context;
use async_trait::async_trait;
use log::info;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

#[async_trait]
pub trait Output: Send + Sync {
    fn description(&self) -> String;

    async fn start(&self, _run_id: Uuid) -> anyhow::Result<()> {
        Ok(())
    }

    async fn publish_progress(&self, _point: &TimeSeriesPoint) -> anyhow::Result<()> {
        Ok(())
    }

    /// How often the output wants the metrics recorded so far while the run
    /// is live. `None` means only the final summary.
    fn snapshot_interval(&self) -> Option<Duration> {
        None
    }

    async fn publish_snapshot(
        &self,
        _metrics: &BTreeMap<String, MetricSummary>,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    async fn finish(&self, summary: &RunSummary) -> anyhow::Result<()>;
}

/// Prints the text summary to stdout.
pub struct ConsoleOutput;

#[async_trait]
impl Output for ConsoleOutput {
    fn description(&self) -> String {
        "console".to_string()
    }

    async fn finish(&self, summary: &RunSummary) -> anyhow::Result<()> {
        println!("{}", summary::render(summary));
        Ok(())
    }
}

/// Writes the summary as pretty-printed JSON.
pub struct JsonFileOutput {
    path: PathBuf,
}

impl JsonFileOutput {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl Output for JsonFileOutput {
    fn description(&self) -> String {
        format!("json ({})", self.path.display())
    }

    async fn finish(&self, summary: &RunSummary) -> anyhow::Result<()> {
        let payload = serde_json::to_vec_pretty(summary)?;
        tokio::fs::write(&self.path, payload)
            .await
            .with_context(|| format!("failed to write {}", self.path.display()))?;
        info!("💾 Summary written to {}", self.path.display());
        Ok(())
    }
}

/// The outputs the options ask for, console first.
pub fn from_options(options: &Options) -> Result<Vec<Box<dyn Output>>, ConfigError> {
    let mut outputs: Vec<Box<dyn Output>> = vec![Box::new(ConsoleOutput)];
    if let Some(path) = &options.summary_export {
        outputs.push(Box::new(JsonFileOutput::new(path)));
    }
    if let Some(path) = &options.prometheus_export {
        outputs.push(Box::new(PrometheusFileOutput::new(path, options.trend_stats()?)));
    }
    if let Some(url) = &options.pushgateway_url {
        outputs.push(Box::new(PushgatewayOutput::from_options(url, options)?));
    }
    if let Some(url) = &options.amqp_url {
        outputs.push(Box::new(AmqpOutput::new(url, &options.amqp_queue)));
    }
    Ok(outputs)
}
