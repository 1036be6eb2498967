use crate::check::CheckRecorder;
use crate::config::Options;
use crate::error::{RunAborted, RunError};
use crate::http::TimingConnector;
use crate::metrics::{Registry, Stat, ITERATIONS};
use crate::output::Output;
use crate::scheduler::{
    RampProfile, RunState, Scheduler, SchedulerReport, SchedulerSettings, SharedRun,
};
use crate::types::{RunStatus, RunSummary, TimeSeriesPoint};
use crate::vu::Iteration;
use chrono::Utc;
use futures::future::join_all;
use log::{info, warn};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

/// Runs one load test end to end: validation, setup, the staged ramp,
/// draining, teardown, thresholds and outputs.
pub struct LoadTestExecutor {
    options: Options,
    iteration: Arc<dyn Iteration>,
    outputs: Vec<Box<dyn Output>>,
}

impl LoadTestExecutor {
    pub fn new(options: Options, iteration: Arc<dyn Iteration>) -> Self {
        Self {
            options,
            iteration,
            outputs: Vec::new(),
        }
    }

    pub fn with_output(mut self, output: Box<dyn Output>) -> Self {
        self.outputs.push(output);
        self
    }

    pub fn with_outputs(mut self, outputs: Vec<Box<dyn Output>>) -> Self {
        self.outputs.extend(outputs);
        self
    }

    /// Returns the summary of a completed run, failing thresholds included.
    /// An aborted run returns [`RunError::Aborted`] carrying the partial
    /// summary.
    pub async fn execute(self) -> Result<RunSummary, RunError> {
        let thresholds = self.options.validate()?;

        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let start_time = Instant::now();

        let registry = Arc::new(Registry::new());
        let checks = Arc::new(CheckRecorder::new(Arc::clone(&registry)));
        let connector = TimingConnector::new()
            .map_err(|e| RunError::Setup(format!("failed to initialise TLS: {}", e)))?;
        let state = Arc::new(
            RunState::new(
                Arc::clone(&registry),
                self.options.abort_on_consecutive_failures,
            )
            .map_err(|e| RunError::Setup(e.to_string()))?,
        );
        let shared = SharedRun {
            registry: Arc::clone(&registry),
            checks: Arc::clone(&checks),
            connector,
            state: Arc::clone(&state),
        };

        info!(
            "🧪 Starting load test {}: {} stages, {} total, max {} VUs",
            run_id,
            self.options.stages.len(),
            crate::types::format_duration(self.options.total_duration()),
            self.options.max_vus()
        );
        for output in &self.outputs {
            if let Err(e) = output.start(run_id).await {
                warn!("⚠️ Output {} failed to start: {:#}", output.description(), e);
            }
        }

        let mut setup_vu = shared.vu_context(0, self.options.http_timeout);
        let set_up = match self.iteration.setup(&mut setup_vu).await {
            Ok(()) => true,
            Err(e) => {
                state.abort(format!("setup failed: {:#}", e));
                false
            }
        };

        let report = if set_up {
            let scheduler = Scheduler::new(
                RampProfile::new(self.options.stages.clone()),
                SchedulerSettings {
                    tick: self.options.tick,
                    max_vus: self.options.max_vus(),
                    grace_period: self.options.grace_period,
                    http_timeout: self.options.http_timeout,
                },
                Arc::clone(&self.iteration),
                shared,
            )
            .map_err(|e| RunError::Setup(e.to_string()))?;

            let (progress_tx, progress_rx) = mpsc::unbounded_channel();
            let (done_tx, done_rx) = watch::channel(false);
            let percentiles = self.options.percentiles();
            let (report, (), ()) = tokio::join!(
                async move {
                    let report = scheduler.with_progress(progress_tx).run().await;
                    let _ = done_tx.send(true);
                    report
                },
                forward_progress(&self.outputs, progress_rx),
                publish_snapshots(&self.outputs, &registry, &percentiles, done_rx)
            );

            if let Err(e) = self.iteration.teardown(&mut setup_vu).await {
                warn!("⚠️ Teardown failed: {:#}", e);
            }
            report
        } else {
            SchedulerReport::default()
        };

        if report.interrupted_vus > 0 {
            warn!(
                "⚠️ {} VUs were still running when the grace period ended",
                report.interrupted_vus
            );
        }

        let abort_reason = state.abort_reason();
        let summary = RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            duration_secs: start_time.elapsed().as_secs_f64(),
            status: if abort_reason.is_some() {
                RunStatus::Aborted
            } else {
                RunStatus::Completed
            },
            metrics: registry.snapshot(&self.options.percentiles()),
            checks: checks.summary(),
            thresholds: thresholds.iter().map(|t| t.evaluate(&registry)).collect(),
            time_series_data: report.time_series,
        };

        info!(
            "✅ Test finished: {} iterations in {:.2}s",
            registry.stat(ITERATIONS, Stat::Count).unwrap_or(0.0) as u64,
            summary.duration_secs
        );
        for t in summary.thresholds.iter().filter(|t| !t.passed) {
            warn!("❌ Threshold {} {} failed", t.metric, t.expression);
        }

        for output in &self.outputs {
            if let Err(e) = output.finish(&summary).await {
                warn!("⚠️ Output {} failed: {:#}", output.description(), e);
            }
        }

        match abort_reason {
            Some(reason) => Err(RunError::Aborted(Box::new(RunAborted { reason, summary }))),
            None => Ok(summary),
        }
    }
}

async fn forward_progress(
    outputs: &[Box<dyn Output>],
    mut progress: mpsc::UnboundedReceiver<TimeSeriesPoint>,
) {
    while let Some(point) = progress.recv().await {
        for output in outputs {
            if let Err(e) = output.publish_progress(&point).await {
                warn!(
                    "⚠️ Output {} failed to publish progress: {:#}",
                    output.description(),
                    e
                );
            }
        }
    }
}

/// Feeds every output that asks for it the metrics recorded so far, at its
/// own interval, until `done` flips.
async fn publish_snapshots(
    outputs: &[Box<dyn Output>],
    registry: &Registry,
    percentiles: &[f64],
    done: watch::Receiver<bool>,
) {
    let loops = outputs.iter().filter_map(|output| {
        let period = output.snapshot_interval()?;
        let mut done = done.clone();
        Some(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let metrics = registry.snapshot(percentiles);
                        if let Err(e) = output.publish_snapshot(&metrics).await {
                            warn!(
                                "⚠️ Output {} failed to publish a snapshot: {:#}",
                                output.description(),
                                e
                            );
                        }
                    }
                    _ = done.changed() => break,
                }
            }
        })
    });
    join_all(loops).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::check::Checks;
    use crate::error::ConfigError;
    use crate::http::HttpResponse;
    use crate::metrics::HTTP_REQS;
    use crate::types::{MetricSummary, SeriesSummary, Stage};
    use crate::vu::VuContext;
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use std::time::Duration;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct GetAndCheck {
        url: String,
    }

    #[async_trait]
    impl Iteration for GetAndCheck {
        async fn run(&self, vu: &mut VuContext) -> anyhow::Result<()> {
            let response = vu.http().get(&self.url).await;
            vu.check(
                &response,
                &Checks::new().that("status is 200", |r: &HttpResponse| r.status() == 200),
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(())
        }
    }

    struct AlwaysFails;

    #[async_trait]
    impl Iteration for AlwaysFails {
        async fn run(&self, _vu: &mut VuContext) -> anyhow::Result<()> {
            anyhow::bail!("boom")
        }
    }

    struct BrokenSetup;

    #[async_trait]
    impl Iteration for BrokenSetup {
        async fn setup(&self, _vu: &mut VuContext) -> anyhow::Result<()> {
            anyhow::bail!("no fixtures")
        }

        async fn run(&self, _vu: &mut VuContext) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct Recording {
        events: Arc<Mutex<Vec<String>>>,
        snapshot_every: Option<Duration>,
    }

    #[async_trait]
    impl Output for Recording {
        fn description(&self) -> String {
            "recording".to_string()
        }

        async fn start(&self, _run_id: Uuid) -> anyhow::Result<()> {
            self.events.lock().unwrap().push("start".into());
            Ok(())
        }

        async fn publish_progress(&self, _point: &TimeSeriesPoint) -> anyhow::Result<()> {
            self.events.lock().unwrap().push("progress".into());
            Ok(())
        }

        fn snapshot_interval(&self) -> Option<Duration> {
            self.snapshot_every
        }

        async fn publish_snapshot(
            &self,
            metrics: &BTreeMap<String, MetricSummary>,
        ) -> anyhow::Result<()> {
            assert!(metrics.contains_key(ITERATIONS));
            self.events.lock().unwrap().push("snapshot".into());
            Ok(())
        }

        async fn finish(&self, _summary: &RunSummary) -> anyhow::Result<()> {
            self.events.lock().unwrap().push("finish".into());
            Ok(())
        }
    }

    fn options(stages: Vec<Stage>) -> Options {
        Options {
            stages,
            tick: Duration::from_millis(50),
            grace_period: Duration::from_secs(2),
            http_timeout: Duration::from_secs(2),
            ..Options::default()
        }
    }

    fn ms(millis: u64) -> Duration {
        Duration::from_millis(millis)
    }

    #[tokio::test]
    async fn test_completed_run_produces_summary() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;

        let mut opts = options(vec![Stage::new(ms(0), 2), Stage::new(ms(400), 2)]);
        opts.thresholds
            .insert("checks".into(), vec!["rate==1".into()]);
        opts.thresholds
            .insert("http_req_duration".into(), vec!["p(95)<2000".into()]);

        let events = Arc::new(Mutex::new(Vec::new()));
        let summary = LoadTestExecutor::new(opts, Arc::new(GetAndCheck { url: server.uri() }))
            .with_output(Box::new(Recording {
                events: Arc::clone(&events),
                snapshot_every: Some(ms(100)),
            }))
            .execute()
            .await
            .unwrap();

        assert_eq!(summary.status, RunStatus::Completed);
        let iterations = match summary.metric(ITERATIONS) {
            Some(SeriesSummary::Counter { count, .. }) => *count,
            other => panic!("unexpected iterations summary {:?}", other),
        };
        assert!(iterations > 0);
        assert!(matches!(
            summary.metric(HTTP_REQS),
            Some(SeriesSummary::Counter { count, .. }) if *count == iterations
        ));
        assert_eq!(summary.checks.passes, iterations);
        assert_eq!(summary.checks.fails, 0);
        assert!(summary.thresholds_passed());
        assert!(!summary.time_series_data.is_empty());

        let events = events.lock().unwrap();
        assert_eq!(events.first().map(String::as_str), Some("start"));
        assert_eq!(events.last().map(String::as_str), Some("finish"));
        assert!(events.iter().any(|e| e == "progress"));
        assert!(events.iter().filter(|e| *e == "snapshot").count() >= 2);
    }

    #[tokio::test]
    async fn test_failed_threshold_still_returns_summary() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let mut opts = options(vec![Stage::new(ms(0), 1), Stage::new(ms(200), 1)]);
        opts.thresholds
            .insert("http_req_failed".into(), vec!["rate<0.01".into()]);

        let summary = LoadTestExecutor::new(opts, Arc::new(GetAndCheck { url: server.uri() }))
            .execute()
            .await
            .unwrap();

        assert!(!summary.thresholds_passed());
        assert_eq!(summary.thresholds[0].observed, Some(1.0));
        assert_eq!(summary.checks.passes, 0);
    }

    #[tokio::test]
    async fn test_consecutive_failures_abort_with_partial_summary() {
        let mut opts = options(vec![Stage::new(ms(0), 1), Stage::new(Duration::from_secs(10), 1)]);
        opts.abort_on_consecutive_failures = Some(3);

        let started = Instant::now();
        let err = LoadTestExecutor::new(opts, Arc::new(AlwaysFails))
            .execute()
            .await
            .unwrap_err();

        assert!(started.elapsed() < Duration::from_secs(5));
        let summary = err.summary().expect("aborted runs carry a summary");
        assert_eq!(summary.status, RunStatus::Aborted);
        assert_eq!(
            summary.metric(ITERATIONS),
            Some(&SeriesSummary::Counter { count: 4, sum: 4.0 })
        );
        match err {
            RunError::Aborted(aborted) => assert!(aborted.reason.contains("consecutive")),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_setup_failure_aborts_before_any_iteration() {
        let err = LoadTestExecutor::new(options(vec![Stage::new(ms(100), 1)]), Arc::new(BrokenSetup))
            .execute()
            .await
            .unwrap_err();

        let summary = err.summary().unwrap();
        assert_eq!(summary.status, RunStatus::Aborted);
        assert_eq!(
            summary.metric(ITERATIONS),
            Some(&SeriesSummary::Counter { count: 0, sum: 0.0 })
        );
        assert!(err.to_string().contains("no fixtures"));
    }

    #[tokio::test]
    async fn test_invalid_options_fail_before_start() {
        let err = LoadTestExecutor::new(options(Vec::new()), Arc::new(AlwaysFails))
            .execute()
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::Config(ConfigError::NoStages)));
        assert!(err.summary().is_none());
    }
}
