//! VU scheduling against a staged ramp profile.
//!
//! The scheduler wakes up every tick, interpolates the target VU count for the
//! elapsed time and reconciles the live pool with it: new VUs take the lowest
//! free index, surplus VUs (highest index first) are asked to stop after their
//! current iteration. Iterations are never interrupted while the run is
//! ramping. Once the last stage is over, or the run aborts, the scheduler
//! drains: no new iterations start and in-flight ones get the grace period to
//! finish.

use crate::check::CheckRecorder;
use crate::error::MetricError;
use crate::http::{HttpClient, TimingConnector};
use crate::metrics::{
    MetricHandle, MetricKind, Registry, ITERATIONS, ITERATION_DURATION, ITERATION_ERRORS, VUS,
    VUS_MAX,
};
use crate::stats::Statistics;
use crate::types::{format_duration, Stage, Tags, TimeSeriesPoint};
use crate::vu::{Iteration, VuContext};
use futures::FutureExt;
use log::{debug, info, warn};
use std::any::Any;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

/// Piecewise-linear target VU count over elapsed run time.
#[derive(Debug, Clone, PartialEq)]
pub struct RampProfile {
    stages: Vec<Stage>,
}

impl RampProfile {
    pub fn new(stages: Vec<Stage>) -> Self {
        Self { stages }
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn total_duration(&self) -> Duration {
        self.stages.iter().map(|s| s.duration).sum()
    }

    pub fn max_target(&self) -> u64 {
        self.stages.iter().map(|s| s.target).max().unwrap_or(0)
    }

    /// Target at `elapsed`: a linear ramp from the previous stage's target
    /// (0 before the first stage) to the current one, rounded to the nearest
    /// VU. Zero-length stages jump. Past the end the last target holds.
    pub fn target_at(&self, elapsed: Duration) -> u64 {
        let mut stage_start = Duration::ZERO;
        let mut previous = 0u64;
        for stage in &self.stages {
            if elapsed < stage_start + stage.duration {
                let progress = (elapsed - stage_start).as_secs_f64() / stage.duration.as_secs_f64();
                let from = previous as f64;
                let to = stage.target as f64;
                return (from + (to - from) * progress).round() as u64;
            }
            stage_start += stage.duration;
            previous = stage.target;
        }
        previous
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum RunPhase {
    NotStarted = 0,
    RampingStages = 1,
    Draining = 2,
    Finished = 3,
}

impl RunPhase {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => RunPhase::NotStarted,
            1 => RunPhase::RampingStages,
            2 => RunPhase::Draining,
            _ => RunPhase::Finished,
        }
    }
}

/// State shared between the scheduler and every VU task.
pub struct RunState {
    phase: AtomicU8,
    abort_reason: Mutex<Option<String>>,
    abort_notify: Notify,
    abort_after: Option<u64>,
    consecutive_failures: AtomicU64,
    window: Mutex<Statistics>,
    registry: Arc<Registry>,
    iterations: MetricHandle,
    iteration_duration: MetricHandle,
    iteration_errors: MetricHandle,
}

impl RunState {
    /// `abort_after` is the number of consecutive failed iterations the run
    /// tolerates; one more aborts it.
    pub fn new(registry: Arc<Registry>, abort_after: Option<u64>) -> Result<Self, MetricError> {
        Ok(Self {
            phase: AtomicU8::new(RunPhase::NotStarted as u8),
            abort_reason: Mutex::new(None),
            abort_notify: Notify::new(),
            abort_after,
            consecutive_failures: AtomicU64::new(0),
            window: Mutex::new(Statistics::new()),
            iterations: registry.register(ITERATIONS, MetricKind::Counter)?,
            iteration_duration: registry.register(ITERATION_DURATION, MetricKind::Trend)?,
            iteration_errors: registry.register(ITERATION_ERRORS, MetricKind::Counter)?,
            registry,
        })
    }

    pub fn phase(&self) -> RunPhase {
        RunPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    fn set_phase(&self, phase: RunPhase) {
        self.phase.store(phase as u8, Ordering::Release);
    }

    fn accepts_iterations(&self) -> bool {
        self.phase() == RunPhase::RampingStages && !self.is_aborted()
    }

    pub fn is_aborted(&self) -> bool {
        self.abort_reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub fn abort_reason(&self) -> Option<String> {
        self.abort_reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Stops scheduling new iterations. The first reason wins.
    pub fn abort(&self, reason: String) {
        let mut current = self.abort_reason.lock().unwrap_or_else(PoisonError::into_inner);
        if current.is_none() {
            warn!("🛑 Aborting run: {}", reason);
            *current = Some(reason);
            self.abort_notify.notify_one();
        }
    }

    fn iteration_finished(&self, succeeded: bool, duration: Duration) {
        let tags = Tags::new();
        self.registry.add(&self.iterations, 1.0, &tags);
        self.registry
            .add(&self.iteration_duration, duration.as_secs_f64() * 1000.0, &tags);

        {
            let mut window = self.window.lock().unwrap_or_else(PoisonError::into_inner);
            if succeeded {
                window.record_success(duration);
            } else {
                window.record_failure(duration);
            }
        }

        if succeeded {
            self.consecutive_failures.store(0, Ordering::Release);
            return;
        }

        self.registry.add(&self.iteration_errors, 1.0, &tags);
        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        if let Some(limit) = self.abort_after {
            if failures > limit {
                self.abort(format!(
                    "{} consecutive iteration failures exceeded the limit of {}",
                    failures, limit
                ));
            }
        }
    }

    fn take_point(
        &self,
        elapsed: Duration,
        window: Duration,
        vus: u64,
        target: u64,
    ) -> TimeSeriesPoint {
        self.window
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take_point(elapsed, window, vus, target)
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub tick: Duration,
    pub max_vus: u64,
    pub grace_period: Duration,
    pub http_timeout: Duration,
}

/// Shared sinks and resources every VU is created from.
#[derive(Clone)]
pub struct SharedRun {
    pub registry: Arc<Registry>,
    pub checks: Arc<CheckRecorder>,
    pub connector: TimingConnector,
    pub state: Arc<RunState>,
}

impl SharedRun {
    pub fn vu_context(&self, id: u64, http_timeout: Duration) -> VuContext {
        let http = HttpClient::new(self.connector.clone(), Arc::clone(&self.registry), http_timeout);
        VuContext::new(id, http, Arc::clone(&self.registry), Arc::clone(&self.checks))
    }
}

struct VuHandle {
    stop: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl VuHandle {
    fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    fn resume(&self) {
        self.stop.store(false, Ordering::Release);
    }

    fn is_stopping(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }
}

#[derive(Debug, Default)]
pub struct SchedulerReport {
    pub time_series: Vec<TimeSeriesPoint>,
    /// VUs still inside an iteration when the grace period ran out.
    pub interrupted_vus: usize,
}

pub struct Scheduler {
    profile: RampProfile,
    settings: SchedulerSettings,
    iteration: Arc<dyn Iteration>,
    shared: SharedRun,
    vus: BTreeMap<u64, VuHandle>,
    progress: Option<mpsc::UnboundedSender<TimeSeriesPoint>>,
    vus_gauge: MetricHandle,
}

impl Scheduler {
    pub fn new(
        profile: RampProfile,
        settings: SchedulerSettings,
        iteration: Arc<dyn Iteration>,
        shared: SharedRun,
    ) -> Result<Self, MetricError> {
        let vus_gauge = shared.registry.register(VUS, MetricKind::Gauge)?;
        let vus_max = shared.registry.register(VUS_MAX, MetricKind::Gauge)?;
        shared
            .registry
            .add(&vus_max, settings.max_vus as f64, &Tags::new());
        Ok(Self {
            profile,
            settings,
            iteration,
            shared,
            vus: BTreeMap::new(),
            progress: None,
            vus_gauge,
        })
    }

    /// Every progress point is also sent here as it is taken.
    pub fn with_progress(mut self, progress: mpsc::UnboundedSender<TimeSeriesPoint>) -> Self {
        self.progress = Some(progress);
        self
    }

    pub async fn run(mut self) -> SchedulerReport {
        let state = Arc::clone(&self.shared.state);
        let start = Instant::now();
        let end = start + self.profile.total_duration();
        let mut time_series = Vec::new();
        let mut last_point = start;

        state.set_phase(RunPhase::RampingStages);
        info!(
            "🎯 Ramping through {} stages over {} (max {} VUs)",
            self.profile.stages().len(),
            format_duration(self.profile.total_duration()),
            self.settings.max_vus
        );

        loop {
            let now = Instant::now();
            if now >= end || state.is_aborted() {
                break;
            }

            let elapsed = now - start;
            let target = self.profile.target_at(elapsed).min(self.settings.max_vus);
            self.reconcile(target);

            let live = self.live_vus();
            self.shared
                .registry
                .add(&self.vus_gauge, live as f64, &Tags::new());
            let point = state.take_point(elapsed, now - last_point, live, target);
            last_point = now;
            debug!(
                "⏱️ {:.1}s: {} VUs (target {}), {:.1} it/s",
                point.elapsed_secs, point.vus, point.target_vus, point.iterations_per_second
            );
            if let Some(progress) = &self.progress {
                let _ = progress.send(point.clone());
            }
            time_series.push(point);

            let next = (now + self.settings.tick).min(end);
            tokio::select! {
                _ = tokio::time::sleep_until(next.into()) => {}
                _ = state.abort_notify.notified() => {}
            }
        }

        let interrupted_vus = self.drain().await;
        self.shared.registry.add(&self.vus_gauge, 0.0, &Tags::new());
        state.set_phase(RunPhase::Finished);

        SchedulerReport {
            time_series,
            interrupted_vus,
        }
    }

    fn live_vus(&self) -> u64 {
        self.vus.values().filter(|vu| !vu.is_stopping()).count() as u64
    }

    fn reconcile(&mut self, target: u64) {
        self.vus.retain(|id, vu| {
            let running = !vu.task.is_finished();
            if !running {
                debug!("VU {} torn down", id);
            }
            running
        });

        let live: Vec<u64> = self
            .vus
            .iter()
            .filter(|(_, vu)| !vu.is_stopping())
            .map(|(id, _)| *id)
            .collect();
        let live_count = live.len() as u64;

        if live_count < target {
            // Stopping VUs still hold their slot until the last iteration
            // ends, so they are resumed before any new VU is spawned.
            let mut missing = target - live_count;
            for (id, vu) in self.vus.iter().filter(|(_, vu)| vu.is_stopping()) {
                if missing == 0 {
                    break;
                }
                debug!("VU {} resumed", id);
                vu.resume();
                missing -= 1;
            }

            let mut id = 1;
            while missing > 0 && (self.vus.len() as u64) < self.settings.max_vus {
                while self.vus.contains_key(&id) {
                    id += 1;
                }
                self.spawn_vu(id);
                missing -= 1;
            }
        } else if live_count > target {
            for id in live.iter().rev().take((live_count - target) as usize) {
                if let Some(vu) = self.vus.get(id) {
                    debug!("VU {} asked to stop", id);
                    vu.stop();
                }
            }
        }
    }

    fn spawn_vu(&mut self, id: u64) {
        let context = self.shared.vu_context(id, self.settings.http_timeout);
        let stop = Arc::new(AtomicBool::new(false));
        let task = tokio::spawn(run_vu(
            context,
            Arc::clone(&self.iteration),
            Arc::clone(&stop),
            Arc::clone(&self.shared.state),
        ));
        debug!("VU {} started", id);
        self.vus.insert(id, VuHandle { stop, task });
    }

    /// Lets in-flight iterations finish within the grace period and returns
    /// how many VUs had to be cut off.
    async fn drain(&mut self) -> usize {
        self.shared.state.set_phase(RunPhase::Draining);
        for vu in self.vus.values() {
            vu.stop();
        }

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut self.vus)
            .into_values()
            .map(|vu| vu.task)
            .collect();
        if tasks.is_empty() {
            return 0;
        }
        info!(
            "⏳ Draining {} VUs (grace period {})",
            tasks.len(),
            format_duration(self.settings.grace_period)
        );

        let deadline = tokio::time::Instant::now() + self.settings.grace_period;
        let mut interrupted = 0;
        for mut task in tasks {
            if tokio::time::timeout_at(deadline, &mut task).await.is_err() {
                task.abort();
                interrupted += 1;
            }
        }
        if interrupted > 0 {
            warn!(
                "⚠️ {} VUs were still running after the grace period and were interrupted",
                interrupted
            );
        }
        interrupted
    }
}

async fn run_vu(
    mut vu: VuContext,
    iteration: Arc<dyn Iteration>,
    stop: Arc<AtomicBool>,
    state: Arc<RunState>,
) {
    while !stop.load(Ordering::Acquire) && state.accepts_iterations() {
        vu.begin_iteration();
        let started = Instant::now();
        let outcome = AssertUnwindSafe(iteration.run(&mut vu)).catch_unwind().await;
        let duration = started.elapsed();

        let result = outcome.unwrap_or_else(|panic| {
            Err(anyhow::anyhow!("iteration panicked: {}", panic_message(panic.as_ref())))
        });
        if let Err(e) = &result {
            warn!("VU {} iteration {} failed: {:#}", vu.id(), vu.iteration(), e);
        }
        state.iteration_finished(result.is_ok(), duration);

        tokio::task::yield_now().await;
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Stat;
    use async_trait::async_trait;

    fn stage(millis: u64, target: u64) -> Stage {
        Stage::new(Duration::from_millis(millis), target)
    }

    #[test]
    fn test_target_ramps_linearly() {
        let profile = RampProfile::new(vec![stage(10_000, 5), stage(5_000, 5), stage(5_000, 0)]);
        let at = |secs: f64| profile.target_at(Duration::from_secs_f64(secs));

        assert_eq!(at(0.0), 0);
        assert_eq!(at(2.0), 1);
        assert_eq!(at(5.0), 3);
        assert_eq!(at(10.0), 5);
        assert_eq!(at(12.5), 5);
        assert_eq!(at(17.5), 3);
        assert_eq!(at(20.0), 0);
        assert_eq!(at(99.0), 0);
        assert_eq!(profile.total_duration(), Duration::from_secs(20));
        assert_eq!(profile.max_target(), 5);
    }

    #[test]
    fn test_zero_duration_stage_jumps() {
        let profile = RampProfile::new(vec![stage(0, 10), stage(1_000, 10)]);
        assert_eq!(profile.target_at(Duration::ZERO), 10);
        assert_eq!(profile.target_at(Duration::from_millis(500)), 10);
    }

    #[test]
    fn test_ramp_down_from_previous_target() {
        let profile = RampProfile::new(vec![stage(0, 8), stage(4_000, 0)]);
        assert_eq!(profile.target_at(Duration::from_secs(1)), 6);
        assert_eq!(profile.target_at(Duration::from_secs(3)), 2);
    }

    struct Sleeper(Duration);

    #[async_trait]
    impl Iteration for Sleeper {
        async fn run(&self, vu: &mut VuContext) -> anyhow::Result<()> {
            tokio::time::sleep(self.0).await;
            let done = vu.metric("done", MetricKind::Counter)?;
            vu.add(&done, 1.0, &Tags::new());
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

    struct Panics;

    #[async_trait]
    impl Iteration for Panics {
        async fn run(&self, vu: &mut VuContext) -> anyhow::Result<()> {
            if vu.iteration() == 1 {
                panic!("first iteration explodes");
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok(())
        }
    }

    fn shared(abort_after: Option<u64>) -> SharedRun {
        let registry = Arc::new(Registry::new());
        SharedRun {
            checks: Arc::new(CheckRecorder::new(Arc::clone(&registry))),
            connector: TimingConnector::new().unwrap(),
            state: Arc::new(RunState::new(Arc::clone(&registry), abort_after).unwrap()),
            registry,
        }
    }

    fn settings(tick_ms: u64, max_vus: u64) -> SchedulerSettings {
        SchedulerSettings {
            tick: Duration::from_millis(tick_ms),
            max_vus,
            grace_period: Duration::from_secs(5),
            http_timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn test_live_vus_track_target() {
        let profile = RampProfile::new(vec![stage(200, 4), stage(200, 4), stage(200, 0)]);
        let shared = shared(None);
        let scheduler = Scheduler::new(
            profile.clone(),
            settings(20, 4),
            Arc::new(Sleeper(Duration::from_millis(5))),
            shared.clone(),
        )
        .unwrap();

        let report = scheduler.run().await;

        assert!(!report.time_series.is_empty());
        for point in &report.time_series {
            let expected = profile.target_at(Duration::from_secs_f64(point.elapsed_secs));
            assert!(point.vus.abs_diff(point.target_vus) <= 1, "{:?}", point);
            assert!(point.target_vus.abs_diff(expected) <= 1, "{:?}", point);
        }
        assert!(report.time_series.iter().any(|p| p.vus == 4));
        assert_eq!(shared.state.phase(), RunPhase::Finished);
        assert_eq!(shared.registry.stat(VUS, Stat::Value), Some(0.0));
        assert_eq!(shared.registry.stat(VUS_MAX, Stat::Value), Some(4.0));
    }

    #[tokio::test]
    async fn test_in_flight_iteration_finishes_during_drain() {
        let profile = RampProfile::new(vec![stage(0, 1), stage(100, 1)]);
        let shared = shared(None);
        let scheduler = Scheduler::new(
            profile,
            settings(10, 1),
            Arc::new(Sleeper(Duration::from_millis(300))),
            shared.clone(),
        )
        .unwrap();

        let report = scheduler.run().await;

        assert_eq!(report.interrupted_vus, 0);
        assert_eq!(shared.registry.stat("done", Stat::Sum), Some(1.0));
        assert_eq!(shared.registry.stat(ITERATIONS, Stat::Sum), Some(1.0));
    }

    #[tokio::test]
    async fn test_grace_period_cuts_off_slow_iterations() {
        let profile = RampProfile::new(vec![stage(0, 2), stage(50, 2)]);
        let shared = shared(None);
        let mut settings = settings(10, 2);
        settings.grace_period = Duration::from_millis(50);
        let scheduler = Scheduler::new(
            profile,
            settings,
            Arc::new(Sleeper(Duration::from_secs(10))),
            shared.clone(),
        )
        .unwrap();

        let report = scheduler.run().await;

        assert_eq!(report.interrupted_vus, 2);
        assert_eq!(shared.registry.stat("done", Stat::Sum), None);
    }

    #[tokio::test]
    async fn test_consecutive_failures_abort_the_run() {
        let profile = RampProfile::new(vec![stage(0, 1), stage(10_000, 1)]);
        let shared = shared(Some(3));
        let scheduler =
            Scheduler::new(profile, settings(10, 1), Arc::new(AlwaysFails), shared.clone()).unwrap();

        let started = Instant::now();
        scheduler.run().await;

        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(shared.state.is_aborted());
        assert_eq!(shared.registry.stat(ITERATIONS, Stat::Sum), Some(4.0));
        assert_eq!(shared.registry.stat(ITERATION_ERRORS, Stat::Sum), Some(4.0));
    }

    #[tokio::test]
    async fn test_panicking_iteration_does_not_kill_the_vu() {
        let profile = RampProfile::new(vec![stage(0, 1), stage(100, 1)]);
        let shared = shared(None);
        let scheduler =
            Scheduler::new(profile, settings(10, 1), Arc::new(Panics), shared.clone()).unwrap();

        scheduler.run().await;

        assert_eq!(shared.registry.stat(ITERATION_ERRORS, Stat::Sum), Some(1.0));
        assert!(shared.registry.stat(ITERATIONS, Stat::Sum).unwrap() > 1.0);
    }

    #[tokio::test]
    async fn test_max_vus_caps_the_pool() {
        let profile = RampProfile::new(vec![stage(0, 10), stage(60, 10)]);
        let shared = shared(None);
        let scheduler = Scheduler::new(
            profile,
            settings(10, 3),
            Arc::new(Sleeper(Duration::from_millis(5))),
            shared,
        )
        .unwrap();

        let report = scheduler.run().await;
        assert!(report.time_series.iter().all(|p| p.vus <= 3));
    }

    #[derive(Default)]
    struct Concurrency {
        running: AtomicU64,
        peak: AtomicU64,
        highest_id: AtomicU64,
    }

    #[async_trait]
    impl Iteration for Arc<Concurrency> {
        async fn run(&self, vu: &mut VuContext) -> anyhow::Result<()> {
            let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(running, Ordering::SeqCst);
            self.highest_id.fetch_max(vu.id(), Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(600)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_dip_and_recovery_stays_within_max_vus() {
        let profile = RampProfile::new(vec![
            stage(0, 3),
            stage(100, 3),
            stage(0, 2),
            stage(100, 2),
            stage(0, 3),
            stage(200, 3),
        ]);
        let concurrency = Arc::new(Concurrency::default());
        let scheduler = Scheduler::new(
            profile,
            settings(10, 3),
            Arc::new(Arc::clone(&concurrency)),
            shared(None),
        )
        .unwrap();

        let report = scheduler.run().await;

        assert_eq!(report.interrupted_vus, 0);
        assert_eq!(concurrency.peak.load(Ordering::SeqCst), 3);
        assert!(concurrency.highest_id.load(Ordering::SeqCst) <= 3);
        assert!(report.time_series.iter().all(|p| p.vus <= 3));
    }
}
