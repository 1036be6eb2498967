use crate::metrics::{MetricKind, Registry, CHECKS};
use crate::types::{CheckTally, ChecksSummary, Tags};
use log::{debug, warn};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// A named assertion over a subject. Returning `Err` counts as a failure.
pub type Predicate<'a, S> = Box<dyn Fn(&S) -> anyhow::Result<bool> + Send + Sync + 'a>;

/// Ordered list of named predicates evaluated by [`CheckRecorder::check`].
pub struct Checks<'a, S> {
    predicates: Vec<(String, Predicate<'a, S>)>,
}

impl<'a, S> Default for Checks<'a, S> {
    fn default() -> Self {
        Self {
            predicates: Vec::new(),
        }
    }
}

impl<'a, S> Checks<'a, S> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<F>(mut self, name: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&S) -> anyhow::Result<bool> + Send + Sync + 'a,
    {
        self.predicates.push((name.into(), Box::new(predicate)));
        self
    }

    /// Shorthand for predicates that cannot fail.
    pub fn that<F>(self, name: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&S) -> bool + Send + Sync + 'a,
    {
        self.with(name, move |s| Ok(predicate(s)))
    }

    pub fn len(&self) -> usize {
        self.predicates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }
}

/// Records check outcomes into the registry and keeps pass/fail tallies.
pub struct CheckRecorder {
    registry: Arc<Registry>,
    passes: AtomicU64,
    fails: AtomicU64,
    by_name: Mutex<BTreeMap<String, CheckTally>>,
}

impl CheckRecorder {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            passes: AtomicU64::new(0),
            fails: AtomicU64::new(0),
            by_name: Mutex::new(BTreeMap::new()),
        }
    }

    /// Evaluates every predicate against `subject`. Returns true only when all
    /// of them passed.
    pub fn check<S>(&self, subject: &S, checks: &Checks<'_, S>, tags: &Tags) -> bool {
        let mut all_passed = true;
        for (name, predicate) in &checks.predicates {
            let passed = match predicate(subject) {
                Ok(passed) => passed,
                Err(e) => {
                    warn!("check {:?} errored, counting it as failed: {}", name, e);
                    false
                }
            };
            self.record(name, passed, tags);
            all_passed &= passed;
        }
        all_passed
    }

    /// Records one outcome for `name`.
    pub fn record(&self, name: &str, passed: bool, tags: &Tags) {
        let value = if passed { 1.0 } else { 0.0 };

        if let Err(e) = self.registry.add_named(name, MetricKind::Rate, value, tags) {
            warn!("check {:?} could not be recorded as its own rate: {}", name, e);
        }

        let mut check_tags = tags.clone();
        check_tags.insert("check".to_string(), name.to_string());
        if let Err(e) = self
            .registry
            .add_named(CHECKS, MetricKind::Rate, value, &check_tags)
        {
            warn!("failed to record check {:?}: {}", name, e);
        }

        if passed {
            self.passes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.fails.fetch_add(1, Ordering::Relaxed);
            debug!("check {:?} failed", name);
        }

        let mut by_name = self.by_name.lock().unwrap_or_else(PoisonError::into_inner);
        let tally = by_name.entry(name.to_string()).or_default();
        if passed {
            tally.passes += 1;
        } else {
            tally.fails += 1;
        }
    }

    pub fn summary(&self) -> ChecksSummary {
        ChecksSummary {
            passes: self.passes.load(Ordering::Relaxed),
            fails: self.fails.load(Ordering::Relaxed),
            by_name: self
                .by_name
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        }
    }
}
