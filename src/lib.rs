//! Staged HTTP load generation.
//!
//! A run drives a pool of virtual users through an [`Iteration`] while a
//! scheduler ramps the pool along a list of stages. Everything the
//! iterations measure lands in a run-scoped metric [`Registry`], which is
//! frozen into a [`RunSummary`] once the run has drained.

pub mod check;
pub mod config;
pub mod error;
pub mod http;
pub mod load_test;
pub mod metrics;
pub mod output;
pub mod scenario;
pub mod scheduler;
pub mod stats;
pub mod summary;
pub mod thresholds;
pub mod types;
pub mod vu;

pub use check::{CheckRecorder, Checks};
pub use config::Options;
pub use error::{RunAborted, RunError};
pub use http::{HttpClient, HttpResponse, RequestSpec};
pub use load_test::LoadTestExecutor;
pub use metrics::{MetricHandle, MetricKind, Registry};
pub use types::{RunSummary, Stage, Tags};
pub use vu::{Iteration, VuContext};
