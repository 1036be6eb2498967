use crate::metrics::MetricKind;
use crate::types::RunSummary;
use thiserror::Error;

/// Problems detected before a run starts. These are always fatal.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid stage {0:?}, expected <duration>:<target>")]
    InvalidStage(String),

    #[error("at least one stage is required")]
    NoStages,

    #[error("invalid threshold {expression:?} for metric {metric:?}: {reason}")]
    InvalidThreshold {
        metric: String,
        expression: String,
        reason: String,
    },

    #[error("invalid value {value:?} for {name}: {reason}")]
    InvalidValue {
        name: String,
        value: String,
        reason: String,
    },

    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MetricError {
    #[error("metric {name:?} is already registered as {existing}, cannot register it as {requested}")]
    ConflictingMetricKind {
        name: String,
        existing: MetricKind,
        requested: MetricKind,
    },
}

/// Per-exchange failures. They are attached to the response, never raised.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HttpError {
    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out after {0}ms")]
    Timeout(u64),

    #[error("tls error: {0}")]
    Tls(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl HttpError {
    /// Short code used as the `error_code` tag on failed exchanges.
    pub fn code(&self) -> &'static str {
        match self {
            HttpError::Network(_) => "network",
            HttpError::Timeout(_) => "timeout",
            HttpError::Tls(_) => "tls",
            HttpError::InvalidRequest(_) => "invalid_request",
        }
    }
}

#[derive(Debug)]
pub struct RunAborted {
    pub reason: String,
    pub summary: RunSummary,
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The run could not be prepared, e.g. TLS initialisation failed.
    #[error("run setup failed: {0}")]
    Setup(String),

    #[error("run aborted: {}", .0.reason)]
    Aborted(Box<RunAborted>),
}

impl RunError {
    /// The partial summary of an aborted run.
    pub fn summary(&self) -> Option<&RunSummary> {
        match self {
            RunError::Aborted(aborted) => Some(&aborted.summary),
            RunError::Config(_) | RunError::Setup(_) => None,
        }
    }
}
