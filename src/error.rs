//! Error types for isofilter.

use crate::filter::Job;
use crate::worker::FilterFailure;
use std::time::Duration;
use thiserror::Error;

/// Main error type for isofilter.
#[derive(Error, Debug)]
pub enum IsoError {
    /// The worker did not answer within the configured deadline and was killed.
    #[error("Filter timed out after {timeout:?} processing {job}, worker killed")]
    Timeout { job: Job, timeout: Duration },

    /// The filter failed inside the worker (error, panic, malformed output or crash).
    #[error("Filter failed on {job}: {failure}")]
    Filter { job: Job, failure: FilterFailure },

    #[error("Failed to spawn filter worker: {0}")]
    Spawn(String),

    #[error("Worker error: {0}")]
    Worker(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl IsoError {
    /// True when the error is a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// The failure reported from the worker side, if any.
    pub fn failure(&self) -> Option<&FilterFailure> {
        match self {
            Self::Filter { failure, .. } => Some(failure),
            _ => None,
        }
    }

    /// The job this error is about, for per-job errors.
    pub fn job(&self) -> Option<&Job> {
        match self {
            Self::Timeout { job, .. } | Self::Filter { job, .. } => Some(job),
            _ => None,
        }
    }

    /// Short stable label for logs and machine-readable output.
    pub fn as_label(&self) -> &'static str {
        match self {
            Self::Timeout { .. } => "timeout",
            Self::Filter { failure, .. } => failure.kind.as_label(),
            Self::Spawn(_) => "spawn",
            Self::Worker(_) => "worker",
            Self::Io(_) => "io",
            Self::Json(_) => "json",
        }
    }
}

/// Result type alias for isofilter operations.
pub type Result<T> = std::result::Result<T, IsoError>;
