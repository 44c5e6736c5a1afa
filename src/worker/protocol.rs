//! IPC protocol for worker subprocess communication.
//!
//! Messages are JSON-serialized and newline-delimited. JSON string escaping
//! keeps field values containing NUL bytes or newlines intact on the wire.

use crate::filter::{Fields, Job};
use crate::memory::MemorySize;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Request from supervisor to worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WorkRequest {
    /// First message to a new worker: the filter to load and its limits.
    /// Answered with `Ready`, or with a failure when the filter cannot be
    /// rebuilt from `filter`.
    #[serde(rename = "start")]
    Start {
        filter: serde_json::Value,
        #[serde(default)]
        memory_limit: Option<MemorySize>,
    },

    /// Run the filter on a job.
    #[serde(rename = "filter")]
    Filter { job: Job },

    /// Graceful shutdown request.
    #[serde(rename = "exit")]
    Exit,
}

/// Response from worker to supervisor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WorkResponse {
    /// Worker loaded its filter and is waiting for jobs. Sent once.
    #[serde(rename = "ready")]
    Ready,

    /// Fully materialized filter output.
    #[serde(rename = "result")]
    Result {
        fields: Fields,
        /// Worker went over its memory limit and should be retired.
        #[serde(default)]
        recycle: bool,
    },

    /// The filter failed.
    #[serde(rename = "failure")]
    Failure { failure: FilterFailure },
}

/// Category of a filter failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The filter returned an error, at call time or while producing fields.
    Error,
    /// The filter panicked.
    Panic,
    /// The filter (or the worker on its behalf) produced unusable output.
    Malformed,
    /// The worker process died while the job was in flight.
    Crashed,
}

impl FailureKind {
    pub fn as_label(&self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Panic => "panic",
            Self::Malformed => "malformed",
            Self::Crashed => "crashed",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

/// Failure marker sent in place of a result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterFailure {
    pub kind: FailureKind,
    /// Description of the failure as seen inside the worker.
    pub message: String,
}

impl FilterFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for FilterFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            FailureKind::Error => write!(f, "{}", self.message),
            kind => write!(f, "{}: {}", kind, self.message),
        }
    }
}

impl std::error::Error for FilterFailure {}

impl WorkRequest {
    pub fn filter(job: impl Into<Job>) -> Self {
        Self::Filter { job: job.into() }
    }
}

impl WorkResponse {
    pub fn result(fields: Fields) -> Self {
        Self::Result {
            fields,
            recycle: false,
        }
    }

    pub fn failure(kind: FailureKind, message: impl Into<String>) -> Self {
        Self::Failure {
            failure: FilterFailure::new(kind, message),
        }
    }
}
