//! Filter capability: the extraction routine run inside a worker.
//!
//! A filter maps a [`Job`] (usually a file path) to an ordered sequence of
//! [`Field`]s. Filters may produce their fields lazily; the worker drains the
//! stream before anything crosses the process boundary, so errors raised
//! half-way through production are reported like errors raised up front.

pub mod builtin;

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};
use tracing::Span;

/// Opaque identifier of one unit of work, typically a file path.
///
/// Held as raw OS bytes, so paths that are not valid UTF-8 reach the filter
/// unchanged. On the wire a UTF-8 job is a plain JSON string and anything
/// else is `{"bytes": [...]}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "JobRepr", into = "JobRepr")]
pub struct Job(OsString);

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum JobRepr {
    Text(String),
    Bytes { bytes: Vec<u8> },
}

impl From<JobRepr> for Job {
    fn from(repr: JobRepr) -> Self {
        match repr {
            JobRepr::Text(text) => Self(text.into()),
            JobRepr::Bytes { bytes } => Self(OsString::from_vec(bytes)),
        }
    }
}

impl From<Job> for JobRepr {
    fn from(job: Job) -> Self {
        match job.0.into_string() {
            Ok(text) => JobRepr::Text(text),
            Err(raw) => JobRepr::Bytes {
                bytes: raw.into_vec(),
            },
        }
    }
}

impl Job {
    pub fn new(id: impl Into<OsString>) -> Self {
        Self(id.into())
    }

    pub fn as_os_str(&self) -> &OsStr {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    /// The identifier as text, if it is valid UTF-8.
    pub fn to_str(&self) -> Option<&str> {
        self.0.to_str()
    }

    pub fn to_string_lossy(&self) -> Cow<'_, str> {
        self.0.to_string_lossy()
    }

    /// View the identifier as a filesystem path.
    pub fn as_path(&self) -> &Path {
        Path::new(&self.0)
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_path().display())
    }
}

impl From<&str> for Job {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for Job {
    fn from(id: String) -> Self {
        Self::new(id)
    }
}

impl From<&OsStr> for Job {
    fn from(id: &OsStr) -> Self {
        Self::new(id)
    }
}

impl From<OsString> for Job {
    fn from(id: OsString) -> Self {
        Self(id)
    }
}

impl From<Vec<u8>> for Job {
    fn from(bytes: Vec<u8>) -> Self {
        Self(OsString::from_vec(bytes))
    }
}

impl From<&Path> for Job {
    fn from(path: &Path) -> Self {
        Self::new(path.as_os_str())
    }
}

impl From<PathBuf> for Job {
    fn from(path: PathBuf) -> Self {
        Self(path.into_os_string())
    }
}

/// A single extracted (name, value) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub value: String,
}

impl Field {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Materialized filter output for one job, in production order.
pub type Fields = Vec<Field>;

/// Lazily produced filter output. Each item may fail independently.
pub type FieldStream<'a> = Box<dyn Iterator<Item = anyhow::Result<Field>> + 'a>;

/// Error a filter returns when its own output is unusable.
///
/// The worker reports it as a malformed-output failure rather than a plain
/// filter error.
#[derive(Debug, Clone, thiserror::Error)]
#[error("malformed filter output: {0}")]
pub struct MalformedOutput(pub String);

/// An extraction routine.
///
/// `log` is a span scoped to the current job inside the worker; filters
/// should use it as the parent of their own events.
pub trait Filter {
    fn extract<'a>(&'a self, job: &Job, log: &Span) -> anyhow::Result<FieldStream<'a>>;
}

impl<F, I> Filter for F
where
    F: Fn(&Job, &Span) -> anyhow::Result<I>,
    I: IntoIterator<Item = anyhow::Result<Field>>,
    I::IntoIter: 'static,
{
    fn extract<'a>(&'a self, job: &Job, log: &Span) -> anyhow::Result<FieldStream<'a>> {
        let fields = self(job, log)?;
        Ok(Box::new(fields.into_iter()))
    }
}
