//! isofilter - run untrusted content filters in supervised worker processes.
//!
//! A filter turns a job (usually a file path) into a sequence of named text
//! fields. Filters crash, hang and leak; [`Supervisor`] runs one in a separate
//! worker process so none of that reaches the caller.

pub mod error;
pub mod filter;
pub mod logging;
pub mod memory;
pub mod worker;

pub use error::{IsoError, Result};
pub use filter::{Field, FieldStream, Fields, Filter, Job, MalformedOutput};
pub use memory::MemorySize;
pub use worker::{FailureKind, FilterFailure, Supervisor, SupervisorConfig, SupervisorStats};
