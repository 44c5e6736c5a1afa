//! Worker used by the unit tests.
//!
//! The test binary starts itself again, running only [`worker_process`],
//! which turns into a worker when launched by a supervisor.

use super::spawn::WorkerCommand;
use super::worker_main::{is_worker_process, run_worker_main};
use crate::filter::{Field, FieldStream, Filter, Job};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::Span;

/// Behaviour is picked by the job name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Scripted;

impl Filter for Scripted {
    fn extract<'a>(&'a self, job: &Job, _log: &Span) -> anyhow::Result<FieldStream<'a>> {
        match job.to_str() {
            Some("fail") => anyhow::bail!("bad file"),
            Some("abort") => std::process::abort(),
            Some("hang") => loop {
                std::thread::sleep(Duration::from_secs(1));
            },
            Some("exit") => std::process::exit(7),
            _ => Ok(Box::new(
                [
                    Field::new("job", job.to_string_lossy()),
                    Field::new("pid", std::process::id().to_string()),
                ]
                .into_iter()
                .map(Ok),
            )),
        }
    }
}

pub(crate) fn worker_command() -> WorkerCommand {
    WorkerCommand::current_exe().args(["worker::testing::worker_process", "--exact", "--nocapture"])
}

#[test]
fn worker_process() {
    if is_worker_process() {
        run_worker_main::<Scripted>();
    }
}
