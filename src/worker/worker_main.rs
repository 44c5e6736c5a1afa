//! Worker subprocess main entry point.
//!
//! Runs in the program a supervisor started. Loads the filter from the start
//! request, then receives jobs, runs the filter on each one, and answers with
//! either the fully drained field list or a failure marker. Nothing a filter
//! does, short of killing the process, ends the loop.

use super::ipc::{PipeFd, Receiver, Sender};
use super::protocol::{FailureKind, WorkRequest, WorkResponse};
use super::spawn::{WORKER_ENV, WorkerConfig};
use crate::error::{IsoError, Result};
use crate::filter::{Fields, Filter, Job, MalformedOutput};
use serde::de::DeserializeOwned;
use std::any::Any;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::panic::{self, AssertUnwindSafe};
use std::time::Instant;

/// Get the peak memory usage of this process in MiB.
///
/// Uses `getrusage()` to get the maximum resident set size.
fn get_memory_usage_mib() -> u64 {
    use nix::sys::resource::{UsageWho, getrusage};

    match getrusage(UsageWho::RUSAGE_SELF) {
        Ok(usage) => {
            let max_rss = usage.max_rss().max(0) as u64;

            #[cfg(target_os = "macos")]
            {
                // macOS: max_rss is in bytes
                max_rss / (1024 * 1024)
            }

            #[cfg(not(target_os = "macos"))]
            {
                // Linux: max_rss is in kilobytes
                max_rss / 1024
            }
        }
        Err(_) => 0,
    }
}

fn is_over_memory_limit(config: &WorkerConfig) -> bool {
    config
        .memory_limit
        .is_some_and(|limit| get_memory_usage_mib() > limit.as_mib())
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}

/// Run the filter on one job and turn the outcome into a response.
///
/// The field stream is drained inside the same guard as the call itself, so
/// errors and panics raised while producing fields are caught too.
pub(crate) fn run_filter<F: Filter + ?Sized>(filter: &F, job: &Job) -> WorkResponse {
    let span = tracing::info_span!("filter", job = %job, pid = std::process::id());
    let start = Instant::now();

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| -> anyhow::Result<Fields> {
        let mut fields = Vec::new();
        for field in filter.extract(job, &span)? {
            let field = field?;
            if field.name.is_empty() {
                return Err(MalformedOutput(format!(
                    "field #{} has an empty name",
                    fields.len()
                ))
                .into());
            }
            fields.push(field);
        }
        Ok(fields)
    }));

    match outcome {
        Ok(Ok(fields)) => {
            tracing::trace!(
                parent: &span,
                fields = fields.len(),
                elapsed_ms = start.elapsed().as_millis(),
                "Filter finished"
            );
            WorkResponse::result(fields)
        }
        Ok(Err(e)) => {
            let kind = if e.downcast_ref::<MalformedOutput>().is_some() {
                FailureKind::Malformed
            } else {
                FailureKind::Error
            };
            tracing::warn!(parent: &span, kind = %kind, "Filter raised an error: {:#}", e);
            WorkResponse::failure(kind, format!("{:#}", e))
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            tracing::warn!(parent: &span, "Filter panicked: {}", message);
            WorkResponse::failure(FailureKind::Panic, message)
        }
    }
}

/// Worker main loop.
///
/// Returns when the supervisor asks the worker to exit or closes the request
/// channel.
pub(crate) fn worker_loop<F: Filter + ?Sized>(
    filter: &F,
    requests: &mut Receiver<WorkRequest>,
    responses: &mut Sender<WorkResponse>,
    config: &WorkerConfig,
) -> Result<()> {
    responses.send(&WorkResponse::Ready)?;

    loop {
        let request = match requests.recv() {
            Ok(Some(request)) => request,
            Ok(None) => return Ok(()),
            Err(IsoError::Json(e)) => {
                let resp = WorkResponse::failure(
                    FailureKind::Malformed,
                    format!("Invalid request: {}", e),
                );
                responses.send(&resp)?;
                continue;
            }
            Err(e) => return Err(e),
        };

        match request {
            WorkRequest::Exit => return Ok(()),
            WorkRequest::Start { .. } => {
                responses.send(&WorkResponse::failure(
                    FailureKind::Malformed,
                    "worker already started",
                ))?;
            }
            WorkRequest::Filter { job } => {
                let mut response = run_filter(filter, &job);
                if let WorkResponse::Result { recycle, .. } = &mut response {
                    *recycle = is_over_memory_limit(config);
                }
                responses.send(&response)?;
            }
        }
    }
}

/// Load the filter from the start request, then serve jobs until told to stop.
fn serve<F: Filter + DeserializeOwned>(
    requests: &mut Receiver<WorkRequest>,
    responses: &mut Sender<WorkResponse>,
) -> Result<()> {
    let (filter, memory_limit) = match requests.recv()? {
        Some(WorkRequest::Start {
            filter,
            memory_limit,
        }) => match serde_json::from_value::<F>(filter) {
            Ok(filter) => (filter, memory_limit),
            Err(e) => {
                responses.send(&WorkResponse::failure(
                    FailureKind::Malformed,
                    format!("cannot load filter: {}", e),
                ))?;
                return Err(IsoError::Json(e));
            }
        },
        Some(other) => {
            let message = format!("expected a start request, got {:?}", other);
            responses.send(&WorkResponse::failure(FailureKind::Malformed, &message))?;
            return Err(IsoError::Worker(message));
        }
        None => return Ok(()),
    };

    worker_loop(&filter, requests, responses, &WorkerConfig { memory_limit })
}

/// Take ownership of one channel end the supervisor left open.
fn adopt_fd(fd: RawFd) -> Result<OwnedFd> {
    // Close-on-exec again, so programs the filter starts do not hold it open.
    if fd < 0 || unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) } == -1 {
        return Err(IsoError::Worker(format!(
            "inherited descriptor {} is not open",
            fd
        )));
    }
    // Safety: the descriptor is open and was passed to this process for the
    // worker channel only; nothing else in the process owns it.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Parse `WORKER_ENV` into (request fd, response fd).
fn parse_worker_fds(value: &str) -> Option<(RawFd, RawFd)> {
    let (request, response) = value.split_once(',')?;
    let request = request.trim().parse().ok()?;
    let response = response.trim().parse().ok()?;
    (request != response).then_some((request, response))
}

/// Channel endpoints inherited from the supervisor.
fn inherited_channel() -> Result<(Receiver<WorkRequest>, Sender<WorkResponse>)> {
    let value = std::env::var(WORKER_ENV).map_err(|_| {
        IsoError::Worker(format!(
            "{} is not set; workers are started by a supervisor",
            WORKER_ENV
        ))
    })?;
    let (request, response) = parse_worker_fds(&value)
        .ok_or_else(|| IsoError::Worker(format!("invalid {}: {:?}", WORKER_ENV, value)))?;

    Ok((
        Receiver::new(PipeFd::new(adopt_fd(request)?)),
        Sender::new(PipeFd::new(adopt_fd(response)?)),
    ))
}

/// True when a supervisor started this process as a worker.
pub fn is_worker_process() -> bool {
    std::env::var_os(WORKER_ENV).is_some()
}

/// Run this process as a filter worker and exit when the supervisor is done
/// with it.
///
/// The program a supervisor starts must call this early in `main` (for
/// example behind [`is_worker_process`] or a hidden subcommand), with the same
/// filter type the supervisor was built with.
///
/// ```no_run
/// # #[derive(serde::Serialize, serde::Deserialize)]
/// # struct MyFilter;
/// # impl isofilter::Filter for MyFilter {
/// #     fn extract<'a>(&'a self, _: &isofilter::Job, _: &tracing::Span)
/// #         -> anyhow::Result<isofilter::FieldStream<'a>> { Ok(Box::new(std::iter::empty())) }
/// # }
/// if isofilter::worker::is_worker_process() {
///     isofilter::worker::run_worker_main::<MyFilter>();
/// }
/// ```
pub fn run_worker_main<F: Filter + DeserializeOwned>() -> ! {
    // Panics are reported through the failure marker.
    panic::set_hook(Box::new(|_| {}));

    let code = match inherited_channel() {
        Ok((mut requests, mut responses)) => match serve::<F>(&mut requests, &mut responses) {
            Ok(()) => 0,
            Err(e) => {
                tracing::error!(pid = std::process::id(), "Filter worker stopping: {}", e);
                1
            }
        },
        Err(e) => {
            tracing::error!("Cannot run as filter worker: {}", e);
            2
        }
    };
    std::process::exit(code)
}
