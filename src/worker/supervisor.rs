//! Supervisor for a single isolated filter worker.
//!
//! Owns the worker process, sends it one job at a time, and applies the
//! timeout and recycling policy. Every path other than a clean result
//! delivery leaves the supervisor without a worker, so the next call starts
//! a fresh one.

use super::proc::Proc;
use super::protocol::{FailureKind, FilterFailure, WorkRequest, WorkResponse};
use super::signals::TerminationReason;
use super::spawn::{WorkerCommand, WorkerConfig, spawn_worker};
use crate::error::{IsoError, Result};
use crate::filter::{Fields, Filter, Job};
use crate::memory::MemorySize;
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// How long a worker that closed its channel gets to finish exiting.
const DEATH_REAP_GRACE: Duration = Duration::from_millis(500);

/// Configuration for a [`Supervisor`].
#[derive(Debug, Clone, PartialEq)]
pub struct SupervisorConfig {
    /// How long a job may run before the worker is killed.
    pub timeout: Duration,
    /// Jobs one worker serves before it is replaced. 0 = fresh worker per job.
    pub restart_limit: usize,
    /// How long a worker gets to exit after an exit request on shutdown or recycle.
    pub shutdown_grace: Duration,
    /// Peak RSS after which a worker is retired (checked after each job).
    pub memory_limit: Option<MemorySize>,
    /// Program started for each worker.
    pub worker: WorkerCommand,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            restart_limit: 1000,
            shutdown_grace: Duration::from_secs(5),
            memory_limit: None,
            worker: WorkerCommand::current_exe(),
        }
    }
}

impl SupervisorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_restart_limit(mut self, restart_limit: usize) -> Self {
        self.restart_limit = restart_limit;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_memory_limit(mut self, limit: MemorySize) -> Self {
        self.memory_limit = Some(limit);
        self
    }

    pub fn with_worker(mut self, worker: WorkerCommand) -> Self {
        self.worker = worker;
        self
    }
}

/// Counters describing a supervisor's history.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SupervisorStats {
    /// Jobs that returned fields.
    pub jobs_completed: usize,
    /// Jobs that ended in a filter failure (including crashes).
    pub failures: usize,
    /// Jobs abandoned on timeout.
    pub timeouts: usize,
    /// Worker processes started.
    pub spawns: usize,
    /// Workers that could not be started or never became ready.
    pub spawn_failures: usize,
    /// Healthy workers retired by the restart or memory limit.
    pub recycles: usize,
}

/// The live worker and its bookkeeping.
struct Worker {
    proc: Proc,
    /// Jobs sent to this worker since it started.
    served: usize,
    /// Worker reported it is over its memory limit.
    recycle: bool,
}

/// What came back from the worker for one job.
enum Exchange {
    Fields { fields: Fields, recycle: bool },
    Failed(FilterFailure),
    TimedOut,
    /// Channel closed or broken before a response arrived.
    Died(String),
}

/// Send one job and wait up to `timeout` for its answer.
fn exchange(proc: &mut Proc, job: &Job, timeout: Duration) -> Exchange {
    if let Err(e) = proc.send(&WorkRequest::filter(job.clone())) {
        return Exchange::Died(format!("could not send job: {}", e));
    }

    match proc.poll(timeout) {
        Ok(true) => {}
        Ok(false) => return Exchange::TimedOut,
        Err(e) => return Exchange::Died(format!("could not wait for response: {}", e)),
    }

    match proc.recv() {
        Ok(Some(WorkResponse::Result { fields, recycle })) => Exchange::Fields { fields, recycle },
        Ok(Some(WorkResponse::Failure { failure })) => Exchange::Failed(failure),
        Ok(Some(WorkResponse::Ready)) => Exchange::Failed(FilterFailure::new(
            FailureKind::Malformed,
            "worker sent Ready instead of a result",
        )),
        Ok(None) => Exchange::Died("closed its channel".to_string()),
        Err(IsoError::Json(e)) => Exchange::Failed(FilterFailure::new(
            FailureKind::Malformed,
            format!("invalid worker response: {}", e),
        )),
        Err(e) => Exchange::Died(format!("could not read response: {}", e)),
    }
}

/// Kill a worker that never became ready.
fn kill_unready(proc: &mut Proc) {
    if let Err(e) = proc.kill() {
        warn!(pid = proc.pid().as_raw(), "Failed to kill unready filter worker: {}", e);
    }
}

/// Runs a filter in a separate worker process with a deadline per job.
///
/// The filter is serialized into each new worker, which rebuilds it through
/// [`run_worker_main`](super::run_worker_main).
///
/// ```no_run
/// use isofilter::filter::builtin::BuiltinFilter;
/// use isofilter::{Supervisor, SupervisorConfig};
/// use std::time::Duration;
///
/// fn main() {
///     if isofilter::worker::is_worker_process() {
///         isofilter::worker::run_worker_main::<BuiltinFilter>();
///     }
///
///     let config = SupervisorConfig::new().with_timeout(Duration::from_secs(5));
///     let mut supervisor = Supervisor::new(BuiltinFilter::Text, config);
///     let fields = supervisor.invoke("/srv/docs/report.txt").unwrap();
///     assert_eq!(fields[0].value, "report.txt");
/// }
/// ```
pub struct Supervisor<F> {
    filter: F,
    config: SupervisorConfig,
    worker: Option<Worker>,
    stats: SupervisorStats,
}

impl<F: Filter + Serialize> Supervisor<F> {
    /// Create a supervisor. No worker is started until the first job.
    pub fn new(filter: F, config: SupervisorConfig) -> Self {
        Self {
            filter,
            config,
            worker: None,
            stats: SupervisorStats::default(),
        }
    }

    /// Run the filter on `job` in the worker process.
    ///
    /// Blocks for at most the configured timeout, plus the time to start a
    /// worker when none is live. On timeout or failure the worker is killed
    /// and the job is not retried.
    pub fn invoke(&mut self, job: impl Into<Job>) -> Result<Fields> {
        let job = job.into();
        self.retire_if_spent();
        self.ensure_worker()?;

        let timeout = self.config.timeout;
        let start = Instant::now();
        let (pid, outcome) = match self.worker.as_mut() {
            Some(worker) => {
                worker.served += 1;
                (worker.proc.pid(), exchange(&mut worker.proc, &job, timeout))
            }
            None => return Err(IsoError::Worker("no worker after spawn".into())),
        };

        match outcome {
            Exchange::Fields { fields, recycle } => {
                self.stats.jobs_completed += 1;
                if let Some(worker) = self.worker.as_mut() {
                    worker.recycle = recycle;
                }
                trace!(
                    pid = pid.as_raw(),
                    job = %job,
                    fields = fields.len(),
                    elapsed_ms = start.elapsed().as_millis(),
                    "Filter job completed"
                );
                Ok(fields)
            }
            Exchange::Failed(failure) => {
                warn!(
                    pid = pid.as_raw(),
                    job = %job,
                    kind = %failure.kind,
                    "Killing filter worker, the filter failed: {}",
                    failure.message
                );
                self.discard_worker();
                self.stats.failures += 1;
                Err(IsoError::Filter { job, failure })
            }
            Exchange::TimedOut => {
                warn!(
                    pid = pid.as_raw(),
                    job = %job,
                    timeout_secs = timeout.as_secs_f64(),
                    "Killing filter worker due to timeout"
                );
                self.discard_worker();
                self.stats.timeouts += 1;
                Err(IsoError::Timeout { job, timeout })
            }
            Exchange::Died(detail) => {
                let reason = self.reap_dead_worker();
                let message = match reason {
                    Some(reason) => format!("worker {} ({})", reason, detail),
                    None => format!("worker {}", detail),
                };
                warn!(
                    pid = pid.as_raw(),
                    job = %job,
                    "Filter worker died during job: {}",
                    message
                );
                self.stats.failures += 1;
                Err(IsoError::Filter {
                    job,
                    failure: FilterFailure::new(FailureKind::Crashed, message),
                })
            }
        }
    }

    /// Make sure a live, ready worker exists.
    fn ensure_worker(&mut self) -> Result<()> {
        if let Some(worker) = self.worker.as_mut() {
            if worker.proc.is_running() {
                return Ok(());
            }
            warn!(
                pid = worker.proc.pid().as_raw(),
                reason = %worker
                    .proc
                    .exit_reason()
                    .map(ToString::to_string)
                    .unwrap_or_else(|| "unknown".into()),
                "Idle filter worker died, replacing it"
            );
            self.worker = None;
        }

        match self.start_worker() {
            Ok(proc) => {
                info!(pid = proc.pid().as_raw(), "Started filter worker");
                self.worker = Some(Worker {
                    proc,
                    served: 0,
                    recycle: false,
                });
                Ok(())
            }
            Err(e) => {
                self.stats.spawn_failures += 1;
                warn!("Could not start filter worker: {}", e);
                Err(e)
            }
        }
    }

    /// Start a worker and wait, bounded by the job timeout, for it to load
    /// the filter.
    fn start_worker(&mut self) -> Result<Proc> {
        let worker_config = WorkerConfig {
            memory_limit: self.config.memory_limit,
        };
        let mut proc = spawn_worker(&self.filter, &self.config.worker, &worker_config)?;
        self.stats.spawns += 1;

        let timeout = self.config.timeout;
        let handshake = match proc.poll(timeout) {
            Ok(true) => proc.recv(),
            Ok(false) => Err(IsoError::Spawn(format!(
                "worker {} not ready within {:?}",
                proc.pid(),
                timeout
            ))),
            Err(e) => Err(e),
        };

        let reason = match handshake {
            Ok(Some(WorkResponse::Ready)) => return Ok(proc),
            Ok(None) => match proc.reap(DEATH_REAP_GRACE) {
                Ok(reason) => format!("worker {} before becoming ready", reason),
                Err(e) => {
                    warn!(pid = proc.pid().as_raw(), "Failed to reap filter worker: {}", e);
                    "worker closed its channel before becoming ready".to_string()
                }
            },
            Ok(Some(WorkResponse::Failure { failure })) => {
                kill_unready(&mut proc);
                format!("worker could not load the filter: {}", failure.message)
            }
            Ok(Some(other)) => {
                kill_unready(&mut proc);
                format!("worker sent {:?} instead of Ready", other)
            }
            Err(IsoError::Spawn(message)) => {
                kill_unready(&mut proc);
                message
            }
            Err(e) => {
                kill_unready(&mut proc);
                format!("worker handshake failed: {}", e)
            }
        };
        Err(IsoError::Spawn(reason))
    }

    /// Retire a healthy worker that reached its job or memory limit.
    fn retire_if_spent(&mut self) {
        let limit = self.config.restart_limit;
        let spent = self
            .worker
            .as_ref()
            .is_some_and(|w| w.recycle || w.served >= limit);
        if !spent {
            return;
        }

        if let Some(mut worker) = self.worker.take() {
            debug!(
                pid = worker.proc.pid().as_raw(),
                served = worker.served,
                restart_limit = limit,
                over_memory = worker.recycle,
                "Recycling filter worker"
            );
            self.stats.recycles += 1;
            if let Err(e) = worker.proc.stop(self.config.shutdown_grace) {
                warn!(pid = worker.proc.pid().as_raw(), "Failed to stop filter worker: {}", e);
            }
        }
    }

    /// Kill the current worker immediately.
    fn discard_worker(&mut self) {
        if let Some(mut worker) = self.worker.take() {
            let pid = worker.proc.pid().as_raw();
            match worker.proc.kill() {
                Ok(reason) => debug!(pid, reason = %reason, "Filter worker killed"),
                Err(e) => warn!(pid, "Failed to kill filter worker: {}", e),
            }
        }
    }

    /// Collect the exit status of a worker whose channel went away.
    fn reap_dead_worker(&mut self) -> Option<TerminationReason> {
        let mut worker = self.worker.take()?;
        match worker.proc.reap(DEATH_REAP_GRACE) {
            Ok(reason) => Some(reason),
            Err(e) => {
                warn!(pid = worker.proc.pid().as_raw(), "Failed to reap filter worker: {}", e);
                None
            }
        }
    }

    pub fn filter(&self) -> &F {
        &self.filter
    }
}

impl<F> Supervisor<F> {
    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn stats(&self) -> SupervisorStats {
        self.stats
    }

    /// Process id of the live worker, if any.
    pub fn worker_pid(&self) -> Option<u32> {
        self.worker.as_ref().map(|w| w.proc.pid().as_raw() as u32)
    }

    /// Stop the live worker, if any. The supervisor stays usable.
    pub fn shutdown(&mut self) {
        if let Some(mut worker) = self.worker.take() {
            let pid = worker.proc.pid().as_raw();
            debug!(pid, served = worker.served, "Shutting down filter worker");
            if let Err(e) = worker.proc.stop(self.config.shutdown_grace) {
                warn!(pid, "Failed to stop filter worker: {}", e);
            }
        }
    }
}

impl<F> Drop for Supervisor<F> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
