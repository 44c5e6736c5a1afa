//! Worker subprocess spawning.
//!
//! Uses `std::process::Command` to start a fresh program image rather than a
//! bare `fork()`. A forked child of a multi-threaded parent inherits every lock
//! another thread held at that moment (stdio, allocator arenas, logging),
//! and a filter touching one of them would hang until its timeout. Here the
//! only code run between fork and exec is a `fcntl` on the two inherited pipe
//! ends.
//!
//! The started program must call [`run_worker_main`](super::run_worker_main)
//! when it finds [`WORKER_ENV`] set. The filter itself travels to the worker
//! as the first request on the channel.

use super::ipc::{PipeFd, Receiver, Sender};
use super::proc::Proc;
use super::protocol::{WorkRequest, WorkResponse};
use crate::error::{IsoError, Result};
use crate::memory::MemorySize;
use nix::unistd::Pid;
use serde::Serialize;
use std::ffi::OsString;
use std::io;
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// Environment variable naming the worker's channel descriptors as
/// `"<request fd>,<response fd>"`.
pub const WORKER_ENV: &str = "ISOFILTER_WORKER_FDS";

/// Program and arguments that start a worker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerCommand {
    /// `None` runs the current executable again.
    program: Option<PathBuf>,
    args: Vec<OsString>,
}

impl WorkerCommand {
    /// Re-run the current executable with no arguments.
    pub fn current_exe() -> Self {
        Self::default()
    }

    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: Some(program.into()),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn program(&self) -> Option<&Path> {
        self.program.as_deref()
    }

    pub fn get_args(&self) -> &[OsString] {
        &self.args
    }

    fn resolve_program(&self) -> Result<PathBuf> {
        match &self.program {
            Some(program) => Ok(program.clone()),
            None => std::env::current_exe().map_err(|e| {
                IsoError::Spawn(format!("Failed to get current executable: {}", e))
            }),
        }
    }
}

/// Limits handed to each worker in its start request.
#[derive(Debug, Clone, Default)]
pub struct WorkerConfig {
    /// Peak RSS after which the worker asks to be retired.
    pub memory_limit: Option<MemorySize>,
}

/// Spawn a worker subprocess and send it `filter`.
///
/// Creates a fresh request/response pipe pair. The child gets the request
/// read end and the response write end; stdin is `/dev/null` and stdout is
/// pointed at stderr, so filter output never mixes with the embedding
/// program's stdout. The worker leads its own process group.
///
/// Returns once the start request is written. The caller waits for `Ready`.
pub fn spawn_worker<F: Serialize + ?Sized>(
    filter: &F,
    command: &WorkerCommand,
    config: &WorkerConfig,
) -> Result<Proc> {
    let filter = serde_json::to_value(filter)
        .map_err(|e| IsoError::Spawn(format!("Failed to serialize filter: {}", e)))?;
    let program = command.resolve_program()?;

    let (request_read, request_write) = io::pipe()
        .map_err(|e| IsoError::Spawn(format!("Failed to create request channel: {}", e)))?;
    let (response_read, response_write) = io::pipe()
        .map_err(|e| IsoError::Spawn(format!("Failed to create response channel: {}", e)))?;
    let stdout = io::stderr()
        .as_fd()
        .try_clone_to_owned()
        .map_err(|e| IsoError::Spawn(format!("Failed to duplicate stderr: {}", e)))?;

    let inherited = [request_read.as_raw_fd(), response_write.as_raw_fd()];

    let mut cmd = Command::new(&program);
    cmd.args(&command.args)
        .env(WORKER_ENV, format!("{},{}", inherited[0], inherited[1]))
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::inherit())
        .process_group(0);

    // Safety: the hook runs in the forked child before exec and only calls
    // fcntl, which is async-signal-safe. It takes no locks and does not
    // allocate, so it cannot block on state left behind by the parent's
    // other threads. Both pipes are close-on-exec in the parent, so other
    // children spawned concurrently never inherit them.
    unsafe {
        cmd.pre_exec(move || {
            for fd in inherited {
                if libc::fcntl(fd, libc::F_SETFD, 0) == -1 {
                    return Err(io::Error::last_os_error());
                }
            }
            Ok(())
        });
    }

    let child = cmd
        .spawn()
        .map_err(|e| IsoError::Spawn(format!("could not start {}: {}", program.display(), e)))?;

    drop(request_read);
    drop(response_write);

    let sender = Sender::<WorkRequest>::new(PipeFd::new(OwnedFd::from(request_write)));
    let receiver = Receiver::<WorkResponse>::new(PipeFd::new(OwnedFd::from(response_read)));
    let mut proc = Proc::new(Pid::from_raw(child.id() as i32), sender, receiver);

    let start = WorkRequest::Start {
        filter,
        memory_limit: config.memory_limit,
    };
    // On failure `proc` is dropped, which kills and reaps the child.
    proc.send(&start).map_err(|e| {
        IsoError::Spawn(format!(
            "could not send filter to worker {}: {}",
            proc.pid(),
            e
        ))
    })?;

    Ok(proc)
}
