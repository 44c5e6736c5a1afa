//! Isolated filter execution in a supervised subprocess.
//!
//! A [`Supervisor`] starts a worker process, hands it the filter, sends it
//! jobs one at a time over a pipe pair and enforces a deadline per job. A
//! worker that times out, fails or crashes is killed together with its process
//! group, and a replacement is started on the next job.
//!
//! Workers are separate program images started with `std::process::Command`
//! (by default the current executable). That program must call
//! [`run_worker_main`] when [`is_worker_process`] is true.
//!
//! # Architecture
//!
//! ```text
//!   ┌──────────────────┐   WorkRequest (JSON lines)   ┌──────────────────┐
//!   │  Parent process  │ ───────────────────────────▶ │  Worker process  │
//!   │   (Supervisor)   │ ◀─────────────────────────── │  (worker_loop +  │
//!   │                  │   WorkResponse (JSON lines)  │   Filter)        │
//!   └──────────────────┘                              └──────────────────┘
//! ```
//!
//! # Features
//!
//! - **Timeouts**: Hung filters are killed after the configured deadline
//! - **Recycling**: Workers are replaced after a fixed number of jobs or
//!   when they exceed a memory ceiling
//! - **Crash recovery**: Dead workers are detected and respawned lazily
//! - **Group kill**: Helper programs started by a filter die with the worker

mod ipc;
mod proc;
mod protocol;
mod signals;
mod spawn;
mod supervisor;
#[cfg(test)]
mod testing;
mod worker_main;

pub use ipc::{LineReader, LineWriter, PipeFd, Receiver, Sender, channel};
pub use proc::Proc;
pub use protocol::{FailureKind, FilterFailure, WorkRequest, WorkResponse};
pub use signals::TerminationReason;
pub use spawn::{WORKER_ENV, WorkerCommand, WorkerConfig, spawn_worker};
pub use supervisor::{Supervisor, SupervisorConfig, SupervisorStats};
pub use worker_main::{is_worker_process, run_worker_main};
