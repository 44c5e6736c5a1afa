//! Process handle for worker subprocesses.
//!
//! Wraps a child process with its two IPC channel endpoints.

use super::ipc::{Receiver, Sender};
use super::protocol::{WorkRequest, WorkResponse};
use super::signals::TerminationReason;
use crate::error::{IsoError, Result};
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use std::time::{Duration, Instant};

/// Handle to a worker subprocess with IPC channels.
///
/// The worker leads its own process group, so signals sent through this
/// handle also reach any helper programs the filter started.
pub struct Proc {
    pid: Pid,
    /// Requests to the worker
    sender: Sender<WorkRequest>,
    /// Responses from the worker
    receiver: Receiver<WorkResponse>,
    /// Set once the process has been reaped
    exit: Option<TerminationReason>,
}

impl Proc {
    pub fn new(pid: Pid, sender: Sender<WorkRequest>, receiver: Receiver<WorkResponse>) -> Self {
        Self {
            pid,
            sender,
            receiver,
            exit: None,
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Send a request to the worker.
    pub fn send(&mut self, request: &WorkRequest) -> Result<()> {
        self.sender.send(request)
    }

    /// Wait up to `timeout` for a response to become available.
    pub fn poll(&mut self, timeout: Duration) -> Result<bool> {
        self.receiver.poll(timeout)
    }

    /// Receive a response from the worker.
    ///
    /// Returns `None` if the worker closed its end of the channel (EOF).
    pub fn recv(&mut self) -> Result<Option<WorkResponse>> {
        self.receiver.recv()
    }

    /// Check if the process is still running (non-blocking).
    pub fn is_running(&mut self) -> bool {
        matches!(self.try_wait(), Ok(None))
    }

    /// How the process ended, if it has been reaped.
    pub fn exit_reason(&self) -> Option<&TerminationReason> {
        self.exit.as_ref()
    }

    /// Try to reap the process (non-blocking).
    ///
    /// Returns `None` while the process is still running.
    pub fn try_wait(&mut self) -> Result<Option<TerminationReason>> {
        if let Some(reason) = &self.exit {
            return Ok(Some(reason.clone()));
        }
        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => Ok(None),
            Ok(status) => Ok(Some(self.record_exit(status))),
            Err(e) => Err(IsoError::Worker(format!("waitpid failed: {}", e))),
        }
    }

    /// Wait for the process to exit (blocking).
    pub fn wait(&mut self) -> Result<TerminationReason> {
        if let Some(reason) = &self.exit {
            return Ok(reason.clone());
        }
        loop {
            match waitpid(self.pid, None) {
                Ok(status) => return Ok(self.record_exit(status)),
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(IsoError::Worker(format!("waitpid failed: {}", e))),
            }
        }
    }

    fn record_exit(&mut self, status: WaitStatus) -> TerminationReason {
        let reason = TerminationReason::from(status);
        self.exit = Some(reason.clone());
        reason
    }

    /// Deliver `sig` to the worker's process group, falling back to the
    /// worker alone if the group is not established yet.
    fn signal(&self, sig: Signal) -> Result<()> {
        if self.exit.is_some() {
            return Ok(());
        }
        if signal::killpg(self.pid, sig).is_ok() {
            return Ok(());
        }
        match signal::kill(self.pid, sig) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(IsoError::Worker(format!(
                "Failed to send {} to worker {}: {}",
                sig.as_str(),
                self.pid,
                e
            ))),
        }
    }

    /// Send SIGTERM to the worker.
    pub fn terminate(&self) -> Result<()> {
        self.signal(Signal::SIGTERM)
    }

    /// Send SIGKILL to the worker and reap it.
    ///
    /// Returns how the process ended. A worker that had already died reports
    /// its original reason rather than the kill.
    pub fn kill(&mut self) -> Result<TerminationReason> {
        if let Some(reason) = self.try_wait()? {
            // Helpers the filter started may outlive the worker.
            let _ = signal::killpg(self.pid, Signal::SIGKILL);
            return Ok(reason);
        }
        self.signal(Signal::SIGKILL)?;
        self.wait()
    }

    /// Reap a worker that is expected to be exiting on its own, killing it
    /// if it is still around after `grace`. Leftover helpers in its process
    /// group are killed either way.
    pub fn reap(&mut self, grace: Duration) -> Result<TerminationReason> {
        let start = Instant::now();
        while start.elapsed() < grace {
            if self.try_wait()?.is_some() {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        self.kill()
    }

    /// Gracefully stop the worker: send exit command, wait up to `grace`,
    /// then escalate to SIGTERM and finally SIGKILL.
    pub fn stop(&mut self, grace: Duration) -> Result<()> {
        if self.exit.is_some() {
            return Ok(());
        }

        let _ = self.send(&WorkRequest::Exit);

        let start = Instant::now();
        while start.elapsed() < grace {
            if let Ok(Some(_)) = self.try_wait() {
                return Ok(());
            }
            std::thread::sleep(Duration::from_millis(10));
        }

        let _ = self.terminate();
        std::thread::sleep(Duration::from_millis(100));
        if let Ok(Some(_)) = self.try_wait() {
            return Ok(());
        }

        self.kill().map(|_| ())
    }
}

impl Drop for Proc {
    fn drop(&mut self) {
        if self.exit.is_none() {
            let _ = self.kill();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::ipc::channel;
    use std::os::unix::process::CommandExt;
    use std::process::{Command, Stdio};

    /// A `Proc` around an arbitrary program; its channels are unconnected.
    fn spawn_program(program: &str, args: &[&str]) -> Proc {
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .process_group(0)
            .spawn()
            .expect("Failed to spawn test program");
        let (sender, _) = channel::<WorkRequest>().unwrap();
        let (_, receiver) = channel::<WorkResponse>().unwrap();
        Proc::new(Pid::from_raw(child.id() as i32), sender, receiver)
    }

    #[test]
    fn test_kill_reaps_process() {
        let mut proc = spawn_program("sleep", &["60"]);
        assert!(proc.is_running());

        let reason = proc.kill().expect("Failed to kill");
        assert_eq!(reason, TerminationReason::Signaled(Signal::SIGKILL));
        assert!(!proc.is_running());
        assert_eq!(proc.exit_reason(), Some(&reason));
    }

    #[test]
    fn test_kill_after_exit_keeps_original_reason() {
        let mut proc = spawn_program("sh", &["-c", "exit 4"]);
        let reason = proc.wait().unwrap();
        assert_eq!(reason, TerminationReason::Exited(4));
        assert_eq!(proc.kill().unwrap(), TerminationReason::Exited(4));
    }

    #[test]
    fn test_stop_escalates_to_sigterm() {
        // sleep ignores our exit request, so stop() has to signal it.
        let mut proc = spawn_program("sleep", &["60"]);
        let start = Instant::now();
        proc.stop(Duration::from_millis(50)).expect("Failed to stop");
        assert!(!proc.is_running());
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(
            proc.exit_reason(),
            Some(&TerminationReason::Signaled(Signal::SIGTERM))
        );
    }

    /// Alive and not a zombie waiting for init to reap it.
    #[cfg(target_os = "linux")]
    fn is_live(pid: Pid) -> bool {
        match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            Ok(stat) => stat
                .rsplit_once(')')
                .map(|(_, rest)| !rest.trim_start().starts_with('Z'))
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_kill_reaches_process_group() {
        let marker = tempfile::NamedTempFile::new().unwrap();
        let script = format!("sleep 60 & echo $! > {}; wait", marker.path().display());
        let mut proc = spawn_program("sh", &["-c", &script]);

        let grandchild = {
            let deadline = Instant::now() + Duration::from_secs(5);
            loop {
                let text = std::fs::read_to_string(marker.path()).unwrap_or_default();
                if let Ok(pid) = text.trim().parse::<i32>() {
                    break Pid::from_raw(pid);
                }
                assert!(Instant::now() < deadline, "helper never started");
                std::thread::sleep(Duration::from_millis(10));
            }
        };

        proc.kill().unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while is_live(grandchild) {
            assert!(Instant::now() < deadline, "helper survived group kill");
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}
