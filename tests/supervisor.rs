//! End-to-end tests for the supervisor through the public library API.
//!
//! Workers are this test binary started again with only `worker_process`
//! selected. Tests that time worker behaviour run serially.

use anyhow::bail;
use isofilter::worker::{WorkerCommand, is_worker_process, run_worker_main};
use isofilter::{
    FailureKind, Field, FieldStream, Filter, IsoError, Job, Supervisor, SupervisorConfig,
};
use serde::{Deserialize, Serialize};
use serial_test::serial;
use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::Span;

/// Filter whose behaviour is selected by the job name.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Scripted;

fn scripted(job: &Job) -> anyhow::Result<Vec<anyhow::Result<Field>>> {
    let Some(name) = job.to_str() else {
        let hex: String = job.as_bytes().iter().map(|b| format!("{:02x}", b)).collect();
        return Ok(vec![Ok(Field::new("bytes", hex))]);
    };
    if let Some(secs) = name.strip_prefix("sleep:") {
        std::thread::sleep(Duration::from_secs(secs.parse()?));
        return Ok(vec![Ok(Field::new("slept", secs))]);
    }
    match name {
        "bad" => bail!("bad file"),
        "spin" => loop {
            std::hint::spin_loop();
        },
        "panic" => panic!("filter blew up"),
        "late-error" => Ok(vec![
            Ok(Field::new("first", "1")),
            Err(anyhow::anyhow!("second field unavailable")),
        ]),
        "many" => Ok((0..50)
            .map(|i| Ok(Field::new(format!("f{}", i), format!("v{}", i))))
            .collect()),
        "odd-values" => Ok(vec![
            Ok(Field::new("nul", "a\0b")),
            Ok(Field::new("newline", "line one\nline two")),
            Ok(Field::new("unicode", "Grüße, 世界 🎉")),
            Ok(Field::new("empty", "")),
        ]),
        "chatty" => {
            eprintln!("chatty filter says hello");
            Ok(vec![Ok(Field::new("said", "hello"))])
        }
        _ => Ok(vec![
            Ok(Field::new("job", name)),
            Ok(Field::new("pid", std::process::id().to_string())),
        ]),
    }
}

impl Filter for Scripted {
    fn extract<'a>(&'a self, job: &Job, _log: &Span) -> anyhow::Result<FieldStream<'a>> {
        Ok(Box::new(scripted(job)?.into_iter()))
    }
}

#[test]
fn worker_process() {
    if is_worker_process() {
        run_worker_main::<Scripted>();
    }
}

/// Never answers the start request.
#[test]
fn stalled_worker_process() {
    if is_worker_process() {
        loop {
            std::thread::sleep(Duration::from_secs(1));
        }
    }
}

fn worker_command(entry: &str) -> WorkerCommand {
    WorkerCommand::current_exe().args([entry, "--exact", "--nocapture"])
}

fn config(timeout: Duration) -> SupervisorConfig {
    SupervisorConfig::new()
        .with_timeout(timeout)
        .with_shutdown_grace(Duration::from_secs(1))
        .with_worker(worker_command("worker_process"))
}

fn supervisor(timeout: Duration) -> Supervisor<Scripted> {
    Supervisor::new(Scripted, config(timeout))
}

fn worker_pid_of(fields: &[Field]) -> String {
    fields
        .iter()
        .find(|f| f.name == "pid")
        .map(|f| f.value.clone())
        .expect("no pid field")
}

#[test]
#[serial]
fn test_fields_returned_in_order() {
    let mut supervisor = supervisor(Duration::from_secs(30));

    let fields = supervisor.invoke("many").unwrap();
    assert_eq!(fields.len(), 50);
    for (i, field) in fields.iter().enumerate() {
        assert_eq!(field, &Field::new(format!("f{}", i), format!("v{}", i)));
    }
}

#[test]
#[serial]
fn test_values_survive_transport() {
    let mut supervisor = supervisor(Duration::from_secs(30));

    let fields = supervisor.invoke("odd-values").unwrap();
    assert_eq!(fields[0].value, "a\0b");
    assert_eq!(fields[1].value, "line one\nline two");
    assert_eq!(fields[2].value, "Grüße, 世界 🎉");
    assert_eq!(fields[3].value, "");
}

#[test]
#[serial]
fn test_non_utf8_job_reaches_filter_unchanged() {
    let mut supervisor = supervisor(Duration::from_secs(5));

    let fields = supervisor.invoke(b"caf\xe9.txt".to_vec()).unwrap();
    assert_eq!(fields, vec![Field::new("bytes", "636166e92e747874")]);
}

#[test]
#[serial]
fn test_sleeping_filter_times_out() {
    let mut supervisor = supervisor(Duration::from_secs(1));
    // Start the worker first so only the job itself is timed.
    supervisor.invoke("warmup").unwrap();

    let start = Instant::now();
    let err = supervisor.invoke("sleep:5").unwrap_err();
    let elapsed = start.elapsed();

    match &err {
        IsoError::Timeout { job, timeout } => {
            assert_eq!(job.to_str(), Some("sleep:5"));
            assert_eq!(*timeout, Duration::from_secs(1));
        }
        other => panic!("Expected timeout, got {:?}", other),
    }
    assert!(elapsed >= Duration::from_secs(1));
    assert!(elapsed < Duration::from_secs(4), "took {:?}", elapsed);
    assert!(err.to_string().contains("sleep:5"));
}

#[test]
#[serial]
fn test_infinite_loop_times_out_then_recovers() {
    let mut supervisor = supervisor(Duration::from_secs(1));

    let first = supervisor.invoke("a").unwrap();
    let err = supervisor.invoke("spin").unwrap_err();
    assert!(err.is_timeout());

    let after = supervisor.invoke("b").unwrap();
    assert_eq!(after[0], Field::new("job", "b"));
    assert_ne!(worker_pid_of(&first), worker_pid_of(&after));
}

#[test]
#[serial]
fn test_filter_error_is_propagated() {
    let mut supervisor = supervisor(Duration::from_secs(5));

    let err = supervisor.invoke("bad").unwrap_err();
    let failure = err.failure().expect("Expected a filter failure");
    assert_eq!(failure.kind, FailureKind::Error);
    assert_eq!(failure.message, "bad file");
    assert_eq!(err.job().and_then(Job::to_str), Some("bad"));
    assert!(err.to_string().contains("bad file"));
}

#[test]
#[serial]
fn test_failed_worker_is_not_reused() {
    let mut supervisor = supervisor(Duration::from_secs(5));

    let before = supervisor.invoke("a").unwrap();
    assert!(supervisor.invoke("bad").is_err());
    let after = supervisor.invoke("b").unwrap();
    assert_ne!(worker_pid_of(&before), worker_pid_of(&after));
}

#[test]
#[serial]
fn test_error_while_streaming_fields() {
    let mut supervisor = supervisor(Duration::from_secs(5));

    let err = supervisor.invoke("late-error").unwrap_err();
    let failure = err.failure().unwrap();
    assert_eq!(failure.kind, FailureKind::Error);
    assert!(failure.message.contains("second field unavailable"));
}

#[test]
#[serial]
fn test_panic_is_contained() {
    let mut supervisor = supervisor(Duration::from_secs(5));

    let err = supervisor.invoke("panic").unwrap_err();
    let failure = err.failure().unwrap();
    assert_eq!(failure.kind, FailureKind::Panic);
    assert!(failure.message.contains("filter blew up"));

    assert!(supervisor.invoke("next").is_ok());
}

#[test]
#[serial]
fn test_restart_limit_replaces_worker() {
    let config = config(Duration::from_secs(30)).with_restart_limit(3);
    let mut supervisor = Supervisor::new(Scripted, config);

    let pids: Vec<String> = (0..4)
        .map(|i| worker_pid_of(&supervisor.invoke(format!("job{}", i)).unwrap()))
        .collect();

    assert_eq!(pids[0], pids[1]);
    assert_eq!(pids[1], pids[2]);
    assert_ne!(pids[2], pids[3]);
    assert_eq!(supervisor.stats().recycles, 1);
}

#[test]
#[serial]
fn test_no_stale_failures_leak() {
    let mut supervisor = supervisor(Duration::from_secs(1));
    supervisor.invoke("warmup").unwrap();

    assert!(supervisor.invoke("sleep:3").unwrap_err().is_timeout());
    assert!(supervisor.invoke("bad").is_err());

    // The timed-out job's late answer must not be mistaken for this one.
    std::thread::sleep(Duration::from_secs(3));
    for i in 0..3 {
        let job = format!("clean{}", i);
        let fields = supervisor.invoke(job.as_str()).unwrap();
        assert_eq!(fields[0], Field::new("job", job));
    }

    let stats = supervisor.stats();
    assert_eq!(stats.timeouts, 1);
    assert_eq!(stats.failures, 1);
    assert_eq!(stats.jobs_completed, 4);
}

#[test]
#[serial]
fn test_stderr_lock_held_by_another_thread() {
    let stop = Arc::new(AtomicBool::new(false));
    let holder = {
        let stop = Arc::clone(&stop);
        std::thread::spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                let mut stderr = std::io::stderr().lock();
                let _ = stderr.flush();
                std::thread::sleep(Duration::from_millis(20));
            }
        })
    };

    let config = config(Duration::from_secs(2)).with_restart_limit(0);
    let mut supervisor = Supervisor::new(Scripted, config);
    let outcomes: Vec<_> = (0..10).map(|_| supervisor.invoke("chatty")).collect();

    stop.store(true, Ordering::Relaxed);
    holder.join().unwrap();

    for outcome in outcomes {
        assert_eq!(outcome.unwrap(), vec![Field::new("said", "hello")]);
    }
    assert_eq!(supervisor.stats().spawns, 10);
}

#[test]
#[serial]
fn test_missing_worker_program_is_spawn_failure() {
    let dir = tempfile::tempdir().unwrap();
    let program = dir.path().join("isofilter-worker");
    let worker = WorkerCommand::new(&program).args(["worker_process", "--exact", "--nocapture"]);
    let config = config(Duration::from_secs(5)).with_worker(worker);
    let mut supervisor = Supervisor::new(Scripted, config);

    let err = supervisor.invoke("a").unwrap_err();
    match &err {
        IsoError::Spawn(msg) => assert!(msg.contains("isofilter-worker"), "{}", msg),
        other => panic!("Expected spawn failure, got {:?}", other),
    }
    assert_eq!(err.as_label(), "spawn");

    // No retry happened behind the caller's back; the next call tries again.
    assert_eq!(supervisor.stats().spawn_failures, 1);
    std::os::unix::fs::symlink(std::env::current_exe().unwrap(), &program).unwrap();
    let fields = supervisor.invoke("b").unwrap();
    assert_eq!(fields[0], Field::new("job", "b"));
    assert_eq!(supervisor.stats().spawn_failures, 1);
}

#[test]
#[serial]
fn test_worker_that_never_becomes_ready() {
    let config = config(Duration::from_millis(500)).with_worker(worker_command("stalled_worker_process"));
    let mut supervisor = Supervisor::new(Scripted, config);

    let start = Instant::now();
    let err = supervisor.invoke("a").unwrap_err();
    assert!(matches!(&err, IsoError::Spawn(msg) if msg.contains("not ready")), "{:?}", err);
    assert!(start.elapsed() < Duration::from_secs(3));
    assert!(supervisor.worker_pid().is_none());
    assert_eq!(supervisor.stats().spawns, 1);
    assert_eq!(supervisor.stats().spawn_failures, 1);
}

#[test]
#[serial]
fn test_shutdown_is_idempotent() {
    let mut supervisor = supervisor(Duration::from_secs(5));
    supervisor.shutdown();

    supervisor.invoke("a").unwrap();
    assert!(supervisor.worker_pid().is_some());
    supervisor.shutdown();
    supervisor.shutdown();
    assert!(supervisor.worker_pid().is_none());
}

#[test]
#[serial]
fn test_independent_supervisors() {
    let mut first = supervisor(Duration::from_secs(5));
    let mut second = supervisor(Duration::from_secs(5));

    first.invoke("a").unwrap();
    second.invoke("b").unwrap();
    assert_ne!(first.worker_pid(), second.worker_pid());

    assert!(first.invoke("bad").is_err());
    let pid = second.worker_pid();
    second.invoke("c").unwrap();
    assert_eq!(second.worker_pid(), pid);
}
