//! isofilter - supervised, isolated content extraction

mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use isofilter::filter::builtin::BuiltinFilter;
use isofilter::logging::{self, LogConfig};
use isofilter::{Field, IsoError, Job, Supervisor};
use owo_colors::{OwoColorize, Stream::Stderr, Stream::Stdout};
use serde::Serialize;
use std::io::{self, BufRead, Write};
use tracing::{info, warn};

use cli::{Cli, Commands, ExtractArgs, OutputFormat, Verbosity};

/// Program entry point: parses CLI arguments, sets up logging, runs the
/// selected command and reports top-level errors with their cause chain.
fn main() {
    let cli = Cli::parse();

    if cli.no_color {
        owo_colors::set_override(false);
    }
    init_logging(&cli);

    let result = match &cli.command {
        Commands::Extract(args) => cmd_extract(&cli, args),
    };

    match result {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            eprintln!(
                "{}: {}",
                "error"
                    .if_supports_color(Stderr, |text| text.red())
                    .if_supports_color(Stderr, |text| text.bold()),
                e
            );
            for cause in e.chain().skip(1) {
                eprintln!(
                    "  {}: {}",
                    "caused by".if_supports_color(Stderr, |text| text.yellow()),
                    cause
                );
            }
            std::process::exit(1);
        }
    }
}

fn init_logging(cli: &Cli) {
    let verbosity = cli.verbosity();
    let mut config = LogConfig::new()
        .with_level(verbosity.level())
        .with_ansi(!cli.no_color);
    // Explicit -v/-q beats ISOFILTER_LOG and RUST_LOG.
    if verbosity != Verbosity::Normal {
        config = config.with_filter(verbosity.level().as_str().to_lowercase());
    }
    config = config.with_env_overrides();
    if let Some(format) = cli.log_format {
        config = config.with_format(format);
    }
    logging::init(config);
}

/// One output record per job.
#[derive(Serialize)]
#[serde(untagged)]
enum Record<'a> {
    Fields { job: &'a Job, fields: &'a [Field] },
    Error { job: &'a Job, error: String, kind: &'static str },
}

fn write_record(format: OutputFormat, record: &Record<'_>) -> Result<()> {
    let mut out = io::stdout().lock();
    match format {
        OutputFormat::Json => {
            serde_json::to_writer(&mut out, record)?;
            writeln!(out)?;
        }
        OutputFormat::Plain => match record {
            Record::Fields { job, fields } => {
                for field in fields.iter() {
                    writeln!(
                        out,
                        "{}: {}={}",
                        job.if_supports_color(Stdout, |text| text.cyan()),
                        field.name.if_supports_color(Stdout, |text| text.bold()),
                        field.value
                    )?;
                }
            }
            Record::Error { job, error, .. } => {
                writeln!(
                    out,
                    "{}: {}: {}",
                    job.if_supports_color(Stdout, |text| text.cyan()),
                    "error".if_supports_color(Stdout, |text| text.red()),
                    error
                )?;
            }
        },
    }
    out.flush()?;
    Ok(())
}

/// Record for a job the supervisor could not complete.
fn error_record<'a>(job: &'a Job, error: &IsoError) -> Record<'a> {
    Record::Error {
        job,
        error: error.to_string(),
        kind: error.as_label(),
    }
}

/// Split raw stdin lines into jobs. Names are kept byte for byte, so paths
/// that are not valid UTF-8 still reach the filter unchanged.
fn stdin_jobs(input: impl BufRead) -> impl Iterator<Item = io::Result<Job>> {
    input.split(b'\n').filter_map(|line| match line {
        Ok(mut line) => {
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if line.iter().all(u8::is_ascii_whitespace) {
                None
            } else {
                Some(Ok(Job::from(line)))
            }
        }
        Err(e) => Some(Err(e)),
    })
}

/// Job identifiers from the command line, or from stdin one per line.
fn job_source(args: &ExtractArgs) -> Box<dyn Iterator<Item = io::Result<Job>>> {
    if args.files.is_empty() {
        Box::new(stdin_jobs(io::stdin().lock()))
    } else {
        Box::new(
            args.files
                .clone()
                .into_iter()
                .map(|path| Ok(Job::from(path))),
        )
    }
}

/// Run the selected filter over every job.
///
/// Returns `Ok(false)` when at least one job failed. A job that fails for
/// any reason, including a worker that could not be started, gets an error
/// record and the run moves on. Only unreadable input or unwritable output
/// aborts.
fn cmd_extract(cli: &Cli, args: &ExtractArgs) -> Result<bool> {
    if args.internal_worker {
        isofilter::worker::run_worker_main::<BuiltinFilter>();
    }

    let filter = args.builtin_filter();
    let config = args.supervisor_config().with_worker(cli.worker_command());
    info!(
        filter = filter.name(),
        timeout_secs = config.timeout.as_secs_f64(),
        restart_limit = config.restart_limit,
        "Starting extraction"
    );

    let mut supervisor = Supervisor::new(filter, config);
    let mut processed = 0usize;
    let mut failed = 0usize;

    for job in job_source(args) {
        let job = job.context("Failed to read job list from stdin")?;
        processed += 1;
        match supervisor.invoke(job.clone()) {
            Ok(fields) => write_record(args.format, &Record::Fields { job: &job, fields: &fields })?,
            Err(e) => {
                failed += 1;
                write_record(args.format, &error_record(&job, &e))?;
            }
        }
    }

    supervisor.shutdown();
    let stats = supervisor.stats();
    info!(
        jobs = processed,
        failed,
        timeouts = stats.timeouts,
        spawns = stats.spawns,
        spawn_failures = stats.spawn_failures,
        recycles = stats.recycles,
        "Extraction finished"
    );
    if failed > 0 {
        warn!("{} of {} jobs failed", failed, processed);
    }
    Ok(failed == 0)
}
