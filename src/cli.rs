//! Command-line interface definitions using clap.

use clap::{Parser, Subcommand, ValueEnum};
use isofilter::filter::builtin::{BuiltinFilter, CommandOutput};
use isofilter::logging::LogFormat;
use isofilter::worker::WorkerCommand;
use isofilter::{MemorySize, SupervisorConfig};
use std::path::PathBuf;
use std::time::Duration;
use tracing::Level;

/// Run content filters over files in isolated, supervised worker processes.
#[derive(Parser, Debug)]
#[command(name = "isofilter")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose logging (-v for info, -vv for debug, -vvv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only log errors.
    #[arg(short, long, conflicts_with = "verbose", global = true)]
    pub quiet: bool,

    /// Disable colored output.
    #[arg(long, env = "NO_COLOR", global = true)]
    pub no_color: bool,

    /// Log output format (pretty, compact, json).
    #[arg(long, global = true)]
    pub log_format: Option<LogFormat>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Extract fields from files, one supervised job per file.
    Extract(ExtractArgs),
}

/// Built-in filter selection.
#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FilterKind {
    /// File name, size and paragraphs of a text file.
    #[default]
    Text,
    /// Output of an external command.
    Command,
}

/// How stdout of `--exec` maps to fields.
#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ExecOutput {
    /// All output becomes one `content` field.
    #[default]
    Content,
    /// One `name<TAB>value` field per line.
    Fields,
}

/// Output format for extraction records.
#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    /// One JSON object per job.
    #[default]
    Json,
    /// `job: name=value` lines.
    Plain,
}

/// Arguments for the extract command.
#[derive(Parser, Debug)]
pub struct ExtractArgs {
    /// Files to process. Reads one path per line from stdin when omitted.
    pub files: Vec<PathBuf>,

    /// Filter to run in the worker.
    #[arg(long, value_enum, default_value_t = FilterKind::Text)]
    pub filter: FilterKind,

    /// Shell command for the `command` filter; the file path is `$1`.
    #[arg(long, required_if_eq("filter", "command"))]
    pub exec: Option<String>,

    /// How the command's stdout becomes fields.
    #[arg(long, value_enum, default_value_t = ExecOutput::Content)]
    pub exec_output: ExecOutput,

    /// Output format.
    #[arg(long, value_enum, default_value_t = OutputFormat::Json)]
    pub format: OutputFormat,

    /// Seconds a single job may run before its worker is killed.
    #[arg(long, env = "ISOFILTER_TIMEOUT", default_value = "30", value_parser = parse_seconds)]
    pub timeout: Duration,

    /// Jobs one worker serves before it is replaced (0 = fresh worker per job).
    #[arg(long, env = "ISOFILTER_RESTART_LIMIT", default_value_t = 1000)]
    pub restart_limit: usize,

    /// Retire a worker once its peak memory exceeds this (e.g. "512M", "2G").
    #[arg(long, env = "ISOFILTER_MEMORY_LIMIT")]
    pub memory_limit: Option<MemorySize>,

    /// Run as a filter worker (internal use only).
    #[arg(long, hide = true)]
    pub internal_worker: bool,
}

impl ExtractArgs {
    /// The filter selected by `--filter` and `--exec`.
    pub fn builtin_filter(&self) -> BuiltinFilter {
        match (self.filter, &self.exec) {
            (FilterKind::Command, Some(command)) => BuiltinFilter::Command {
                command: command.clone(),
                output: match self.exec_output {
                    ExecOutput::Content => CommandOutput::Content,
                    ExecOutput::Fields => CommandOutput::Fields,
                },
            },
            _ => BuiltinFilter::Text,
        }
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        let config = SupervisorConfig::new()
            .with_timeout(self.timeout)
            .with_restart_limit(self.restart_limit);
        match self.memory_limit {
            Some(limit) => config.with_memory_limit(limit),
            None => config,
        }
    }
}

/// Parse a positive number of seconds, fractions allowed.
fn parse_seconds(s: &str) -> Result<Duration, String> {
    let secs: f64 = s
        .trim()
        .parse()
        .map_err(|_| format!("invalid number of seconds: '{}'", s))?;
    if !secs.is_finite() || secs <= 0.0 {
        return Err(format!("timeout must be positive, got '{}'", s));
    }
    Ok(Duration::from_secs_f64(secs))
}

/// Verbosity levels derived from -v/-q.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Verbosity {
    /// -q: errors only.
    Quiet,
    /// Default: warnings, including every killed worker.
    Normal,
    /// -v: worker spawns and the run summary.
    Info,
    /// -vv: recycling decisions.
    Debug,
    /// -vvv: per-job timing.
    Trace,
}

impl Verbosity {
    pub fn level(self) -> Level {
        match self {
            Self::Quiet => Level::ERROR,
            Self::Normal => Level::WARN,
            Self::Info => Level::INFO,
            Self::Debug => Level::DEBUG,
            Self::Trace => Level::TRACE,
        }
    }
}

impl Cli {
    /// Command that starts a worker with this invocation's logging options.
    pub fn worker_command(&self) -> WorkerCommand {
        let mut command = WorkerCommand::current_exe();
        match self.verbosity() {
            Verbosity::Quiet => command = command.arg("-q"),
            Verbosity::Normal => {}
            _ => command = command.arg(format!("-{}", "v".repeat(self.verbose as usize))),
        }
        if self.no_color {
            command = command.arg("--no-color");
        }
        if let Some(format) = self.log_format {
            command = command.args(["--log-format", format.as_str()]);
        }
        command.args(["extract", "--internal-worker"])
    }

    /// Get the verbosity level based on -v/-q flags.
    pub fn verbosity(&self) -> Verbosity {
        if self.quiet {
            return Verbosity::Quiet;
        }
        match self.verbose {
            0 => Verbosity::Normal,
            1 => Verbosity::Info,
            2 => Verbosity::Debug,
            _ => Verbosity::Trace,
        }
    }
}
