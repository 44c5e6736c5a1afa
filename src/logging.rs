//! Logging setup for isofilter.
//!
//! # Environment Variables
//!
//! - `ISOFILTER_LOG` - Log filter (overrides RUST_LOG)
//! - `ISOFILTER_LOG_LEVEL` - Log level: error, warn, info, debug, trace
//! - `ISOFILTER_LOG_FORMAT` - Output format: pretty, compact, json
//! - `ISOFILTER_LOG_FILE` - Path to log file (in addition to stderr)
//! - `RUST_LOG` - Standard Rust log filter (fallback)
//!
//! # Example
//!
//! ```no_run
//! use isofilter::logging::{LogConfig, init};
//!
//! init(LogConfig::default().with_env_overrides());
//! ```

use std::path::{Path, PathBuf};
use std::str::FromStr;

use tracing::{Level, Subscriber};
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, MakeWriter},
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
};

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable multi-field format
    #[default]
    Pretty,
    /// Compact single-line format
    Compact,
    /// JSON format for log aggregation systems
    Json,
}

impl LogFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pretty => "pretty",
            Self::Compact => "compact",
            Self::Json => "json",
        }
    }
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        if wanted == "full" {
            return Ok(Self::Pretty);
        }
        [Self::Pretty, Self::Compact, Self::Json]
            .into_iter()
            .find(|format| format.as_str() == wanted)
            .ok_or_else(|| format!("unknown log format '{}' (expected pretty, compact or json)", s))
    }
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Base log level (default: WARN)
    pub level: Level,
    pub format: LogFormat,
    /// Also append logs to this file
    pub file_path: Option<PathBuf>,
    /// Custom filter string (overrides level if set)
    pub filter: Option<String>,
    pub show_target: bool,
    /// ANSI colors on stderr
    pub ansi: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::WARN,
            format: LogFormat::Pretty,
            file_path: None,
            filter: None,
            show_target: true,
            ansi: true,
        }
    }
}

impl LogConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_file(mut self, path: PathBuf) -> Self {
        self.file_path = Some(path);
        self
    }

    pub fn with_filter(mut self, filter: String) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_ansi(mut self, ansi: bool) -> Self {
        self.ansi = ansi;
        self
    }

    /// Apply environment variable overrides.
    ///
    /// A filter that is already set (from the command line) wins over
    /// `ISOFILTER_LOG`, `RUST_LOG` and `ISOFILTER_LOG_LEVEL`.
    pub fn with_env_overrides(mut self) -> Self {
        let env = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());

        if self.filter.is_none() {
            self.filter = env("ISOFILTER_LOG").or_else(|| env("RUST_LOG"));
        }
        if self.filter.is_none()
            && let Some(level) = env("ISOFILTER_LOG_LEVEL").and_then(|l| parse_level(&l))
        {
            self.level = level;
        }
        if let Some(format) = env("ISOFILTER_LOG_FORMAT").and_then(|f| f.parse().ok()) {
            self.format = format;
        }
        if let Some(path) = env("ISOFILTER_LOG_FILE") {
            self.file_path = Some(PathBuf::from(path));
        }
        self
    }

    fn build_filter(&self) -> EnvFilter {
        let fallback = || EnvFilter::new(self.level.as_str().to_lowercase());
        let Some(directives) = &self.filter else {
            return fallback();
        };
        EnvFilter::try_new(directives).unwrap_or_else(|e| {
            eprintln!("warning: ignoring log filter '{}': {}", directives, e);
            fallback()
        })
    }
}

/// Parse a log level name ("warning" is accepted for "warn").
pub fn parse_level(s: &str) -> Option<Level> {
    match s.trim() {
        w if w.eq_ignore_ascii_case("warning") => Some(Level::WARN),
        other => other.parse().ok(),
    }
}

/// One formatting layer for `writer` in the configured format.
fn fmt_layer<S, W>(
    format: LogFormat,
    show_target: bool,
    ansi: bool,
    writer: W,
) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = fmt::layer()
        .with_target(show_target)
        .with_ansi(ansi)
        .with_writer(writer);
    match format {
        LogFormat::Json => layer.json().boxed(),
        LogFormat::Compact => layer.compact().boxed(),
        LogFormat::Pretty => layer.boxed(),
    }
}

/// Initialize the global tracing subscriber.
///
/// Logs go to stderr, and additionally to `config.file_path` when set.
/// Subsequent calls are silently ignored.
pub fn init(config: LogConfig) {
    let filter = config.build_filter();

    let mut layers = vec![fmt_layer(
        config.format,
        config.show_target,
        config.ansi,
        std::io::stderr,
    )];

    if let Some(path) = &config.file_path {
        let parent = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("isofilter.log");
        let appender = tracing_appender::rolling::never(parent, file_name);
        layers.push(fmt_layer(config.format, config.show_target, false, appender));
    }

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(layers)
        .try_init();
}
