//! Built-in filters available from the command line.

use super::{Field, FieldStream, Filter, Job, MalformedOutput};
use crate::worker::WORKER_ENV;
use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};
use std::process::{Command, Stdio};
use tracing::Span;

/// How the `command` filter turns the program's stdout into fields.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandOutput {
    /// All of stdout becomes one `content` field.
    #[default]
    Content,
    /// Each line is `name<TAB>value`.
    Fields,
}

/// Filters shipped with the binary.
///
/// Serializable, so the binary can hand the selected filter to its workers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BuiltinFilter {
    /// Plain text: file name, size, one `content` field per paragraph.
    Text,
    /// An external program run through `sh -c`, with the job as `$1`.
    Command { command: String, output: CommandOutput },
}

impl BuiltinFilter {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Command { .. } => "command",
        }
    }
}

impl Filter for BuiltinFilter {
    fn extract<'a>(&'a self, job: &Job, log: &Span) -> anyhow::Result<FieldStream<'a>> {
        match self {
            Self::Text => text_filter(job),
            Self::Command { command, output } => command_filter(command, *output, job, log),
        }
    }
}

fn text_filter<'a>(job: &Job) -> anyhow::Result<FieldStream<'a>> {
    let bytes =
        std::fs::read(job.as_path()).with_context(|| format!("failed to read {}", job))?;
    let text = String::from_utf8_lossy(&bytes);

    let filename = job
        .as_path()
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| job.to_string());

    let mut fields = vec![
        Field::new("filename", filename),
        Field::new("size", bytes.len().to_string()),
    ];
    fields.extend(
        text.split("\n\n")
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(|p| Field::new("content", p)),
    );

    Ok(Box::new(fields.into_iter().map(Ok)))
}

fn command_filter<'a>(
    command: &str,
    mode: CommandOutput,
    job: &Job,
    log: &Span,
) -> anyhow::Result<FieldStream<'a>> {
    let output = Command::new("sh")
        .arg("-c")
        .arg(command)
        .arg("isofilter")
        .arg(job.as_os_str())
        .env_remove(WORKER_ENV)
        .stdin(Stdio::null())
        .output()
        .with_context(|| format!("failed to run filter command `{}`", command))?;

    let stderr = String::from_utf8_lossy(&output.stderr);
    if !output.status.success() {
        bail!(
            "filter command exited with {}: {}",
            output.status,
            stderr.trim()
        );
    }
    if !stderr.trim().is_empty() {
        tracing::debug!(parent: log, stderr = %stderr.trim(), "Filter command wrote to stderr");
    }

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    match mode {
        CommandOutput::Content => Ok(Box::new(std::iter::once(Ok(Field::new(
            "content", stdout,
        ))))),
        CommandOutput::Fields => {
            let lines: Vec<String> = stdout.lines().map(String::from).collect();
            Ok(Box::new(
                lines
                    .into_iter()
                    .filter(|line| !line.is_empty())
                    .map(|line| parse_field_line(&line)),
            ))
        }
    }
}

/// Parse one `name<TAB>value` line.
fn parse_field_line(line: &str) -> anyhow::Result<Field> {
    match line.split_once('\t') {
        Some((name, value)) if !name.is_empty() => Ok(Field::new(name, value)),
        _ => Err(MalformedOutput(format!("expected `name<TAB>value`, got {:?}", line)).into()),
    }
}
