//! Trace sink abstraction for job output
//!
//! Job-facing output (mode banners, child stdout/stderr, scheduler polling
//! status) is written to a `LogSink` rather than to `tracing`, so the same
//! executors can feed a terminal, a log file, or an in-memory buffer:
//! - StdioLogSink: prints directly to stdout/stderr for local execution
//! - MemoryLogSink: buffers entries, used by embedders and tests

use chrono::{DateTime, Utc};
use std::io::Write;
use std::sync::{Arc, Mutex};

// ANSI color codes matching tracing-subscriber
const ANSI_DIM: &str = "\x1b[2m";
const ANSI_RED: &str = "\x1b[31m";
const ANSI_RESET: &str = "\x1b[0m";

/// Where a line of job output came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogSource {
    JobStdout,
    JobStderr,
    System,
}

/// Format an error log line matching tracing-subscriber's format with colors
fn format_error(message: &str) -> String {
    let now: DateTime<Utc> = Utc::now();
    let ts = now.format("%Y-%m-%dT%H:%M:%S%.6fZ");
    format!(
        "{ANSI_DIM}{ts}{ANSI_RESET} {ANSI_RED}ERROR{ANSI_RESET} {ANSI_DIM}setuid_runner:{ANSI_RESET} {message}\n"
    )
}

/// A sink for job execution output
///
/// Implementations handle where output goes - a terminal, a buffer, etc.
pub trait LogSink: Send + Sync {
    /// Write a message with the given source
    fn log(&self, job_id: &str, source: LogSource, message: &str);

    /// Write a plain system line (banners, scheduler status)
    fn println(&self, job_id: &str, message: &str) {
        self.log(job_id, LogSource::System, &format!("{}\n", message));
    }

    /// Log an error message with timestamp and colors (matches tracing format)
    fn error(&self, job_id: &str, message: &str) {
        self.log(job_id, LogSource::System, &format_error(message));
    }
}

/// Log sink that prints to stdout/stderr for local execution
#[derive(Debug)]
pub struct StdioLogSink {
    show_prefix: bool,
}

impl StdioLogSink {
    pub fn new(show_prefix: bool) -> Self {
        Self { show_prefix }
    }
}

impl LogSink for StdioLogSink {
    fn log(&self, _job_id: &str, source: LogSource, message: &str) {
        let output = if self.show_prefix {
            let prefix = match source {
                LogSource::JobStdout => "[job:out] ",
                LogSource::JobStderr => "[job:err] ",
                LogSource::System => "[system] ",
            };
            format!("{}{}", prefix, message)
        } else {
            message.to_string()
        };

        // Route stderr sources to stderr, everything else to stdout
        match source {
            LogSource::JobStderr => {
                let _ = std::io::stderr().write_all(output.as_bytes());
            }
            _ => {
                let _ = std::io::stdout().write_all(output.as_bytes());
            }
        }
    }
}

/// A single buffered entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub job_id: String,
    pub source: LogSource,
    pub message: String,
}

/// Log sink that keeps every entry in memory
#[derive(Debug, Default)]
pub struct MemoryLogSink {
    lines: Mutex<Vec<LogLine>>,
}

impl MemoryLogSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything logged so far
    pub fn lines(&self) -> Vec<LogLine> {
        self.lines
            .lock()
            .map(|lines| lines.clone())
            .unwrap_or_default()
    }

    /// Messages from one source with trailing newlines stripped
    pub fn messages(&self, source: LogSource) -> Vec<String> {
        self.lines()
            .into_iter()
            .filter(|l| l.source == source)
            .map(|l| l.message.trim_end_matches('\n').to_string())
            .collect()
    }
}

impl LogSink for MemoryLogSink {
    fn log(&self, job_id: &str, source: LogSource, message: &str) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.push(LogLine {
                job_id: job_id.to_string(),
                source,
                message: message.to_string(),
            });
        }
    }
}

/// Wrapper to allow using LogSink behind Arc
impl<T: LogSink + ?Sized> LogSink for Arc<T> {
    fn log(&self, job_id: &str, source: LogSource, message: &str) {
        (**self).log(job_id, source, message)
    }
}
