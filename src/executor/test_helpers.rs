//! Shared test utilities for executor tests
//!
//! Provides builders and helpers to reduce boilerplate in executor unit tests.

use super::traits::{BuildShell, ExecutorCommand, ScriptDelivery};
use crate::identity::Identity;
use crate::log_sink::{LogSink, LogSource, MemoryLogSink};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Builder for BuildShell with sensible test defaults
///
/// - no shell arguments
/// - script delivered on stdin
/// - no identity switch
pub struct TestShellBuilder {
    command: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    delivery: ScriptDelivery,
    run_as: Option<Identity>,
}

#[allow(dead_code)]
impl TestShellBuilder {
    /// Create a new builder for the given shell command
    pub fn new(command: &str) -> Self {
        Self {
            command: command.to_string(),
            args: vec![],
            env: BTreeMap::new(),
            delivery: ScriptDelivery::Stdin,
            run_as: None,
        }
    }

    /// Set the shell arguments
    pub fn args(mut self, args: Vec<&str>) -> Self {
        self.args = args.into_iter().map(String::from).collect();
        self
    }

    /// Add an environment variable
    pub fn env(mut self, key: &str, value: &str) -> Self {
        let _ = self.env.insert(key.to_string(), value.to_string());
        self
    }

    /// Deliver the script on stdin
    pub fn stdin(mut self) -> Self {
        self.delivery = ScriptDelivery::Stdin;
        self
    }

    /// Deliver the script as a temporary file with the given extension
    pub fn temp_file(mut self, extension: &str) -> Self {
        self.delivery = ScriptDelivery::TempFile {
            extension: extension.to_string(),
        };
        self
    }

    pub fn run_as(mut self, identity: Identity) -> Self {
        self.run_as = Some(identity);
        self
    }

    pub fn build(self) -> BuildShell {
        BuildShell {
            command: self.command,
            args: self.args,
            env: self.env,
            delivery: self.delivery,
            run_as: self.run_as,
        }
    }
}

/// Wrap a shell and script into an ExecutorCommand backed by a memory sink
pub fn command_for(
    job_id: &str,
    shell: BuildShell,
    script: &str,
    builds_dir: impl Into<PathBuf>,
) -> (ExecutorCommand, Arc<MemoryLogSink>) {
    let sink = Arc::new(MemoryLogSink::new());
    let command = ExecutorCommand {
        job_id: job_id.to_string(),
        script: script.to_string(),
        shell,
        builds_dir: builds_dir.into(),
        sink: sink.clone() as Arc<dyn LogSink>,
        cancel: CancellationToken::new(),
    };
    (command, sink)
}

/// Wait until the sink has seen `expected` on the job's stdout
pub async fn wait_for_line(sink: &MemoryLogSink, expected: &str) {
    wait_for_message(sink, LogSource::JobStdout, expected).await
}

/// Wait until the sink has seen `expected` from `source`
///
/// Gives up after ten seconds so a broken test fails instead of hanging.
pub async fn wait_for_message(sink: &MemoryLogSink, source: LogSource, expected: &str) {
    for _ in 0..500 {
        if sink
            .messages(source)
            .iter()
            .any(|line| line == expected)
        {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let shell = TestShellBuilder::new("sh").build();

        assert_eq!(shell.command, "sh");
        assert!(shell.args.is_empty());
        assert_eq!(shell.delivery, ScriptDelivery::Stdin);
        assert!(shell.run_as.is_none());
    }

    #[test]
    fn test_builder_with_file_delivery() {
        let shell = TestShellBuilder::new("bash")
            .args(vec!["--login"])
            .temp_file("sh")
            .env("A", "1")
            .build();

        assert_eq!(shell.args, vec!["--login".to_string()]);
        assert_eq!(
            shell.delivery,
            ScriptDelivery::TempFile {
                extension: "sh".to_string()
            }
        );
        assert_eq!(shell.env.get("A").map(String::as_str), Some("1"));
    }
}
