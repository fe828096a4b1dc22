//! Executor abstraction shared by the shell and batch backends
//!
//! The orchestration layer prepares an `ExecutorCommand` (script, shell
//! invocation, identity, trace sink, cancellation) and hands it to whichever
//! `Executor` the runner is configured with.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::scheduler::SchedulerError;
use crate::identity::Identity;
use crate::log_sink::LogSink;

/// Errors that can occur during job execution
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// The command could not be launched at all
    #[error("failed to start process {command}: {source}")]
    StartFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// The command ran but the build itself failed
    #[error("build failed: {0}")]
    BuildFailed(String),

    /// The command was started but its exit could not be observed
    #[error("failed to wait for process: {0}")]
    WaitFailed(#[source] std::io::Error),

    #[error("failed to write build script: {0}")]
    ScriptFile(#[source] std::io::Error),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

impl ExecutorError {
    /// Whether the error means the build ran and failed, as opposed to the
    /// runner being unable to execute it
    pub fn is_build_failure(&self) -> bool {
        matches!(self, ExecutorError::BuildFailed(_))
    }
}

/// How the script body reaches the shell
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptDelivery {
    /// Write the script to a temporary file and append its path to argv
    TempFile { extension: String },
    /// Write the script to the shell's standard input
    Stdin,
}

/// Shell invocation prepared for a job
#[derive(Debug, Clone)]
pub struct BuildShell {
    pub command: String,
    pub args: Vec<String>,
    /// Added on top of the runner's own environment
    pub env: BTreeMap<String, String>,
    pub delivery: ScriptDelivery,
    /// Account the job runs as; None keeps the runner's identity
    pub run_as: Option<Identity>,
}

/// Everything an executor needs to run one job
pub struct ExecutorCommand {
    pub job_id: String,
    pub script: String,
    pub shell: BuildShell,
    /// Resolved build directory for the job
    pub builds_dir: PathBuf,
    pub sink: Arc<dyn LogSink>,
    pub cancel: CancellationToken,
}

impl std::fmt::Debug for ExecutorCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorCommand")
            .field("job_id", &self.job_id)
            .field("script_len", &self.script.len())
            .field("shell", &self.shell)
            .field("builds_dir", &self.builds_dir)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

/// Main trait for job executors
///
/// Implementations:
/// - `ShellExecutor`: runs the script as a local process group
/// - `BatchExecutor`: submits the script to an external batch scheduler
#[async_trait]
pub trait Executor: Send + Sync {
    /// Registry name ("shell", "hpc")
    fn name(&self) -> &'static str;

    /// Name shown in the mode banner ("Shell", "HPC")
    fn display_name(&self) -> &'static str;

    /// Run a prepared job to completion
    async fn run(&self, command: ExecutorCommand) -> Result<(), ExecutorError>;

    /// Banner printed once preparation succeeds
    fn banner(&self, setuid: bool) -> String {
        if setuid {
            format!("Using SetUID {} executor...", self.display_name())
        } else {
            format!("Using {} executor...", self.display_name())
        }
    }
}
