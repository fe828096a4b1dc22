//! Job execution subsystem
//!
//! Two executor variants share one `Executor` trait:
//! - `ShellExecutor` runs the build script as a local process group
//! - `BatchExecutor` submits it to a batch scheduler (Slurm by default)
//!
//! Variants are looked up by name in an `ExecutorRegistry` built at startup.

mod batch;
mod registry;
mod scheduler;
mod shell;
mod slurm;
mod traits;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use batch::{BatchExecutor, STATUS_POLL_INTERVAL};
pub use registry::{
    ExecutorDefaults, ExecutorFeatures, ExecutorProvider, ExecutorRegistry, RegistryError,
    ShellType,
};
pub use scheduler::{
    BackendError, JobInfo, JobState, JobTemplate, Scheduler, SchedulerError, SchedulerSession,
};
pub use shell::{ShellExecutor, KILL_RETRY_INTERVAL};
pub use slurm::{SlurmCommands, SlurmScheduler};
pub use traits::{BuildShell, Executor, ExecutorCommand, ExecutorError, ScriptDelivery};

// Re-export mocks for testing
#[cfg(test)]
pub use scheduler::mock::MockScheduler;
#[cfg(test)]
pub use traits::mock::MockExecutor;

/// Available executor variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorType {
    /// Local process group
    #[default]
    Shell,
    /// Batch scheduler
    Hpc,
}

impl ExecutorType {
    /// Registry key for this variant
    pub fn name(self) -> &'static str {
        match self {
            ExecutorType::Shell => "shell",
            ExecutorType::Hpc => "hpc",
        }
    }
}

impl std::fmt::Display for ExecutorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ExecutorType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "shell" => Ok(ExecutorType::Shell),
            "hpc" => Ok(ExecutorType::Hpc),
            _ => Err(format!(
                "unknown executor '{}'. valid options: 'shell', 'hpc'",
                s
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_executor_type_parse() {
        assert_eq!("shell".parse::<ExecutorType>(), Ok(ExecutorType::Shell));
        assert_eq!("HPC".parse::<ExecutorType>(), Ok(ExecutorType::Hpc));
        assert!("docker".parse::<ExecutorType>().is_err());
        assert_eq!(ExecutorType::Hpc.to_string(), "hpc");
    }

    #[test]
    fn test_every_type_is_registered() {
        let registry = ExecutorRegistry::with_defaults();
        for executor_type in [ExecutorType::Shell, ExecutorType::Hpc] {
            let provider = registry
                .get(executor_type.name())
                .expect("built-in executor registered");
            assert_eq!(provider.create().name(), executor_type.name());
        }
    }
}
