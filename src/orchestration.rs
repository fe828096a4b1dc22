//! Per-job entry point
//!
//! `JobRunner::prepare` decides between SetUID and plain mode, resolves the
//! build and cache directories and the shell invocation. `JobRunner::run`
//! hands the prepared job to the configured executor. Nothing is executed
//! unless preparation fully succeeds.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::{expand_with_pwd, ConfigError, JobOptions, RunnerConfig};
use crate::executor::{
    BuildShell, Executor, ExecutorCommand, ExecutorError, RegistryError, ScriptDelivery,
};
use crate::identity::{validate, Identity, IdentityError, SystemUserDirectory, UserDirectory};
use crate::log_sink::LogSink;
use crate::provision::{
    DirectoryProvisioner, Ownership, ProvisionError, ProvisionRequest, ProvisionedDirs,
    SystemOwnership,
};

/// Error type for job runs
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("could not prepare the SetUID runner: {0}")]
    Identity(#[from] IdentityError),

    #[error("could not prepare the SetUID runner: {0}")]
    Provision(#[from] ProvisionError),

    #[error("could not resolve shell user: {0}")]
    ShellUser(#[source] IdentityError),

    #[error("failed to determine working directory: {0}")]
    WorkingDir(#[source] std::io::Error),

    #[error(transparent)]
    Execute(#[from] ExecutorError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("failed to read build script {}: {source}", .path.display())]
    Script {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl RunError {
    /// The build ran and failed, as opposed to the runner failing
    pub fn is_build_failure(&self) -> bool {
        matches!(self, RunError::Execute(e) if e.is_build_failure())
    }
}

/// Load the runner configuration, or the defaults when no file is given
pub fn load_config(path: Option<&Path>) -> Result<RunnerConfig, RunError> {
    match path {
        Some(path) => Ok(RunnerConfig::from_toml_file(path)?),
        None => Ok(RunnerConfig::default()),
    }
}

/// Read the build script to hand to the executor
pub fn read_script(path: &Path) -> Result<String, RunError> {
    std::fs::read_to_string(path).map_err(|source| RunError::Script {
        path: path.to_path_buf(),
        source,
    })
}

/// Resolved state for one job run
#[derive(Debug, Clone)]
pub struct RunState {
    pub builds_dir: PathBuf,
    pub cache_dir: PathBuf,
    /// Login the shell runs as, if not the runner's own
    pub shell_user: Option<String>,
    /// Validated identity in SetUID mode
    pub identity: Option<Identity>,
    pub build_shell: BuildShell,
}

/// Prepares and runs jobs with one executor and one configuration
pub struct JobRunner {
    config: RunnerConfig,
    executor: Arc<dyn Executor>,
    users: Arc<dyn UserDirectory>,
    provisioner: DirectoryProvisioner<Arc<dyn Ownership>>,
    working_dir: PathBuf,
}

impl JobRunner {
    /// Runner using the system passwd/group database and real `chown`
    pub fn new(config: RunnerConfig, executor: Arc<dyn Executor>, working_dir: PathBuf) -> Self {
        let ownership: Arc<dyn Ownership> = Arc::new(SystemOwnership);
        Self {
            config,
            executor,
            users: Arc::new(SystemUserDirectory),
            provisioner: DirectoryProvisioner::with_ownership(ownership),
            working_dir,
        }
    }

    /// Runner rooted at the process's current directory
    pub fn in_current_dir(
        config: RunnerConfig,
        executor: Arc<dyn Executor>,
    ) -> Result<Self, RunError> {
        let working_dir = std::env::current_dir().map_err(RunError::WorkingDir)?;
        Ok(Self::new(config, executor, working_dir))
    }

    pub fn with_user_directory(mut self, users: Arc<dyn UserDirectory>) -> Self {
        self.users = users;
        self
    }

    pub fn with_ownership(mut self, ownership: Arc<dyn Ownership>) -> Self {
        self.provisioner = DirectoryProvisioner::with_ownership(ownership);
        self
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Resolve directories, identity and shell for `job`
    ///
    /// The mode banner goes to `sink` only once everything succeeded.
    pub fn prepare(&self, job: &JobOptions, sink: &dyn LogSink) -> Result<RunState, RunError> {
        let state = if self.config.setuid {
            let (identity, dirs) = self.prepare_setuid(job)?;
            let shell_user = Some(identity.login.clone());
            RunState {
                build_shell: self.build_shell(job, &dirs.builds_dir, Some(&identity)),
                builds_dir: dirs.builds_dir,
                cache_dir: dirs.cache_dir,
                shell_user,
                identity: Some(identity),
            }
        } else {
            self.prepare_plain(job)?
        };

        tracing::info!(
            job_id = %job.job_id,
            setuid = self.config.setuid,
            executor = self.executor.name(),
            builds_dir = %state.builds_dir.display(),
            cache_dir = %state.cache_dir.display(),
            shell_user = ?state.shell_user,
            "prepared job"
        );
        sink.println(&job.job_id, &self.executor.banner(self.config.setuid));
        Ok(state)
    }

    /// Validate the submitter and provision their directories
    fn prepare_setuid(&self, job: &JobOptions) -> Result<(Identity, ProvisionedDirs), RunError> {
        let identity = validate(self.users.as_ref(), &job.login, &self.config.policy())?;

        let data_dir = self.config.data_dir();
        let request = ProvisionRequest {
            data_dir: &data_dir,
            namespace: &job.namespace,
            project: &job.project,
            builds_template: &self.config.builds_dir,
            cache_template: &self.config.cache_dir,
            working_dir: &self.working_dir,
        };
        let dirs = self.provisioner.provision(&identity, &request)?;
        Ok((identity, dirs))
    }

    /// Expand directory templates; optionally adopt the job's shell user
    fn prepare_plain(&self, job: &JobOptions) -> Result<RunState, RunError> {
        let builds_dir = expand_with_pwd(&self.config.builds_dir, &self.working_dir);
        let cache_dir = expand_with_pwd(&self.config.cache_dir, &self.working_dir);

        let shell_identity = match job.user.as_deref().filter(|u| !u.is_empty()) {
            Some(user) => Some(self.users.lookup(user).map_err(RunError::ShellUser)?),
            None => None,
        };

        Ok(RunState {
            build_shell: self.build_shell(job, &builds_dir, shell_identity.as_ref()),
            builds_dir,
            cache_dir,
            shell_user: shell_identity.map(|identity| identity.login),
            identity: None,
        })
    }

    fn build_shell(
        &self,
        job: &JobOptions,
        builds_dir: &Path,
        run_as: Option<&Identity>,
    ) -> BuildShell {
        let mut env: BTreeMap<String, String> = job.env.clone();
        let _ = env.insert(
            "CI_BUILDS_DIR".to_string(),
            builds_dir.to_string_lossy().into_owned(),
        );
        let _ = env.insert("CI_PROJECT_NAMESPACE".to_string(), job.namespace.clone());
        let _ = env.insert("CI_PROJECT_NAME".to_string(), job.project.clone());
        let _ = env.insert("GITLAB_USER_LOGIN".to_string(), job.login.clone());

        let delivery = if self.config.pass_file {
            ScriptDelivery::TempFile {
                extension: self.config.script_extension.clone(),
            }
        } else {
            ScriptDelivery::Stdin
        };

        BuildShell {
            command: self.config.shell.clone(),
            args: self.config.shell_args.clone(),
            env,
            delivery,
            run_as: run_as.cloned(),
        }
    }

    /// Hand a prepared job to the executor; its result is passed through
    pub async fn run(
        &self,
        job: &JobOptions,
        state: &RunState,
        sink: Arc<dyn LogSink>,
        cancel: CancellationToken,
    ) -> Result<(), RunError> {
        let command = ExecutorCommand {
            job_id: job.job_id.clone(),
            script: job.script.clone(),
            shell: state.build_shell.clone(),
            builds_dir: state.builds_dir.clone(),
            sink,
            cancel,
        };
        self.executor.run(command).await?;
        tracing::info!(job_id = %job.job_id, "job finished");
        Ok(())
    }

    /// Prepare and run in one step
    pub async fn execute(
        &self,
        job: &JobOptions,
        sink: Arc<dyn LogSink>,
        cancel: CancellationToken,
    ) -> Result<RunState, RunError> {
        let state = self.prepare(job, sink.as_ref())?;
        self.run(job, &state, sink, cancel).await?;
        Ok(state)
    }
}
