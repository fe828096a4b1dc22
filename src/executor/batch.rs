//! Batch job adapter
//!
//! Submits the build shell to an external scheduler, reports the job's state
//! every poll interval until it starts running, then blocks on the
//! scheduler's own wait until the job finishes. No local timeout applies:
//! the scheduler owns the job's lifetime.
//!
//! Cancelling the run asks the scheduler to terminate the job, then still
//! waits for the scheduler to report it finished before releasing the
//! template and session.

use async_trait::async_trait;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use super::scheduler::{JobInfo, JobState, JobTemplate, Scheduler, SchedulerError, SchedulerSession};
use super::traits::{Executor, ExecutorCommand, ExecutorError, ScriptDelivery};
use crate::log_sink::LogSink;

/// Interval between status queries while a job is queued
pub const STATUS_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Directory under the build root holding submitted scripts
const BATCH_SCRIPT_DIR: &str = ".batch";

/// Executor that runs jobs through a batch scheduler
#[derive(Debug, Clone)]
pub struct BatchExecutor {
    scheduler: Arc<dyn Scheduler>,
    poll_interval: Duration,
}

impl BatchExecutor {
    pub fn new(scheduler: Arc<dyn Scheduler>) -> Self {
        Self {
            scheduler,
            poll_interval: STATUS_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Submit a filled-in template, returning the scheduler's job id
    pub async fn submit(
        &self,
        session: &mut dyn SchedulerSession,
        template: &JobTemplate,
    ) -> Result<String, SchedulerError> {
        session
            .run_job(template)
            .await
            .map_err(|source| SchedulerError::Submit { source })
    }

    /// Query the job until it is running or has already finished
    ///
    /// Each non-running state is reported to the sink before sleeping. A
    /// query error ends the loop.
    pub async fn poll_until_running(
        &self,
        session: &mut dyn SchedulerSession,
        job_id: &str,
        run_id: &str,
        sink: &dyn LogSink,
    ) -> Result<JobState, SchedulerError> {
        let mut state = query_status(session, job_id).await?;
        while state != JobState::Running && !state.is_terminal() {
            sink.println(run_id, &format!("status is: {}", state));
            tokio::time::sleep(self.poll_interval).await;
            state = query_status(session, job_id).await?;
        }
        tracing::debug!(job_id = %job_id, state = %state, "batch job left the queue");
        Ok(state)
    }

    /// Ask the scheduler to stop the job
    pub async fn terminate(
        &self,
        session: &mut dyn SchedulerSession,
        job_id: &str,
    ) -> Result<(), SchedulerError> {
        session
            .terminate(job_id)
            .await
            .map_err(|source| SchedulerError::Terminate {
                job_id: job_id.to_string(),
                source,
            })
    }

    /// Block until the scheduler reports the job's final outcome
    pub async fn await_completion(
        &self,
        session: &mut dyn SchedulerSession,
        job_id: &str,
    ) -> Result<JobInfo, SchedulerError> {
        session
            .wait(job_id)
            .await
            .map_err(|source| SchedulerError::Wait {
                job_id: job_id.to_string(),
                source,
            })
    }

    async fn run_batch(
        &self,
        command: &ExecutorCommand,
        script_path: &Path,
    ) -> Result<(), ExecutorError> {
        let mut session = self
            .scheduler
            .open_session()
            .await
            .map_err(|source| SchedulerError::Session { source })?;

        let result = self
            .run_in_session(session.as_mut(), command, script_path)
            .await;

        if let Err(e) = session.exit().await {
            tracing::warn!(job_id = %command.job_id, error = %e, "failed to close scheduler session");
        }
        result
    }

    async fn run_in_session(
        &self,
        session: &mut dyn SchedulerSession,
        command: &ExecutorCommand,
        script_path: &Path,
    ) -> Result<(), ExecutorError> {
        let mut template = session
            .allocate_template()
            .await
            .map_err(|source| SchedulerError::Template { source })?;
        fill_template(&mut template, command, script_path);

        let result = self.submit_and_wait(session, &template, command).await;

        if let Err(e) = session.delete_template(template).await {
            tracing::warn!(job_id = %command.job_id, error = %e, "failed to release job template");
        }
        result
    }

    async fn submit_and_wait(
        &self,
        session: &mut dyn SchedulerSession,
        template: &JobTemplate,
        command: &ExecutorCommand,
    ) -> Result<(), ExecutorError> {
        let batch_id = self.submit(session, template).await?;
        tracing::info!(job_id = %command.job_id, batch_job = %batch_id, scheduler = self.scheduler.name(), "submitted batch job");
        command
            .sink
            .println(&command.job_id, &format!("Submitted batch job {}", batch_id));

        let followed = tokio::select! {
            result = self.follow_job(session, &batch_id, command) => Some(result),
            _ = command.cancel.cancelled() => None,
        };

        let info = match followed {
            Some(result) => result?,
            None => return self.cancel_job(session, &batch_id, command).await,
        };
        job_outcome(&info)?;

        command
            .sink
            .println(&command.job_id, "Successfully completed HPC job");
        Ok(())
    }

    /// Poll until the job leaves the queue, then wait for its outcome
    async fn follow_job(
        &self,
        session: &mut dyn SchedulerSession,
        batch_id: &str,
        command: &ExecutorCommand,
    ) -> Result<JobInfo, SchedulerError> {
        let _ = self
            .poll_until_running(session, batch_id, &command.job_id, command.sink.as_ref())
            .await?;
        self.await_completion(session, batch_id).await
    }

    /// Terminate a cancelled job and wait for the scheduler to confirm it
    async fn cancel_job(
        &self,
        session: &mut dyn SchedulerSession,
        batch_id: &str,
        command: &ExecutorCommand,
    ) -> Result<(), ExecutorError> {
        tracing::info!(job_id = %command.job_id, batch_job = %batch_id, "job cancelled, terminating batch job");
        command
            .sink
            .println(&command.job_id, &format!("Terminating batch job {}", batch_id));

        self.terminate(session, batch_id).await?;
        let info = self.await_completion(session, batch_id).await?;
        tracing::debug!(job_id = %command.job_id, batch_job = %batch_id, info = ?info, "cancelled batch job finished");

        Err(ExecutorError::BuildFailed(format!(
            "batch job {} was cancelled",
            batch_id
        )))
    }
}

#[async_trait]
impl Executor for BatchExecutor {
    fn name(&self) -> &'static str {
        "hpc"
    }

    fn display_name(&self) -> &'static str {
        "HPC"
    }

    async fn run(&self, command: ExecutorCommand) -> Result<(), ExecutorError> {
        let script_path = write_batch_script(&command)
            .await
            .map_err(ExecutorError::ScriptFile)?;

        let result = self.run_batch(&command, &script_path).await;

        if let Err(e) = tokio::fs::remove_file(&script_path).await {
            tracing::debug!(path = %script_path.display(), error = %e, "failed to remove batch script");
        }
        result
    }
}

async fn query_status(
    session: &mut dyn SchedulerSession,
    job_id: &str,
) -> Result<JobState, SchedulerError> {
    session
        .job_status(job_id)
        .await
        .map_err(|source| SchedulerError::Status {
            job_id: job_id.to_string(),
            source,
        })
}

/// Turn the scheduler's final report into the executor result
fn job_outcome(info: &JobInfo) -> Result<(), ExecutorError> {
    if info.aborted {
        return Err(ExecutorError::BuildFailed(format!(
            "batch job {} was aborted before it completed",
            info.job_id
        )));
    }
    if let Some(signal) = &info.terminating_signal {
        return Err(ExecutorError::BuildFailed(format!(
            "batch job {} terminated by signal {}",
            info.job_id, signal
        )));
    }
    match info.exit_status {
        Some(0) | None => Ok(()),
        Some(code) => Err(ExecutorError::BuildFailed(format!(
            "batch job {} exited with status {}",
            info.job_id, code
        ))),
    }
}

fn fill_template(template: &mut JobTemplate, command: &ExecutorCommand, script_path: &Path) {
    let shell = &command.shell;
    template.job_name = format!("ci-job-{}", command.job_id);
    template.remote_command = shell.command.clone();
    template.args = shell.args.clone();
    template.env = shell.env.clone();
    match &shell.delivery {
        ScriptDelivery::TempFile { .. } => {
            template.args.push(script_path.to_string_lossy().into_owned());
        }
        ScriptDelivery::Stdin => template.input_path = Some(script_path.to_path_buf()),
    }
    if let Some(identity) = &shell.run_as {
        template.run_as = Some((identity.uid, identity.gid));
        let _ = template.env.insert("HOME".to_string(), identity.home.to_string_lossy().into_owned());
        let _ = template.env.insert("USER".to_string(), identity.login.clone());
        let _ = template.env.insert("LOGNAME".to_string(), identity.login.clone());
    }
    if command.builds_dir.is_dir() {
        template.working_dir = Some(command.builds_dir.clone());
    }
}

/// Write the script where compute nodes can read it
///
/// The build directory sits on storage shared with the cluster, unlike the
/// runner's private temp directory.
async fn write_batch_script(command: &ExecutorCommand) -> std::io::Result<PathBuf> {
    let dir = command.builds_dir.join(BATCH_SCRIPT_DIR);
    tokio::fs::create_dir_all(&dir).await?;

    let extension = match &command.shell.delivery {
        ScriptDelivery::TempFile { extension } => extension.as_str(),
        ScriptDelivery::Stdin => "stdin",
    };
    let file_stem: String = command
        .job_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    let path = dir.join(format!("{}.{}", file_stem, extension));

    tokio::fs::write(&path, &command.script).await?;
    tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o700)).await?;

    if let Some(identity) = &command.shell.run_as {
        if nix::unistd::geteuid().is_root() {
            let uid = Some(nix::unistd::Uid::from_raw(identity.uid));
            let gid = Some(nix::unistd::Gid::from_raw(identity.gid));
            nix::unistd::chown(&dir, uid, gid).map_err(std::io::Error::from)?;
            nix::unistd::chown(&path, uid, gid).map_err(std::io::Error::from)?;
        }
    }
    Ok(path)
}
