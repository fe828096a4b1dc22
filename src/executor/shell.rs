//! Local process executor
//!
//! Runs the build script as a child process in its own process group so the
//! whole subtree can be signalled at once. Output is streamed line by line to
//! the job's trace sink while the process runs.
//!
//! On cancellation the process group is signalled, and signalled again every
//! `kill_retry_interval`, until the child's exit is observed. There is no
//! escalation and no deadline: a job that survives repeated signals keeps the
//! call blocked, which is visible to the operator.

use async_trait::async_trait;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::traits::{BuildShell, Executor, ExecutorCommand, ExecutorError, ScriptDelivery};
use crate::identity::Identity;
use crate::log_sink::{LogSink, LogSource};

/// Interval between termination signals while waiting for a cancelled job
pub const KILL_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// How long to keep draining output after the process group is gone
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

type WaitResult = std::io::Result<ExitStatus>;

/// Executor that runs the script as a local child process
#[derive(Debug, Clone)]
pub struct ShellExecutor {
    kill_signal: Signal,
    kill_retry_interval: Duration,
}

impl ShellExecutor {
    pub fn new() -> Self {
        Self {
            kill_signal: Signal::SIGKILL,
            kill_retry_interval: KILL_RETRY_INTERVAL,
        }
    }

    /// Override the signal and retry interval used to terminate cancelled jobs
    pub fn with_kill_policy(kill_signal: Signal, kill_retry_interval: Duration) -> Self {
        Self {
            kill_signal,
            kill_retry_interval,
        }
    }

    /// Run `script` with `shell`, streaming output to `sink`
    ///
    /// Returns only once the child has exited, whether it finished on its own
    /// or was terminated after `cancel` fired.
    pub async fn run_script(
        &self,
        job_id: &str,
        shell: &BuildShell,
        script: &str,
        sink: Arc<dyn LogSink>,
        cancel: &CancellationToken,
    ) -> Result<(), ExecutorError> {
        let mut cmd = Command::new(&shell.command);
        let _ = cmd
            .args(&shell.args)
            .envs(&shell.env)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);

        // Held until the process exits; dropping it removes the script
        let _script_dir = match &shell.delivery {
            ScriptDelivery::TempFile { extension } => {
                let (dir, path) = write_script_file(script, extension, shell.run_as.as_ref())
                    .map_err(ExecutorError::ScriptFile)?;
                let _ = cmd.arg(&path).stdin(Stdio::null());
                Some(dir)
            }
            ScriptDelivery::Stdin => {
                let _ = cmd.stdin(Stdio::piped());
                None
            }
        };

        if let Some(identity) = &shell.run_as {
            if !run_as(&mut cmd, identity) {
                sink.println(
                    job_id,
                    &format!(
                        "WARNING: runner is not root, running as the current user instead of {}",
                        identity.login
                    ),
                );
            }
        }

        tracing::debug!(job_id = %job_id, command = %shell.command, args = ?shell.args, "spawning build shell");
        let mut child = cmd.spawn().map_err(|source| ExecutorError::StartFailed {
            command: shell.command.clone(),
            source,
        })?;
        let pgid = child.id().map(|pid| Pid::from_raw(pid as i32));

        if let Some(mut stdin) = child.stdin.take() {
            let script = script.to_string();
            let job_id = job_id.to_string();
            drop(tokio::spawn(async move {
                if let Err(e) = stdin.write_all(script.as_bytes()).await {
                    tracing::debug!(job_id = %job_id, error = %e, "shell closed stdin early");
                }
                // stdin is dropped here so the shell sees EOF
            }));
        }

        let stdout_task = child
            .stdout
            .take()
            .map(|out| stream_lines(out, job_id, LogSource::JobStdout, sink.clone()));
        let stderr_task = child
            .stderr
            .take()
            .map(|err| stream_lines(err, job_id, LogSource::JobStderr, sink.clone()));

        // Wait on a separate task so cancellation can be observed meanwhile
        let (wait_tx, mut wait_rx) = oneshot::channel::<WaitResult>();
        drop(tokio::spawn(async move {
            let _ = wait_tx.send(child.wait().await);
        }));

        // The group is only signalled while the leader is unreaped; once the
        // exit is observed its id may be reused.
        let outcome = tokio::select! {
            result = &mut wait_rx => result,
            _ = cancel.cancelled() => {
                tracing::info!(job_id = %job_id, "job cancelled, terminating process group");
                self.kill_and_wait(job_id, pgid, &mut wait_rx).await
            }
        };

        drain_output(job_id, stdout_task, stderr_task).await;

        match outcome {
            Ok(Ok(status)) => exit_status_result(status),
            Ok(Err(e)) => Err(ExecutorError::WaitFailed(e)),
            Err(_) => Err(ExecutorError::WaitFailed(std::io::Error::other(
                "wait task ended without reporting an exit status",
            ))),
        }
    }

    /// Signal the process group until the wait channel reports an exit
    async fn kill_and_wait(
        &self,
        job_id: &str,
        pgid: Option<Pid>,
        wait_rx: &mut oneshot::Receiver<WaitResult>,
    ) -> Result<WaitResult, oneshot::error::RecvError> {
        loop {
            // Stop before signalling a group whose leader was already reaped
            if let Ok(result) = wait_rx.try_recv() {
                return Ok(result);
            }
            tracing::debug!(job_id = %job_id, signal = %self.kill_signal, "aborting command");
            if let Some(pgid) = pgid {
                if let Err(e) = killpg(pgid, self.kill_signal) {
                    tracing::debug!(job_id = %job_id, error = %e, "failed to signal process group");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.kill_retry_interval) => {}
                result = &mut *wait_rx => return result,
            }
        }
    }
}

impl Default for ShellExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Executor for ShellExecutor {
    fn name(&self) -> &'static str {
        "shell"
    }

    fn display_name(&self) -> &'static str {
        "Shell"
    }

    async fn run(&self, command: ExecutorCommand) -> Result<(), ExecutorError> {
        self.run_script(
            &command.job_id,
            &command.shell,
            &command.script,
            command.sink.clone(),
            &command.cancel,
        )
        .await
    }
}

/// Map an exit status to the executor result
fn exit_status_result(status: ExitStatus) -> Result<(), ExecutorError> {
    if status.success() {
        return Ok(());
    }
    match (status.code(), status.signal()) {
        (Some(code), _) => Err(ExecutorError::BuildFailed(format!("exit status {}", code))),
        (None, Some(signal)) => Err(ExecutorError::BuildFailed(format!(
            "terminated by signal {}",
            signal
        ))),
        (None, None) => Err(ExecutorError::BuildFailed(status.to_string())),
    }
}

/// Forward lines from a child pipe to the trace sink
///
/// Reads until EOF so the job never sees its output pipe close early.
fn stream_lines<R>(
    reader: R,
    job_id: &str,
    source: LogSource,
    sink: Arc<dyn LogSink>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let job_id = job_id.to_string();
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    // Job output is not necessarily UTF-8
                    let mut line = String::from_utf8_lossy(&buf).into_owned();
                    if !line.ends_with('\n') {
                        line.push('\n');
                    }
                    sink.log(&job_id, source, &line);
                }
                Err(e) => {
                    tracing::warn!(job_id = %job_id, source = ?source, error = %e, "failed to read job output");
                    break;
                }
            }
        }
    })
}

/// Wait for output forwarding to finish
///
/// A descendant that left the process group can hold the pipes open; stop
/// waiting for it after a grace period rather than hang the job.
async fn drain_output(
    job_id: &str,
    stdout_task: Option<JoinHandle<()>>,
    stderr_task: Option<JoinHandle<()>>,
) {
    let drain = async {
        if let Some(task) = stdout_task {
            let _ = task.await;
        }
        if let Some(task) = stderr_task {
            let _ = task.await;
        }
    };
    if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, drain).await.is_err() {
        tracing::warn!(job_id = %job_id, "output pipes still open after job exit, detaching");
    }
}

/// Write the script into a fresh private directory
///
/// When running as root on behalf of another account, the directory and
/// script are handed to that account so the job can read them.
fn write_script_file(
    script: &str,
    extension: &str,
    owner: Option<&Identity>,
) -> std::io::Result<(TempDir, PathBuf)> {
    let dir = tempfile::Builder::new().prefix("build_script").tempdir()?;
    let path = dir.path().join(format!("script.{}", extension));
    std::fs::write(&path, script)?;
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o700))?;

    if let Some(identity) = owner {
        if nix::unistd::geteuid().is_root() {
            chown_to(dir.path(), identity)?;
            chown_to(&path, identity)?;
        }
    }
    Ok((dir, path))
}

fn chown_to(path: &Path, identity: &Identity) -> std::io::Result<()> {
    nix::unistd::chown(
        path,
        Some(nix::unistd::Uid::from_raw(identity.uid)),
        Some(nix::unistd::Gid::from_raw(identity.gid)),
    )
    .map_err(std::io::Error::from)
}

/// Arrange for the child to run as `identity`
///
/// Switching accounts requires root; an unprivileged runner keeps its own
/// identity and only exports the account's environment. Returns whether the
/// account switch was arranged.
fn run_as(cmd: &mut Command, identity: &Identity) -> bool {
    let _ = cmd
        .env("HOME", &identity.home)
        .env("USER", &identity.login)
        .env("LOGNAME", &identity.login);

    if !nix::unistd::geteuid().is_root() {
        tracing::warn!(
            login = %identity.login,
            uid = identity.uid,
            "runner is not root, cannot switch user; job runs with the runner's identity"
        );
        return false;
    }

    let uid = nix::unistd::Uid::from_raw(identity.uid);
    let gid = nix::unistd::Gid::from_raw(identity.gid);
    let mut groups: Vec<nix::unistd::Gid> = identity
        .group_ids
        .iter()
        .map(|g| nix::unistd::Gid::from_raw(*g))
        .collect();
    if !groups.contains(&gid) {
        groups.push(gid);
    }

    // SAFETY: runs in the forked child before exec. It only makes
    // setgroups/setgid/setuid syscalls on data allocated before the fork.
    unsafe {
        let _ = cmd.pre_exec(move || {
            #[cfg(not(target_os = "macos"))]
            nix::unistd::setgroups(&groups).map_err(std::io::Error::from)?;
            #[cfg(target_os = "macos")]
            let _ = &groups;
            nix::unistd::setgid(gid).map_err(std::io::Error::from)?;
            nix::unistd::setuid(uid).map_err(std::io::Error::from)?;
            Ok(())
        });
    }
    true
}
