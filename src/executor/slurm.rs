//! Slurm command-line backend for the batch executor
//!
//! Talks to the cluster through `sbatch`, `squeue`, `sacct` and `scancel`.
//! A session is stateless: every call shells out and parses the tool's
//! output.

use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tokio::process::Command;

use super::scheduler::{BackendError, JobInfo, JobState, JobTemplate, Scheduler, SchedulerSession};

/// Interval between state checks while waiting for a job to finish
pub const WAIT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Paths to the Slurm client tools
#[derive(Debug, Clone)]
pub struct SlurmCommands {
    pub sbatch: PathBuf,
    pub squeue: PathBuf,
    pub sacct: PathBuf,
    pub scancel: PathBuf,
}

impl Default for SlurmCommands {
    fn default() -> Self {
        Self {
            sbatch: PathBuf::from("sbatch"),
            squeue: PathBuf::from("squeue"),
            sacct: PathBuf::from("sacct"),
            scancel: PathBuf::from("scancel"),
        }
    }
}

/// Scheduler backed by the Slurm CLI tools on PATH
#[derive(Debug, Clone)]
pub struct SlurmScheduler {
    commands: SlurmCommands,
    wait_interval: Duration,
}

impl SlurmScheduler {
    pub fn new() -> Self {
        Self {
            commands: SlurmCommands::default(),
            wait_interval: WAIT_POLL_INTERVAL,
        }
    }

    pub fn with_commands(commands: SlurmCommands, wait_interval: Duration) -> Self {
        Self {
            commands,
            wait_interval,
        }
    }
}

impl Default for SlurmScheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Scheduler for SlurmScheduler {
    fn name(&self) -> &'static str {
        "slurm"
    }

    async fn open_session(&self) -> Result<Box<dyn SchedulerSession>, BackendError> {
        Ok(Box::new(SlurmSession {
            commands: self.commands.clone(),
            wait_interval: self.wait_interval,
        }))
    }
}

#[derive(Debug)]
struct SlurmSession {
    commands: SlurmCommands,
    wait_interval: Duration,
}

#[async_trait]
impl SchedulerSession for SlurmSession {
    async fn allocate_template(&mut self) -> Result<JobTemplate, BackendError> {
        Ok(JobTemplate::default())
    }

    async fn delete_template(&mut self, _template: JobTemplate) -> Result<(), BackendError> {
        Ok(())
    }

    async fn run_job(&mut self, template: &JobTemplate) -> Result<String, BackendError> {
        let mut cmd = Command::new(&self.commands.sbatch);
        let _ = cmd.args(sbatch_args(template)).envs(&template.env);
        let stdout = run_tool(&mut cmd, &self.commands.sbatch).await?;
        parse_submission(&stdout)
    }

    async fn job_status(&mut self, job_id: &str) -> Result<JobState, BackendError> {
        // squeue only knows about jobs that are still queued or running
        let mut cmd = Command::new(&self.commands.squeue);
        let _ = cmd.args(["-h", "-j", job_id, "-o", "%T"]);
        let live = run_tool(&mut cmd, &self.commands.squeue).await?;
        if let Some(state) = first_word(&live) {
            return Ok(parse_state(state));
        }

        let mut cmd = Command::new(&self.commands.sacct);
        let _ = cmd.args(["-n", "-X", "-P", "-j", job_id, "-o", "State"]);
        let finished = run_tool(&mut cmd, &self.commands.sacct).await?;
        Ok(first_word(&finished)
            .map(parse_state)
            .unwrap_or(JobState::Undetermined))
    }

    async fn wait(&mut self, job_id: &str) -> Result<JobInfo, BackendError> {
        while !self.job_status(job_id).await?.is_terminal() {
            tokio::time::sleep(self.wait_interval).await;
        }

        let mut cmd = Command::new(&self.commands.sacct);
        let _ = cmd.args(["-n", "-X", "-P", "-j", job_id, "-o", "ExitCode,State"]);
        let accounting = run_tool(&mut cmd, &self.commands.sacct).await?;
        parse_accounting(job_id, &accounting)
    }

    async fn terminate(&mut self, job_id: &str) -> Result<(), BackendError> {
        let mut cmd = Command::new(&self.commands.scancel);
        let _ = cmd.arg(job_id);
        let _ = run_tool(&mut cmd, &self.commands.scancel).await?;
        Ok(())
    }

    async fn exit(&mut self) -> Result<(), BackendError> {
        Ok(())
    }
}

/// Run a Slurm tool and return its stdout
async fn run_tool(cmd: &mut Command, program: &std::path::Path) -> Result<String, BackendError> {
    let output = cmd
        .output()
        .await
        .map_err(|e| BackendError(format!("failed to run {}: {}", program.display(), e)))?;

    if !output.status.success() {
        return Err(BackendError(format!(
            "{} exited with {}: {}",
            program.display(),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn sbatch_args(template: &JobTemplate) -> Vec<String> {
    let mut args = vec!["--parsable".to_string()];
    if !template.job_name.is_empty() {
        args.push(format!("--job-name={}", template.job_name));
    }
    if let Some(dir) = &template.working_dir {
        args.push(format!("--chdir={}", dir.display()));
    }
    if let Some(input) = &template.input_path {
        args.push(format!("--input={}", input.display()));
    }
    if let Some((uid, gid)) = template.run_as {
        args.push(format!("--uid={}", uid));
        args.push(format!("--gid={}", gid));
    }

    let command_line: Vec<String> = std::iter::once(&template.remote_command)
        .chain(template.args.iter())
        .map(|word| shell_quote(word))
        .collect();
    args.push(format!("--wrap={}", command_line.join(" ")));
    args
}

/// Quote a word for the `/bin/sh` line sbatch generates from `--wrap`
fn shell_quote(word: &str) -> String {
    if !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c))
    {
        return word.to_string();
    }
    format!("'{}'", word.replace('\'', r"'\''"))
}

/// `sbatch --parsable` prints `<id>` or `<id>;<cluster>`
fn parse_submission(stdout: &str) -> Result<String, BackendError> {
    let id = stdout
        .lines()
        .next()
        .and_then(|line| line.split(';').next())
        .map(str::trim)
        .unwrap_or_default();
    if id.is_empty() {
        return Err(BackendError("sbatch did not report a job id".to_string()));
    }
    Ok(id.to_string())
}

fn first_word(output: &str) -> Option<&str> {
    output.lines().next().and_then(|line| line.split_whitespace().next())
}

/// Map a Slurm job state name to the scheduler contract's states
fn parse_state(state: &str) -> JobState {
    match state.trim_end_matches('+') {
        "PENDING" | "CONFIGURING" | "REQUEUED" | "RESIZING" => JobState::Queued,
        "RUNNING" | "COMPLETING" | "STAGE_OUT" => JobState::Running,
        "SUSPENDED" | "STOPPED" => JobState::Suspended,
        "COMPLETED" => JobState::Done,
        "FAILED" | "CANCELLED" | "TIMEOUT" | "NODE_FAIL" | "OUT_OF_MEMORY" | "PREEMPTED"
        | "BOOT_FAIL" | "DEADLINE" => JobState::Failed,
        _ => JobState::Undetermined,
    }
}

/// Parse `sacct -o ExitCode,State` output (`<code>:<signal>|<state>`)
fn parse_accounting(job_id: &str, output: &str) -> Result<JobInfo, BackendError> {
    let line = output
        .lines()
        .next()
        .ok_or_else(|| BackendError(format!("no accounting record for job {}", job_id)))?;
    let (exit, state) = line.split_once('|').unwrap_or((line, ""));
    let (code, signal) = exit.split_once(':').unwrap_or((exit, "0"));

    let code: i32 = code
        .trim()
        .parse()
        .map_err(|_| BackendError(format!("unexpected exit code {:?} for job {}", exit, job_id)))?;
    let signal: i32 = signal.trim().parse().unwrap_or(0);
    let state = first_word(state).map(parse_state).unwrap_or(JobState::Undetermined);

    let mut info = JobInfo {
        job_id: job_id.to_string(),
        exit_status: None,
        terminating_signal: None,
        aborted: false,
    };
    if signal != 0 {
        info.terminating_signal = Some(signal.to_string());
    } else if state == JobState::Failed && code == 0 {
        // cancelled or lost before the script produced a status
        info.aborted = true;
    } else {
        info.exit_status = Some(code);
    }
    Ok(info)
}
