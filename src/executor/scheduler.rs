//! Batch scheduler contract
//!
//! The batch executor only relies on this much of a scheduler: sessions,
//! job templates, submission returning an opaque id, a status query with a
//! small set of states, a terminate request, and a blocking wait for the
//! final outcome.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Failure reported by a scheduler backend
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct BackendError(pub String);

impl From<std::io::Error> for BackendError {
    fn from(e: std::io::Error) -> Self {
        BackendError(e.to_string())
    }
}

/// Scheduler failures, one kind per contract call
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("failed to open scheduler session: {source}")]
    Session {
        #[source]
        source: BackendError,
    },

    #[error("failed to allocate job template: {source}")]
    Template {
        #[source]
        source: BackendError,
    },

    #[error("failed to submit job: {source}")]
    Submit {
        #[source]
        source: BackendError,
    },

    #[error("failed to query status of job {job_id}: {source}")]
    Status {
        job_id: String,
        #[source]
        source: BackendError,
    },

    #[error("failed waiting for job {job_id}: {source}")]
    Wait {
        job_id: String,
        #[source]
        source: BackendError,
    },

    #[error("failed to terminate job {job_id}: {source}")]
    Terminate {
        job_id: String,
        #[source]
        source: BackendError,
    },
}

/// Remote job state as reported by the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Undetermined,
    Queued,
    Running,
    Suspended,
    Done,
    Failed,
}

impl JobState {
    /// No further transitions will happen
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Done | JobState::Failed)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Undetermined => write!(f, "undetermined"),
            JobState::Queued => write!(f, "queued"),
            JobState::Running => write!(f, "running"),
            JobState::Suspended => write!(f, "suspended"),
            JobState::Done => write!(f, "done"),
            JobState::Failed => write!(f, "failed"),
        }
    }
}

/// Description of a job to submit
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobTemplate {
    pub job_name: String,
    pub remote_command: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub working_dir: Option<PathBuf>,
    /// File fed to the job's standard input
    pub input_path: Option<PathBuf>,
    /// Numeric uid/gid to submit on behalf of
    pub run_as: Option<(u32, u32)>,
}

/// Final outcome of a job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobInfo {
    pub job_id: String,
    /// Exit status of the job script, if it exited
    pub exit_status: Option<i32>,
    /// Signal that terminated the job, if any
    pub terminating_signal: Option<String>,
    /// The job never ran (cancelled while queued, node failure)
    pub aborted: bool,
}

/// An open connection to the scheduler
#[async_trait]
pub trait SchedulerSession: Send {
    async fn allocate_template(&mut self) -> Result<JobTemplate, BackendError>;

    async fn delete_template(&mut self, template: JobTemplate) -> Result<(), BackendError>;

    /// Submit a job, returning its scheduler id
    async fn run_job(&mut self, template: &JobTemplate) -> Result<String, BackendError>;

    async fn job_status(&mut self, job_id: &str) -> Result<JobState, BackendError>;

    /// Block until the job reaches a terminal state
    async fn wait(&mut self, job_id: &str) -> Result<JobInfo, BackendError>;

    /// Ask the scheduler to stop a queued or running job
    async fn terminate(&mut self, job_id: &str) -> Result<(), BackendError>;

    async fn exit(&mut self) -> Result<(), BackendError>;
}

/// Factory for scheduler sessions
#[async_trait]
pub trait Scheduler: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &'static str;

    async fn open_session(&self) -> Result<Box<dyn SchedulerSession>, BackendError>;
}
