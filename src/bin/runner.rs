use clap::Parser;
use setuid_runner::executor::ExecutorRegistry;
use setuid_runner::log_sink::{LogSink, StdioLogSink};
use setuid_runner::orchestration::{load_config, read_script};
use setuid_runner::{JobOptions, JobRunner, RunError};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(name = "setuid-runner", version)]
#[command(about = "Run a CI build script, optionally as the validated submitter")]
struct Args {
    /// Path to TOML configuration file
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Login of the user who triggered the job
    #[arg(long, env = "GITLAB_USER_LOGIN", default_value = "")]
    login: String,

    /// Project namespace
    #[arg(long, env = "CI_PROJECT_NAMESPACE", default_value = "")]
    namespace: String,

    /// Project name
    #[arg(long, env = "CI_PROJECT_NAME", default_value = "")]
    project: String,

    /// Run the shell as this user (plain mode only)
    #[arg(long)]
    user: Option<String>,

    /// Job identifier used in logs
    #[arg(long, default_value = "local")]
    job_id: String,

    /// Extra environment for the job (KEY=VALUE, repeatable)
    #[arg(long = "env", short = 'e', value_parser = parse_env)]
    env: Vec<(String, String)>,

    /// Build script to run
    script: PathBuf,
}

fn parse_env(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{}'", s)),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "job failed");
            eprintln!("setuid-runner: {}", e);
            if e.is_build_failure() {
                ExitCode::from(1)
            } else {
                ExitCode::from(2)
            }
        }
    }
}

async fn run(args: Args) -> Result<(), RunError> {
    let config = load_config(args.config.as_deref())?;

    setuid_runner::init_tracing(&config.log_filter, true);

    if args.config.is_some() {
        tracing::info!(path = ?args.config, "loaded configuration from file");
    } else {
        tracing::warn!("no config file specified, using defaults");
    }

    let registry = ExecutorRegistry::with_defaults();
    let provider = registry.get(config.executor.name())?;
    let executor = provider.create();
    tracing::info!(
        executor = executor.name(),
        setuid = config.setuid,
        features = ?provider.features,
        "starting runner"
    );

    let script = read_script(&args.script)?;
    let job = JobOptions {
        job_id: args.job_id,
        login: args.login,
        user: args.user,
        namespace: args.namespace,
        project: args.project,
        env: args.env.into_iter().collect::<BTreeMap<_, _>>(),
        script,
    };

    let sink: Arc<dyn LogSink> = Arc::new(StdioLogSink::new(true));
    let cancel = CancellationToken::new();
    let ctrl_c_cancel = cancel.clone();
    drop(tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, cancelling job");
            ctrl_c_cancel.cancel();
        }
    }));

    let runner = JobRunner::in_current_dir(config, executor)?;
    if let Err(e) = runner.execute(&job, sink.clone(), cancel).await {
        sink.error(&job.job_id, &e.to_string());
        return Err(e);
    }
    Ok(())
}
