use tracing_subscriber::{
    fmt, fmt::format::FmtSpan, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

pub mod config;
pub mod executor;
pub mod identity;
pub mod log_sink;
pub mod orchestration;
pub mod provision;

pub use config::{JobOptions, RunnerConfig};
pub use orchestration::{JobRunner, RunError, RunState};

/// Initialize tracing with the compact formatter.
///
/// # Arguments
/// * `default_filter` - Filter used when `RUST_LOG` is unset (e.g., "setuid_runner=info")
/// * `use_stderr` - If true, log to stderr so job output on stdout stays clean
///
/// # Panics
/// Panics if tracing has already been initialized
pub fn init_tracing(default_filter: &str, use_stderr: bool) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    if use_stderr {
        let fmt_layer = fmt::layer()
            .compact()
            .with_span_events(FmtSpan::CLOSE)
            .with_writer(std::io::stderr);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .init();
    } else {
        let fmt_layer = fmt::layer().compact().with_span_events(FmtSpan::CLOSE);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .init();
    }
}
