//! Log sinks for the `trio` binary.
//!
//! Every trio attempt logs its step boundaries with a `trio_id` field, and
//! recovery decisions carry `error_type` and `action`. When `logging.dir` is
//! configured, [`init_production`] keeps those records as JSON lines so one
//! attempt can be traced across email, message and socket. Without it,
//! [`init_cli`] prints them to stderr for a single `send` or `check-config`.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Keeps the JSON file writer flushing; hold it until `main` returns.
pub struct LoggingGuard {
    _guard: WorkerGuard,
}

/// Log trio attempts to `{logs_dir}/trio.log.YYYY-MM-DD` as JSON and
/// mirror them to stderr. `RUST_LOG` overrides `default_level`
/// (`logging.level` in the config).
///
/// # Errors
///
/// Returns an error if the logs directory cannot be created or a global
/// subscriber is already installed.
pub fn init_production(logs_dir: &Path, default_level: &str) -> anyhow::Result<LoggingGuard> {
    std::fs::create_dir_all(logs_dir).map_err(|e| {
        anyhow::anyhow!(
            "failed to create logs directory {}: {e}",
            logs_dir.display()
        )
    })?;

    let file_appender = tracing_appender::rolling::daily(logs_dir, "trio.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking);

    let console_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(env_filter(default_level))
        .with(json_layer)
        .with(console_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))?;

    Ok(LoggingGuard { _guard: guard })
}

/// Log to stderr only.
pub fn init_cli(default_level: &str) {
    // First subscriber wins.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter(default_level))
        .with_writer(std::io::stderr)
        .try_init();
}

fn env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}
