//! Logging setup: stdout plus a daily rolling file.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log file name inside the log directory (a date suffix is added on rotation)
pub const LOG_FILE_NAME: &str = "auction_house.log";

/// Install the global subscriber. Keep the returned guard alive for as long
/// as logs should reach the file.
pub fn init_tracing(log_dir: impl AsRef<Path>) -> anyhow::Result<WorkerGuard> {
    let file_appender = tracing_appender::rolling::daily(log_dir.as_ref(), LOG_FILE_NAME);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = EnvFilter::from_default_env().add_directive("auction_house=info".parse()?);

    let stdout_layer = fmt::layer().with_writer(std::io::stdout);

    let file_layer = fmt::layer().with_writer(non_blocking).with_ansi(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .with(file_layer)
        .try_init()?;

    Ok(guard)
}
