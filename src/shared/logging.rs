use std::fs;
use std::path::Path;

use anyhow::Result;
use tracing::info;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize tracing for the proxy: always the console, plus a
/// daily-rotated file when the log directory is writable. Filtering is
/// driven by `RUST_LOG` and defaults to `info`.
pub fn init_service_logging(log_dir: &str, service_name: &str) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (stdout_writer, stdout_guard) = non_blocking(std::io::stdout());
    let console = fmt::layer()
        .with_writer(stdout_writer)
        .with_ansi(true)
        .with_target(false);

    if fs::create_dir_all(log_dir).is_ok() {
        let _ = backup_previous_log(log_dir, service_name);

        let (file_writer, file_guard) =
            non_blocking(rolling::daily(log_dir, format!("{service_name}.log")));
        let file = fmt::layer()
            .with_writer(file_writer)
            .with_ansi(false)
            .with_target(true);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(console)
            .with(file)
            .init();

        // The writer guards must outlive the process.
        std::mem::forget(stdout_guard);
        std::mem::forget(file_guard);

        info!("logging to console and {log_dir}/{service_name}.log");
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(console)
            .init();

        std::mem::forget(stdout_guard);

        info!("logging to console only, {log_dir} is not writable");
    }

    Ok(())
}

/// Move the previous run's log aside so each start writes a fresh file.
fn backup_previous_log(log_dir: &str, service_name: &str) -> Result<()> {
    let current = format!("{log_dir}/{service_name}.log");
    if Path::new(&current).exists() {
        let timestamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
        fs::rename(&current, format!("{log_dir}/{service_name}.{timestamp}.log"))?;
    }
    Ok(())
}
