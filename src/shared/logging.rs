use std::path::Path;
use tracing::info;
use tracing_appender::non_blocking;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Keeps the non-blocking writers flushing until dropped at process exit.
pub struct LogGuards {
    _guards: Vec<WorkerGuard>,
}

/// Initialize controller logging: console always, plus a daily rolling file
/// when `log_dir` is writable. Filter comes from `RUST_LOG` (default `info`).
pub fn init_service_logging(log_dir: &str, service_name: &str) -> Result<LogGuards, anyhow::Error> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if !log_dir_writable(log_dir) {
        let (stdout_writer, stdout_guard) = non_blocking(std::io::stdout());
        let console_layer = fmt::layer()
            .with_writer(stdout_writer)
            .with_ansi(true)
            .with_target(false)
            .with_thread_ids(false)
            .with_line_number(false);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .try_init()?;

        info!("Logging initialized - console output only (could not write to {log_dir})");
        return Ok(LogGuards {
            _guards: vec![stdout_guard],
        });
    }

    let _ = rotate_logs_on_startup(log_dir, service_name);

    let file_appender = tracing_appender::rolling::daily(log_dir, format!("{service_name}.log"));
    let (file_writer, file_guard) = non_blocking(file_appender);
    let file_layer = fmt::layer()
        .with_writer(file_writer)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true);

    let (stdout_writer, stdout_guard) = non_blocking(std::io::stdout());
    let console_layer = fmt::layer()
        .with_writer(stdout_writer)
        .with_ansi(true)
        .with_target(false)
        .with_thread_ids(false)
        .with_line_number(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer)
        .try_init()?;

    info!("Logging initialized - logs will be written to {log_dir}/{service_name}.log");
    Ok(LogGuards {
        _guards: vec![file_guard, stdout_guard],
    })
}

fn log_dir_writable(log_dir: &str) -> bool {
    let marker = format!("{log_dir}/.write_test");
    std::fs::create_dir_all(log_dir)
        .and_then(|_| std::fs::File::create(&marker))
        .map(|_| std::fs::remove_file(&marker))
        .is_ok()
}

pub fn rotate_logs_on_startup(log_dir: &str, service_name: &str) -> Result<(), anyhow::Error> {
    let log_file = format!("{log_dir}/{service_name}.log");
    let log_path = Path::new(&log_file);

    if log_path.exists() {
        let timestamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
        let backup_file = format!("{log_dir}/{service_name}.{timestamp}.log");
        std::fs::rename(&log_file, &backup_file)?;
    }

    Ok(())
}
