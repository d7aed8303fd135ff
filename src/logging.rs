//! Diagnostic tracing.
//!
//! - **Tracing (this module)**: `RUST_LOG`-filtered output to stderr and,
//!   when a log directory is given, to `dockyard.log` via `tracing-appender`.
//! - **Event journal (`event_log`)**: the plain-text record of daemon events.
//!   Always written by `start`, unaffected by `RUST_LOG`.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub const LOG_FILE: &str = "dockyard.log";

/// Install the global subscriber.
///
/// Defaults to `info` (`debug` when `verbose`) if `RUST_LOG` is unset. The
/// returned guard flushes the file writer on drop; hold it for the life of
/// the process.
pub fn init(verbose: bool, log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let stderr_layer = fmt::layer().with_writer(std::io::stderr).compact();

    match log_dir.filter(|dir| std::fs::create_dir_all(dir).is_ok()) {
        Some(dir) => {
            let appender = tracing_appender::rolling::never(dir, LOG_FILE);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file_layer = fmt::layer().with_writer(writer).with_ansi(false);
            let _ = tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .with(file_layer)
                .try_init();
            Some(guard)
        }
        None => {
            let _ = tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .try_init();
            None
        }
    }
}
