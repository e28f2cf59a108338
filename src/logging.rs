//! Logging initialisation for vShell.
//!
//! When the `VSHELL_LOG` environment variable is set to `1`, structured logs
//! are also written to `vshell.log` in the log directory. Otherwise only
//! stderr output (filtered by `RUST_LOG`) is enabled.
//!
//! Returns a guard that must be kept alive for the duration of the process
//! so that buffered log lines are flushed on exit.

use std::path::Path;

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub const LOG_FILE_NAME: &str = "vshell.log";

pub struct LogGuard {
    _file_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
}

/// Initialise the global tracing subscriber.
///
/// `log_dir` is used only when file logging is enabled; `/tmp` otherwise.
/// `verbose` raises the default level when `RUST_LOG` is unset.
pub fn init(log_dir: Option<&Path>, verbose: bool) -> LogGuard {
    let file_logging = std::env::var("VSHELL_LOG").as_deref() == Ok("1");
    let default_level = if file_logging || verbose { "info" } else { "warn" };
    let filter = || {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
    };

    let file_guard = if file_logging {
        let dir = log_dir.unwrap_or(Path::new("/tmp"));
        let _ = std::fs::create_dir_all(dir);
        let file_appender = tracing_appender::rolling::never(dir, LOG_FILE_NAME);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        let file_layer = fmt::layer().with_writer(non_blocking).with_ansi(false);

        tracing_subscriber::registry()
            .with(filter())
            .with(fmt::layer().with_writer(std::io::stderr))
            .with(file_layer)
            .init();

        Some(guard)
    } else {
        tracing_subscriber::registry()
            .with(filter())
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();

        None
    };

    LogGuard {
        _file_guard: file_guard,
    }
}
