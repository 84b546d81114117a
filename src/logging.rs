//! Log pipeline for the brain service.
//!
//! One entry point for both run modes: [`LogMode::Service`] writes
//! structured JSON to a daily-rotated file and mirrors human-readable
//! output to stderr; [`LogMode::Console`] is stderr-only for one-shot
//! subcommands. The filter level comes from the loaded configuration,
//! with `RUST_LOG` taking precedence when set.
//!
//! Logging must never take the service down: an unwritable log
//! directory degrades to console-only output, and repeated
//! initialisation keeps the first subscriber.

use std::path::PathBuf;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::BrainConfig;

/// File name stem for rotated service logs (date suffix appended).
const LOG_FILE_STEM: &str = "brain.log";

/// Where log output goes.
pub enum LogMode {
    /// Stderr plus daily-rotated JSON under the given directory.
    Service {
        /// Directory for rotated JSON log files.
        logs_dir: PathBuf,
    },
    /// Stderr only.
    Console,
}

/// Keeps the non-blocking file writer alive.
///
/// Hold this for the life of the process in service mode; dropping it
/// flushes pending entries and closes the file. In console mode it is
/// inert.
pub struct LogHandle {
    _file_guard: Option<WorkerGuard>,
}

/// Install the global subscriber for the chosen mode.
///
/// The default filter is the configured `log_level`; `RUST_LOG`
/// overrides it. Calling this more than once is harmless: the first
/// subscriber wins.
pub fn init(config: &BrainConfig, mode: LogMode) -> LogHandle {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));

    let mut file_guard = None;
    let file_layer = match &mode {
        LogMode::Service { logs_dir } => match std::fs::create_dir_all(logs_dir) {
            Ok(()) => {
                let appender = tracing_appender::rolling::daily(logs_dir, LOG_FILE_STEM);
                let (writer, guard) = tracing_appender::non_blocking(appender);
                file_guard = Some(guard);
                Some(tracing_subscriber::fmt::layer().json().with_writer(writer))
            }
            Err(e) => {
                // Degrade rather than refuse to start: an enclave image
                // with a read-only mount still gets console logs.
                eprintln!(
                    "brain: cannot create log directory {}: {e}; console logging only",
                    logs_dir.display()
                );
                None
            }
        },
        LogMode::Console => None,
    };

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init();

    LogHandle {
        _file_guard: file_guard,
    }
}
