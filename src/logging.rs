//! Tracing subscriber setup.
//!
//! Console output is always on. When a log file is given, every event is
//! also appended to it without ANSI colours; this is the consolidated
//! per-subject log that records checkpoint outcomes.

use crate::error::{Error, Result};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// Default filter when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "roistat=info";

/// Keeps the file writer alive; logs are flushed when dropped.
#[derive(Debug)]
pub struct LoggingGuard {
    _file_guard: Option<WorkerGuard>,
    log_file: Option<PathBuf>,
}

impl LoggingGuard {
    /// Path of the consolidated log, if file logging is on.
    pub fn log_file(&self) -> Option<&Path> {
        self.log_file.as_deref()
    }
}

fn env_filter(verbose: bool) -> EnvFilter {
    let default = if verbose { "roistat=debug" } else { DEFAULT_FILTER };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// Initialise the global subscriber.
///
/// # Errors
/// [`Error::Io`] if the log file cannot be created, or
/// [`Error::Configuration`] if a global subscriber is already installed.
pub fn init_logging(log_file: Option<&Path>, verbose: bool) -> Result<LoggingGuard> {
    let mut layers = Vec::new();

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(env_filter(verbose));
    layers.push(console_layer.boxed());

    let file_guard = match log_file {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            let (writer, guard) = tracing_appender::non_blocking(file);
            let file_layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true)
                .with_filter(env_filter(verbose))
                .boxed();
            layers.push(file_layer);
            Some(guard)
        }
        None => None,
    };

    Registry::default()
        .with(layers)
        .try_init()
        .map_err(|e| Error::Configuration(format!("logging already initialised: {e}")))?;

    Ok(LoggingGuard {
        _file_guard: file_guard,
        log_file: log_file.map(Path::to_path_buf),
    })
}
