//! Subscriber setup: human-readable stderr plus an append-only run log.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

pub const DEFAULT_LOG_PATH: &str = "output/log.txt";
const DEFAULT_FILTER: &str = "ccsi_harness=info,ccsi=info";
const TIMESTAMP_FORMAT: &str = "[%Y-%m-%d %H:%M:%S]";

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("opening log file {path}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("installing subscriber: {0}")]
    Init(#[from] tracing_subscriber::util::TryInitError),
}

/// Install the global subscriber. `RUST_LOG` overrides the default filter.
///
/// With `log_path` set, every event is also appended to that file without
/// ANSI colouring; parent directories are created as needed.
pub fn init_logging(log_path: Option<&Path>) -> Result<(), LoggingError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_timer(ChronoLocal::new(TIMESTAMP_FORMAT.to_string()));

    let file_layer = match log_path {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent).map_err(|source| LoggingError::Open {
                    path: path.to_path_buf(),
                    source,
                })?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| LoggingError::Open {
                    path: path.to_path_buf(),
                    source,
                })?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(Mutex::new(file))
                    .with_ansi(false)
                    .with_target(false)
                    .with_timer(ChronoLocal::new(TIMESTAMP_FORMAT.to_string())),
            )
        }
        None => None,
    };

    Registry::default()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()?;
    Ok(())
}
