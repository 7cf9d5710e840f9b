//! Logging setup
//!
//! Everything goes to the install log file (level from `RUST_LOG`, default
//! `info`). Command output is logged at `info` under the `command` target,
//! one event per line as the child writes it.
//! With `--verbose` the same events are mirrored to stderr.

use std::fs::{self, OpenOptions};
use std::path::Path;
use std::sync::Mutex;

use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

use crate::error::{InstallError, Result};

/// Default install log location
pub const DEFAULT_LOG_PATH: &str = "/var/log/archstage-install.log";

fn filter_builder() -> tracing_subscriber::filter::Builder {
    EnvFilter::builder().with_default_directive(LevelFilter::INFO.into())
}

fn env_filter() -> EnvFilter {
    filter_builder().from_env_lossy()
}

/// The filter the install log gets when `RUST_LOG` is unset
#[cfg(test)]
pub(crate) fn default_filter() -> EnvFilter {
    filter_builder().parse_lossy("")
}

/// Install the global subscriber writing to `log_path`.
///
/// Fails if the log file cannot be opened or a subscriber is already set.
pub fn init(log_path: &Path, verbose: bool) -> Result<()> {
    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)?;

    let file_layer = fmt::layer()
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .with_target(true)
        .with_filter(env_filter());

    let stderr_layer = verbose.then(|| {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .with_filter(env_filter())
    });

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .try_init()
        .map_err(|e| InstallError::config(format!("Failed to initialize logging: {}", e)))
}

/// Fallback when the log file is unavailable: stderr only, warnings and up.
pub fn init_stderr() {
    let _ = fmt()
        .with_writer(std::io::stderr)
        .with_max_level(LevelFilter::WARN)
        .try_init();
}

/// Last `n` lines of the log file, for failure reports
pub fn tail(log_path: &Path, n: usize) -> Vec<String> {
    let Ok(content) = fs::read_to_string(log_path) else {
        return Vec::new();
    };
    let lines: Vec<&str> = content.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].iter().map(|l| l.to_string()).collect()
}
