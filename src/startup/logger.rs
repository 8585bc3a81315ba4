//! Logger initialization
//!
//! Logs always go to stderr (stdout belongs to the MCP wire when the inbound
//! transport is stdio), plus an optional file sink when `ONE_MCP_LOG_FILE`
//! or the startup record selects one.

use crate::config::ENV_LOG_LEVEL;
use crate::error::{GatewayError, Result};
use std::path::Path;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the global tracing subscriber. `level` is overridden by
/// `ONE_MCP_LOG_LEVEL`, then by `RUST_LOG` when set.
pub fn init_logging(level: &str, log_file: Option<&Path>) -> Result<()> {
    let level = std::env::var(ENV_LOG_LEVEL).unwrap_or_else(|_| level.to_string());
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| {
                    GatewayError::config(format!(
                        "Failed to open log file '{}': {}",
                        path.display(),
                        e
                    ))
                })?;
            let file_layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(file);
            tracing_subscriber::registry()
                .with(stderr_layer)
                .with(file_layer)
                .with(env_filter)
                .init();
        }
        None => {
            tracing_subscriber::registry()
                .with(stderr_layer)
                .with(env_filter)
                .init();
        }
    }
    Ok(())
}
