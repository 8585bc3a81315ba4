//! Configuration module for the MCP gateway
//!
//! Server config document, tag filters, presets, child environments, and the
//! hot-reload watcher.

pub mod config;
pub mod environment;
pub mod filter;
pub mod presets;
pub mod watcher;

// Re-export the main configuration types
pub use config::{
    diff_snapshots, load_servers_config, log_snapshot_summary, parse_servers_config,
    resolve_config_path, ConfigDiff, GatewayOptions, InboundTransport, OAuthSpec,
    OutboundServerSpec, ServersSnapshot, TransportKind, ENV_CONFIG, ENV_CONFIG_DIR, ENV_LOG_FILE,
    ENV_LOG_LEVEL,
};
pub use environment::compute_environment;
pub use filter::FilterExpression;
pub use presets::{PresetDefinition, PresetStore, PresetStrategy};
pub use watcher::{ConfigChange, ConfigWatcher};
