//! Configuration management for the MCP gateway
//!
//! Loads the `mcpServers` document, validates it into a spec snapshot, and
//! computes reload diffs. The document format mirrors the desktop-app config
//! convention: one JSON object keyed by server name.

use crate::error::{GatewayError, Result};
use crate::mcp::naming;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Environment variable overriding the config file path
pub const ENV_CONFIG: &str = "ONE_MCP_CONFIG";
/// Environment variable overriding the base directory for presets and sessions
pub const ENV_CONFIG_DIR: &str = "ONE_MCP_CONFIG_DIR";
/// Environment variable overriding the log level
pub const ENV_LOG_LEVEL: &str = "ONE_MCP_LOG_LEVEL";
/// Environment variable selecting an optional log file
pub const ENV_LOG_FILE: &str = "ONE_MCP_LOG_FILE";

/// Transport kind for an outbound server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Stdio,
    Http,
    Sse,
}

/// OAuth client settings for an HTTP/SSE outbound server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OAuthSpec {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub redirect_url: Option<String>,
}

/// Declarative configuration for one outbound MCP server
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundServerSpec {
    /// Unique identifier; matches `[A-Za-z0-9_-]+`
    pub name: String,
    pub kind: TransportKind,
    pub disabled: bool,
    /// Tag set used by inbound session filters
    pub tags: Vec<String>,
    /// Operation-level default timeout in milliseconds
    pub timeout_ms: u64,

    // stdio
    pub command: Option<String>,
    pub args: Vec<String>,
    pub cwd: Option<String>,
    /// Ordered env entries; `None` value means inherit-from-parent-if-present
    pub env: Vec<(String, Option<String>)>,
    pub inherit_parent_env: bool,
    /// Ordered keep/drop patterns (`PREFIX_*`, `NAME`, `!...` to drop)
    pub env_filter: Vec<String>,
    pub restart_on_exit: bool,
    /// Respawn cap; absent means unlimited
    pub max_restarts: Option<u32>,
    pub restart_delay_ms: u64,

    // http / sse
    pub url: Option<String>,
    pub headers: HashMap<String, String>,
    pub oauth: Option<OAuthSpec>,
}

impl OutboundServerSpec {
    /// Lower-cased tag set for filter evaluation
    pub fn tag_set(&self) -> std::collections::HashSet<String> {
        self.tags.iter().map(|t| t.to_lowercase()).collect()
    }
}

/// Raw serde shape of one server entry; unknown fields are collected so the
/// loader can warn about them instead of silently dropping
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawServerEntry {
    #[serde(rename = "type", default)]
    kind: Option<TransportKind>,
    #[serde(default)]
    disabled: bool,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default = "default_timeout_ms")]
    timeout: u64,

    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    cwd: Option<String>,
    #[serde(default)]
    env: Option<serde_json::Map<String, Value>>,
    #[serde(default)]
    inherit_parent_env: bool,
    #[serde(default)]
    env_filter: Vec<String>,
    #[serde(default)]
    restart_on_exit: bool,
    #[serde(default)]
    max_restarts: Option<u32>,
    #[serde(default = "default_restart_delay_ms")]
    restart_delay: u64,

    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    headers: HashMap<String, String>,
    #[serde(default)]
    oauth: Option<OAuthSpec>,

    #[serde(flatten)]
    unknown: HashMap<String, Value>,
}

/// Top-level config document
#[derive(Debug, Clone, Deserialize)]
struct ServersDocument {
    #[serde(rename = "mcpServers", default)]
    mcp_servers: serde_json::Map<String, Value>,
}

/// Immutable snapshot of the configured outbound server set
pub type ServersSnapshot = BTreeMap<String, Arc<OutboundServerSpec>>;

/// Diff between two snapshots, applied by the connection manager on reload
#[derive(Debug, Clone, Default)]
pub struct ConfigDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub changed: Vec<String>,
}

impl ConfigDiff {
    /// True when the reload requires no connection changes
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }

    /// Names whose connections must be (re)started or stopped
    pub fn affected(&self) -> impl Iterator<Item = &String> {
        self.removed.iter().chain(self.added.iter()).chain(self.changed.iter())
    }
}

/// Compute the `{removed, added, changed}` sets between two snapshots
pub fn diff_snapshots(old: &ServersSnapshot, new: &ServersSnapshot) -> ConfigDiff {
    let mut diff = ConfigDiff::default();
    for name in old.keys() {
        if !new.contains_key(name) {
            diff.removed.push(name.clone());
        }
    }
    for (name, spec) in new {
        match old.get(name) {
            None => diff.added.push(name.clone()),
            Some(previous) if previous.as_ref() != spec.as_ref() => diff.changed.push(name.clone()),
            Some(_) => {}
        }
    }
    diff
}

/// Load and validate the server config document at `path`
pub fn load_servers_config(path: &Path) -> Result<ServersSnapshot> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        GatewayError::config(format!("Failed to read config file '{}': {}", path.display(), e))
    })?;
    parse_servers_config(&raw)
}

/// Parse and validate a server config document
pub fn parse_servers_config(raw: &str) -> Result<ServersSnapshot> {
    let document: ServersDocument = serde_json::from_str(raw)
        .map_err(|e| GatewayError::config(format!("Invalid config document: {}", e)))?;

    let mut snapshot = ServersSnapshot::new();
    for (name, value) in document.mcp_servers {
        if !naming::is_valid_server_name(&name) {
            return Err(GatewayError::config(format!(
                "Invalid server name '{}': names must match [A-Za-z0-9_-]+",
                name
            )));
        }
        let entry: RawServerEntry = serde_json::from_value(value)
            .map_err(|e| GatewayError::config(format!("Invalid spec for server '{}': {}", name, e)))?;
        for field in entry.unknown.keys() {
            warn!("Ignoring unknown field '{}' on server '{}'", field, name);
        }
        let spec = validate_entry(&name, entry)?;
        snapshot.insert(name, Arc::new(spec));
    }
    Ok(snapshot)
}

fn validate_entry(name: &str, entry: RawServerEntry) -> Result<OutboundServerSpec> {
    let kind = match entry.kind {
        Some(kind) => kind,
        None if entry.command.is_some() => TransportKind::Stdio,
        None if entry.url.is_some() => TransportKind::Http,
        None => {
            return Err(GatewayError::config(format!(
                "Server '{}' declares neither 'command' nor 'url'",
                name
            )))
        }
    };

    match kind {
        TransportKind::Stdio => {
            if entry.command.as_deref().map_or(true, str::is_empty) {
                return Err(GatewayError::config(format!(
                    "Stdio server '{}' requires a non-empty 'command'",
                    name
                )));
            }
        }
        TransportKind::Http | TransportKind::Sse => {
            let url = entry.url.as_deref().unwrap_or_default();
            if url.is_empty() {
                return Err(GatewayError::config(format!(
                    "{:?} server '{}' requires a 'url'",
                    kind, name
                )));
            }
            url::Url::parse(url).map_err(|e| {
                GatewayError::config(format!("Server '{}' has invalid url '{}': {}", name, url, e))
            })?;
        }
    }

    let env = entry
        .env
        .unwrap_or_default()
        .into_iter()
        .map(|(key, value)| match value {
            Value::Null => Ok((key, None)),
            Value::String(s) => Ok((key, Some(s))),
            Value::Number(n) => Ok((key, Some(n.to_string()))),
            Value::Bool(b) => Ok((key, Some(b.to_string()))),
            other => Err(GatewayError::config(format!(
                "Server '{}' env entry '{}' has unsupported value {}",
                name, key, other
            ))),
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(OutboundServerSpec {
        name: name.to_string(),
        kind,
        disabled: entry.disabled,
        tags: entry.tags,
        timeout_ms: entry.timeout,
        command: entry.command,
        args: entry.args,
        cwd: entry.cwd,
        env,
        inherit_parent_env: entry.inherit_parent_env,
        env_filter: entry.env_filter,
        restart_on_exit: entry.restart_on_exit,
        max_restarts: entry.max_restarts,
        restart_delay_ms: entry.restart_delay,
        url: entry.url,
        headers: entry.headers,
        oauth: entry.oauth,
    })
}

/// Inbound transport selection for the gateway itself
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InboundTransport {
    Stdio,
    Http,
}

/// Startup record handed to the gateway core by the CLI
#[derive(Debug, Clone)]
pub struct GatewayOptions {
    pub transport: InboundTransport,
    pub host: String,
    pub port: u16,
    pub config_path: PathBuf,
    pub session_storage_path: Option<PathBuf>,
    pub auth_enabled: bool,
    pub log_level: String,
    pub log_file: Option<PathBuf>,
}

impl GatewayOptions {
    /// Base directory for presets and session storage
    pub fn config_dir(&self) -> PathBuf {
        if let Ok(dir) = std::env::var(ENV_CONFIG_DIR) {
            return PathBuf::from(dir);
        }
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("1mcp")
    }

    /// Directory holding the flat session-store JSON files
    pub fn session_storage_dir(&self) -> PathBuf {
        self.session_storage_path
            .clone()
            .unwrap_or_else(|| self.config_dir().join("sessions"))
    }
}

/// Resolve the config file path: CLI flag, then `ONE_MCP_CONFIG`, then the
/// default location under the config dir
pub fn resolve_config_path(cli_path: Option<PathBuf>) -> PathBuf {
    if let Some(path) = cli_path {
        return path;
    }
    if let Ok(path) = std::env::var(ENV_CONFIG) {
        return PathBuf::from(path);
    }
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("1mcp")
        .join("mcp.json")
}

/// Log a startup summary of the loaded snapshot
pub fn log_snapshot_summary(snapshot: &ServersSnapshot) {
    let disabled = snapshot.values().filter(|s| s.disabled).count();
    let stdio = snapshot.values().filter(|s| s.kind == TransportKind::Stdio).count();
    let http = snapshot.values().filter(|s| s.kind == TransportKind::Http).count();
    let sse = snapshot.values().filter(|s| s.kind == TransportKind::Sse).count();
    info!(
        "Loaded {} outbound server spec(s): {} stdio, {} http, {} sse ({} disabled)",
        snapshot.len(),
        stdio,
        http,
        sse,
        disabled
    );
}

// Default value functions
fn default_timeout_ms() -> u64 {
    30_000
}
fn default_restart_delay_ms() -> u64 {
    1_000
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_document() -> &'static str {
        r#"{
            "mcpServers": {
                "files": {
                    "command": "mcp-files",
                    "args": ["--root", "/tmp"],
                    "tags": ["fs", "local"],
                    "restartOnExit": true,
                    "maxRestarts": 2
                },
                "cloud": {
                    "type": "sse",
                    "url": "https://mcp.example.com/sse",
                    "headers": {"X-Team": "infra"},
                    "oauth": {"scopes": ["mcp.read"]}
                }
            }
        }"#
    }

    #[test]
    fn test_parse_document() {
        let snapshot = parse_servers_config(sample_document()).unwrap();
        assert_eq!(snapshot.len(), 2);

        let files = snapshot.get("files").unwrap();
        assert_eq!(files.kind, TransportKind::Stdio);
        assert_eq!(files.command.as_deref(), Some("mcp-files"));
        assert!(files.restart_on_exit);
        assert_eq!(files.max_restarts, Some(2));
        assert_eq!(files.restart_delay_ms, 1_000);

        let cloud = snapshot.get("cloud").unwrap();
        assert_eq!(cloud.kind, TransportKind::Sse);
        assert!(cloud.oauth.is_some());
    }

    #[test]
    fn test_kind_inferred_from_fields() {
        let snapshot = parse_servers_config(
            r#"{"mcpServers": {"web": {"url": "http://localhost:9000/mcp"}}}"#,
        )
        .unwrap();
        assert_eq!(snapshot.get("web").unwrap().kind, TransportKind::Http);
    }

    #[test]
    fn test_invalid_name_rejected() {
        let result = parse_servers_config(r#"{"mcpServers": {"bad name": {"command": "x"}}}"#);
        assert!(result.is_err());
        let result = parse_servers_config(r#"{"mcpServers": {"a_1mcp_b": {"command": "x"}}}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_missing_command_and_url_rejected() {
        let result = parse_servers_config(r#"{"mcpServers": {"empty": {}}}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_env_entry_order_preserved() {
        let snapshot = parse_servers_config(
            r#"{"mcpServers": {"s": {
                "command": "x",
                "env": {"B": "2", "A": "${B}", "C": null}
            }}}"#,
        )
        .unwrap();
        let env = &snapshot.get("s").unwrap().env;
        assert_eq!(env[0], ("B".to_string(), Some("2".to_string())));
        assert_eq!(env[1], ("A".to_string(), Some("${B}".to_string())));
        assert_eq!(env[2], ("C".to_string(), None));
    }

    #[test]
    fn test_diff_snapshots() {
        let old = parse_servers_config(
            r#"{"mcpServers": {
                "a": {"command": "a"},
                "b": {"command": "b"}
            }}"#,
        )
        .unwrap();
        let new = parse_servers_config(
            r#"{"mcpServers": {
                "a": {"command": "a"},
                "c": {"command": "c"}
            }}"#,
        )
        .unwrap();
        let diff = diff_snapshots(&old, &new);
        assert_eq!(diff.added, vec!["c"]);
        assert_eq!(diff.removed, vec!["b"]);
        assert!(diff.changed.is_empty());
    }

    #[test]
    fn test_diff_detects_changed_spec() {
        let old = parse_servers_config(r#"{"mcpServers": {"a": {"command": "a"}}}"#).unwrap();
        let new =
            parse_servers_config(r#"{"mcpServers": {"a": {"command": "a", "args": ["-v"]}}}"#)
                .unwrap();
        let diff = diff_snapshots(&old, &new);
        assert_eq!(diff.changed, vec!["a"]);
        assert!(diff.is_empty() == false);
    }

    #[test]
    fn test_identical_snapshots_diff_empty() {
        let old = parse_servers_config(sample_document()).unwrap();
        let new = parse_servers_config(sample_document()).unwrap();
        assert!(diff_snapshots(&old, &new).is_empty());
    }
}
