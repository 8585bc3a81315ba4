//! Shared fixtures for MCP-layer tests

use crate::config::{parse_servers_config, ServersSnapshot};
use serde_json::{json, Value};

/// Minimal scripted MCP server over stdio: answers the initialize handshake,
/// `tools/list`, and `tools/call`, and echoes empty results for anything else
/// carrying an id. Parameterized through the environment.
pub const FAKE_SERVER_SCRIPT: &str = r#"
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":"\([^"]*\)".*/\1/p')
  case "$line" in
    *'"initialize"'*)
      printf '{"jsonrpc":"2.0","id":"%s","result":{"protocolVersion":"2025-06-18","capabilities":{"tools":{"listChanged":true}},"serverInfo":{"name":"%s","version":"1.0"},"instructions":"%s"}}\n' "$id" "$SERVER_NAME" "$SERVER_INSTRUCTIONS"
      ;;
    *'"tools/list"'*)
      printf '{"jsonrpc":"2.0","id":"%s","result":{"tools":[{"name":"%s","description":"a tool","inputSchema":{"type":"object"}}]}}\n' "$id" "$TOOL_NAME"
      ;;
    *'"tools/call"'*)
      printf '{"jsonrpc":"2.0","id":"%s","result":{"content":[{"type":"text","text":"pong from %s"}]}}\n' "$id" "$SERVER_NAME"
      ;;
    *'"id"'*)
      printf '{"jsonrpc":"2.0","id":"%s","result":{}}\n' "$id"
      ;;
  esac
done
"#;

/// One config entry running the fake server
pub fn fake_server_entry(name: &str, tool: &str, tags: &[&str]) -> Value {
    json!({
        "command": "sh",
        "args": ["-c", FAKE_SERVER_SCRIPT],
        "env": {
            "SERVER_NAME": name,
            "TOOL_NAME": tool,
            "SERVER_INSTRUCTIONS": format!("instructions from {}", name),
        },
        "tags": tags,
    })
}

/// Snapshot with a single fake server
pub fn fake_server_snapshot(server: &str, tool: &str) -> ServersSnapshot {
    snapshot_from(&[(server, fake_server_entry(server, tool, &["test"]))])
}

/// Snapshot built from (name, entry) pairs
pub fn snapshot_from(entries: &[(&str, Value)]) -> ServersSnapshot {
    let mut servers = serde_json::Map::new();
    for (name, entry) in entries {
        servers.insert(name.to_string(), entry.clone());
    }
    parse_servers_config(&json!({ "mcpServers": servers }).to_string()).unwrap()
}
