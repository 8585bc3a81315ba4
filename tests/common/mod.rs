//! Shared harness for gateway integration tests

#![allow(dead_code)]

use onemcp::config::{GatewayOptions, InboundTransport};
use onemcp::gateway::Gateway;
use onemcp::mcp::manager::ConnectionStatus;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use wiremock::{Request, ResponseTemplate};

/// Scripted stdio MCP server used by end-to-end tests; answers the
/// handshake, tools/list, and tools/call
pub const FAKE_SERVER_SCRIPT: &str = r#"
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":"\([^"]*\)".*/\1/p')
  case "$line" in
    *'"initialize"'*)
      printf '{"jsonrpc":"2.0","id":"%s","result":{"protocolVersion":"2025-06-18","capabilities":{"tools":{"listChanged":true}},"serverInfo":{"name":"%s","version":"1.0"}}}\n' "$id" "$SERVER_NAME"
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

/// Config entry for one scripted stdio server
pub fn fake_server_entry(name: &str, tool: &str, tags: &[&str]) -> Value {
    json!({
        "command": "sh",
        "args": ["-c", FAKE_SERVER_SCRIPT],
        "env": {"SERVER_NAME": name, "TOOL_NAME": tool},
        "tags": tags,
    })
}

/// A started gateway with its backing temp directories kept alive
pub struct TestGateway {
    pub gateway: Arc<Gateway>,
    pub config_path: PathBuf,
    _dir: tempfile::TempDir,
}

/// Write the config document and boot a gateway around it
pub async fn start_gateway(servers: Value, auth_enabled: bool) -> TestGateway {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("mcp.json");
    std::fs::write(
        &config_path,
        serde_json::to_string_pretty(&json!({ "mcpServers": servers })).unwrap(),
    )
    .unwrap();

    let options = GatewayOptions {
        transport: InboundTransport::Http,
        host: "127.0.0.1".to_string(),
        port: 0,
        config_path: config_path.clone(),
        session_storage_path: Some(dir.path().join("sessions")),
        auth_enabled,
        log_level: "warn".to_string(),
        log_file: None,
    };
    let gateway = Gateway::new(options, None).unwrap();
    gateway.start().await.unwrap();

    TestGateway {
        gateway,
        config_path,
        _dir: dir,
    }
}

/// Block until a server reaches the wanted status (or panic)
pub async fn wait_for_status(gateway: &Gateway, server: &str, status: ConnectionStatus) {
    for _ in 0..200 {
        if let Some(connection) = gateway.manager.get(server).await {
            if connection.status == status {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("server '{}' never reached {:?}", server, status);
}

/// wiremock responder that behaves like an MCP server over HTTP: echoes the
/// request id and scripts results by method
pub struct McpResponder {
    pub server_name: String,
    pub tool_name: String,
}

impl wiremock::Respond for McpResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let envelope: Value = match serde_json::from_slice(&request.body) {
            Ok(envelope) => envelope,
            Err(_) => return ResponseTemplate::new(400),
        };
        let id = envelope.get("id").cloned().unwrap_or(Value::Null);
        if id.is_null() {
            // Notification
            return ResponseTemplate::new(202);
        }
        let method = envelope.get("method").and_then(Value::as_str).unwrap_or("");
        let result = match method {
            "initialize" => json!({
                "protocolVersion": "2025-06-18",
                "capabilities": {"tools": {"listChanged": true}},
                "serverInfo": {"name": self.server_name, "version": "1.0"},
            }),
            "tools/list" => json!({
                "tools": [{
                    "name": self.tool_name,
                    "description": "a remote tool",
                    "inputSchema": {"type": "object"},
                }]
            }),
            "tools/call" => json!({
                "content": [{"type": "text", "text": format!("pong from {}", self.server_name)}]
            }),
            _ => json!({}),
        };
        ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": result,
        }))
    }
}
