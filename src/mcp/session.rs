//! Inbound session management
//!
//! One virtual MCP server per inbound transport. The session manager mints
//! ids, resolves the tag filter (preset over tag-filter over legacy tags),
//! dispatches every inbound request against the aggregated view, bridges
//! notifications in both directions, and nudges live sessions with
//! `list_changed` notifications when the outbound set shifts under them.

use crate::config::{FilterExpression, PresetStore};
use crate::error::{GatewayError, Result};
use crate::mcp::aggregator::CapabilityAggregator;
use crate::mcp::errors::McpError;
use crate::mcp::manager::{ConnectionEvent, ExecuteOptions, OutboundManager};
use crate::mcp::notifications;
use crate::mcp::types::{McpNotification, McpRequest, McpResponse};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};

/// Session id used by the single stdio inbound transport
pub const STDIO_SESSION_ID: &str = "stdio";

/// Bound on concurrent connects for one session id
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Filter-selection query parameters, priority order: preset, tag-filter,
/// legacy tags
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionQuery {
    #[serde(default)]
    pub preset: Option<String>,
    #[serde(rename = "tag-filter", default)]
    pub tag_filter: Option<String>,
    #[serde(default)]
    pub tags: Option<String>,
    #[serde(rename = "template-config", default)]
    pub template_config: Option<String>,
}

struct SessionEntry {
    filter: FilterExpression,
    template_config: Option<Value>,
    created_at: DateTime<Utc>,
    /// Envelopes to deliver to the inbound agent (notifications, and
    /// responses on split transports)
    outbox_tx: mpsc::UnboundedSender<Value>,
    /// Receiver half, parked until the transport claims it
    outbox_rx: Option<mpsc::UnboundedReceiver<Value>>,
    /// Adapter feeding bridged notifications into the outbox
    notification_tx: mpsc::UnboundedSender<McpNotification>,
    /// Servers the session currently sees, provenance order
    servers: Vec<String>,
    forwarders: Vec<tokio::task::JoinHandle<()>>,
}

impl SessionEntry {
    fn stop_forwarders(&mut self) {
        for forwarder in self.forwarders.drain(..) {
            forwarder.abort();
        }
    }
}

/// Inbound session registry and request dispatcher
pub struct SessionManager {
    sessions: RwLock<HashMap<String, SessionEntry>>,
    manager: Arc<OutboundManager>,
    aggregator: Arc<CapabilityAggregator>,
    presets: Arc<PresetStore>,
    /// Per-session-id connect serialization
    connect_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SessionManager {
    pub fn new(
        manager: Arc<OutboundManager>,
        aggregator: Arc<CapabilityAggregator>,
        presets: Arc<PresetStore>,
    ) -> Arc<Self> {
        let session_manager = Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
            manager: Arc::clone(&manager),
            aggregator,
            presets,
            connect_locks: Mutex::new(HashMap::new()),
        });

        // React to outbound connection changes: refresh affected sessions
        let listener = Arc::clone(&session_manager);
        let mut events = manager.subscribe_events();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ConnectionEvent::Connected { .. })
                    | Ok(ConnectionEvent::Disconnected { .. }) => {
                        listener.refresh_sessions().await;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                        listener.refresh_sessions().await;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                }
            }
        });

        session_manager
    }

    /// Create a session. `session_id` is `None` for server-minted HTTP ids,
    /// `Some(STDIO_SESSION_ID)` for the stdio inbound. The transport claims
    /// the outbox with [`SessionManager::take_outbox`].
    pub async fn create_session(
        &self,
        session_id: Option<String>,
        query: &SessionQuery,
    ) -> Result<String> {
        let session_id = session_id.unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());

        // Only one connect sequence in flight per session id
        let lock = {
            let mut locks = self.connect_locks.lock().await;
            Arc::clone(
                locks
                    .entry(session_id.clone())
                    .or_insert_with(|| Arc::new(Mutex::new(()))),
            )
        };
        let _guard = tokio::time::timeout(CONNECT_TIMEOUT, lock.lock())
            .await
            .map_err(|_| {
                GatewayError::timeout(format!(
                    "connect for session '{}' waited too long on a concurrent connect",
                    session_id
                ))
            })?;

        if self.sessions.read().await.contains_key(&session_id) {
            return Err(GatewayError::validation(format!(
                "session '{}' already exists",
                session_id
            )));
        }

        let filter = self.resolve_filter(query)?;
        let template_config = query
            .template_config
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok());

        let (outbox_tx, outbox_rx) = mpsc::unbounded_channel::<Value>();
        let (notification_tx, mut notification_rx) = mpsc::unbounded_channel::<McpNotification>();

        // Adapter: bridged notifications become outbox envelopes
        {
            let outbox_tx = outbox_tx.clone();
            tokio::spawn(async move {
                while let Some(notification) = notification_rx.recv().await {
                    match serde_json::to_value(&notification) {
                        Ok(envelope) => {
                            if outbox_tx.send(envelope).is_err() {
                                return;
                            }
                        }
                        Err(e) => warn!("Failed to serialize bridged notification: {}", e),
                    }
                }
            });
        }

        let servers = self.aggregator.selected_servers(&filter).await;
        let forwarders = self
            .install_forwarders(&session_id, &servers, &notification_tx)
            .await;

        let entry = SessionEntry {
            filter,
            template_config,
            created_at: Utc::now(),
            outbox_tx,
            outbox_rx: Some(outbox_rx),
            notification_tx,
            servers,
            forwarders,
        };
        self.sessions.write().await.insert(session_id.clone(), entry);
        info!("Inbound session '{}' created", session_id);
        Ok(session_id)
    }

    /// Claim the session's outbox; each session yields it exactly once
    pub async fn take_outbox(&self, session_id: &str) -> Option<mpsc::UnboundedReceiver<Value>> {
        self.sessions
            .write()
            .await
            .get_mut(session_id)
            .and_then(|entry| entry.outbox_rx.take())
    }

    /// Queue an envelope for delivery on the session's streaming transport
    pub async fn push_to_outbox(&self, session_id: &str, envelope: Value) -> Result<()> {
        let sessions = self.sessions.read().await;
        let entry = sessions.get(session_id).ok_or_else(|| {
            GatewayError::not_found(format!("unknown session '{}'", session_id))
        })?;
        entry
            .outbox_tx
            .send(envelope)
            .map_err(|_| GatewayError::connection("session outbox closed"))
    }

    /// Destroy a session and its forwarders
    pub async fn remove_session(&self, session_id: &str) {
        if let Some(mut entry) = self.sessions.write().await.remove(session_id) {
            entry.stop_forwarders();
            info!("Inbound session '{}' removed", session_id);
        }
        self.connect_locks.lock().await.remove(session_id);
    }

    /// Number of live sessions
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// True when the session exists
    pub async fn has_session(&self, session_id: &str) -> bool {
        self.sessions.read().await.contains_key(session_id)
    }

    /// Session age, for the health surface
    pub async fn session_created_at(&self, session_id: &str) -> Option<DateTime<Utc>> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .map(|entry| entry.created_at)
    }

    /// Dispatch one inbound envelope. Requests produce a response;
    /// notifications produce `None` after being bridged outbound.
    pub async fn handle_envelope(&self, session_id: &str, envelope: Value) -> Option<McpResponse> {
        let request: McpRequest = match serde_json::from_value(envelope) {
            Ok(request) => request,
            Err(e) => {
                return Some(McpResponse::error(
                    Value::Null,
                    McpError::new(
                        crate::mcp::errors::McpErrorCode::ParseError,
                        format!("unparseable JSON-RPC envelope: {}", e),
                    ),
                ))
            }
        };

        if request.is_notification() {
            let notification = McpNotification {
                jsonrpc: request.jsonrpc,
                method: request.method,
                params: request.params,
            };
            self.handle_notification(session_id, &notification).await;
            return None;
        }

        let id = request.id.clone().unwrap_or(Value::Null);
        match self.dispatch(session_id, &request).await {
            Ok(result) => Some(McpResponse::success(id, result)),
            Err(DispatchError::Gateway(e)) => {
                debug!(
                    "Request '{}' on session '{}' failed: {}",
                    request.method, session_id, e
                );
                Some(McpResponse::error(id, e.into()))
            }
            Err(DispatchError::Downstream(error)) => Some(McpResponse::error(id, error)),
        }
    }

    /// Bridge an inbound notification to the session's outbound servers
    pub async fn handle_notification(&self, session_id: &str, notification: &McpNotification) {
        let servers = match self.sessions.read().await.get(session_id) {
            Some(entry) => entry.servers.clone(),
            None => {
                warn!("Notification for unknown session '{}'", session_id);
                return;
            }
        };
        notifications::forward_inbound(&self.manager, &servers, session_id, notification).await;
    }

    async fn dispatch(
        &self,
        session_id: &str,
        request: &McpRequest,
    ) -> std::result::Result<Value, DispatchError> {
        let (filter, template_config) = {
            let sessions = self.sessions.read().await;
            let entry = sessions.get(session_id).ok_or_else(|| {
                DispatchError::Gateway(GatewayError::not_found(format!(
                    "unknown session '{}'",
                    session_id
                )))
            })?;
            (entry.filter.clone(), entry.template_config.clone())
        };

        match request.method.as_str() {
            "initialize" => {
                let view = self
                    .aggregator
                    .view_with_config(&filter, template_config)
                    .await;
                Ok(json!({
                    "protocolVersion": crate::mcp::client::PROTOCOL_VERSION,
                    "capabilities": view.capabilities,
                    "serverInfo": {
                        "name": "1mcp",
                        "version": env!("CARGO_PKG_VERSION"),
                    },
                    "instructions": view.instructions,
                }))
            }
            "ping" => Ok(json!({})),
            "tools/list" => {
                let view = self.aggregator.view(&filter).await;
                Ok(json!({ "tools": view.tools }))
            }
            "resources/list" => {
                let view = self.aggregator.view(&filter).await;
                Ok(json!({ "resources": view.resources }))
            }
            "resources/templates/list" => {
                let view = self.aggregator.view(&filter).await;
                Ok(json!({ "resourceTemplates": view.resource_templates }))
            }
            "prompts/list" => {
                let view = self.aggregator.view(&filter).await;
                Ok(json!({ "prompts": view.prompts }))
            }
            "tools/call" => {
                let params = request.params.clone().unwrap_or(json!({}));
                let name = params
                    .get("name")
                    .and_then(Value::as_str)
                    .ok_or_else(|| invalid_params("tools/call requires a 'name'"))?;
                let (server, local) = self
                    .aggregator
                    .resolve(name)
                    .map_err(DispatchError::Gateway)?;
                let mut forwarded = params.clone();
                forwarded["name"] = json!(local);
                self.proxy_request(&server, "tools/call", forwarded, Some("tools"))
                    .await
            }
            "resources/read" => {
                let params = request.params.clone().unwrap_or(json!({}));
                let uri = params
                    .get("uri")
                    .and_then(Value::as_str)
                    .ok_or_else(|| invalid_params("resources/read requires a 'uri'"))?;
                let (server, local) = self
                    .aggregator
                    .resolve_uri(uri)
                    .map_err(DispatchError::Gateway)?;
                let mut forwarded = params.clone();
                forwarded["uri"] = json!(local);
                self.proxy_request(&server, "resources/read", forwarded, Some("resources"))
                    .await
            }
            "prompts/get" => {
                let params = request.params.clone().unwrap_or(json!({}));
                let name = params
                    .get("name")
                    .and_then(Value::as_str)
                    .ok_or_else(|| invalid_params("prompts/get requires a 'name'"))?;
                let (server, local) = self
                    .aggregator
                    .resolve(name)
                    .map_err(DispatchError::Gateway)?;
                let mut forwarded = params.clone();
                forwarded["name"] = json!(local);
                self.proxy_request(&server, "prompts/get", forwarded, Some("prompts"))
                    .await
            }
            "completion/complete" => {
                let params = request.params.clone().unwrap_or(json!({}));
                let reference = params
                    .get("ref")
                    .cloned()
                    .ok_or_else(|| invalid_params("completion/complete requires a 'ref'"))?;
                let (server, rewritten) = self.rewrite_completion_ref(&reference)?;
                let mut forwarded = params.clone();
                forwarded["ref"] = rewritten;
                self.proxy_request(&server, "completion/complete", forwarded, None)
                    .await
            }
            "logging/setLevel" => {
                let params = request.params.clone().unwrap_or(json!({}));
                let level = params
                    .get("level")
                    .and_then(Value::as_str)
                    .ok_or_else(|| invalid_params("logging/setLevel requires a 'level'"))?
                    .to_string();
                let servers = self.aggregator.selected_servers(&filter).await;
                for server in &servers {
                    let level = level.clone();
                    let result = self
                        .manager
                        .execute(server, ExecuteOptions::default(), move |client| {
                            let level = level.clone();
                            Box::pin(async move { client.set_log_level(&level).await })
                        })
                        .await;
                    if let Err(e) = result {
                        warn!("logging/setLevel failed for server '{}': {}", server, e);
                    }
                }
                Ok(json!({}))
            }
            other => Err(DispatchError::Downstream(McpError::method_not_found(other))),
        }
    }

    /// Forward a request to one outbound server, passing the downstream
    /// result or error through unchanged
    async fn proxy_request(
        &self,
        server: &str,
        method: &'static str,
        params: Value,
        required_capability: Option<&'static str>,
    ) -> std::result::Result<Value, DispatchError> {
        let options = ExecuteOptions {
            required_capability,
            ..Default::default()
        };
        let response = self
            .manager
            .execute(server, options, move |client| {
                let params = params.clone();
                Box::pin(async move { client.request(method, Some(params)).await })
            })
            .await
            .map_err(DispatchError::Gateway)?;

        if let Some(error) = response.error {
            // Downstream JSON-RPC errors surface with their original codes
            return Err(DispatchError::Downstream(error));
        }
        response
            .result
            .ok_or_else(|| DispatchError::Gateway(GatewayError::mcp("empty downstream response")))
    }

    /// Rewrite a completion reference to its origin server's namespace
    fn rewrite_completion_ref(
        &self,
        reference: &Value,
    ) -> std::result::Result<(String, Value), DispatchError> {
        let ref_type = reference.get("type").and_then(Value::as_str).unwrap_or("");
        match ref_type {
            "ref/prompt" => {
                let name = reference
                    .get("name")
                    .and_then(Value::as_str)
                    .ok_or_else(|| invalid_params("ref/prompt requires a 'name'"))?;
                let (server, local) = self
                    .aggregator
                    .resolve(name)
                    .map_err(DispatchError::Gateway)?;
                let mut rewritten = reference.clone();
                rewritten["name"] = json!(local);
                Ok((server, rewritten))
            }
            "ref/resource" => {
                let uri = reference
                    .get("uri")
                    .and_then(Value::as_str)
                    .ok_or_else(|| invalid_params("ref/resource requires a 'uri'"))?;
                let (server, local) = self
                    .aggregator
                    .resolve_uri(uri)
                    .map_err(DispatchError::Gateway)?;
                let mut rewritten = reference.clone();
                rewritten["uri"] = json!(local);
                Ok((server, rewritten))
            }
            other => Err(invalid_params(&format!(
                "unsupported completion ref type '{}'",
                other
            ))),
        }
    }

    fn resolve_filter(&self, query: &SessionQuery) -> Result<FilterExpression> {
        if let Some(preset) = &query.preset {
            return Ok(match self.presets.resolve(preset) {
                Some(filter) => filter,
                None => {
                    warn!("Preset '{}' unavailable; session sees all servers", preset);
                    FilterExpression::All
                }
            });
        }
        if let Some(expression) = &query.tag_filter {
            return FilterExpression::parse(expression);
        }
        if let Some(tags) = &query.tags {
            return Ok(FilterExpression::any_of(tags.split(',')));
        }
        Ok(FilterExpression::All)
    }

    /// Recompute every session's server set after a connection event; emit
    /// `list_changed` notifications and reinstall forwarders where it moved
    async fn refresh_sessions(&self) {
        let session_ids: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        for session_id in session_ids {
            let (filter, previous) = {
                let sessions = self.sessions.read().await;
                match sessions.get(&session_id) {
                    Some(entry) => (entry.filter.clone(), entry.servers.clone()),
                    None => continue,
                }
            };
            let current = self.aggregator.selected_servers(&filter).await;
            if current == previous {
                continue;
            }

            debug!(
                "Session '{}' outbound set changed: {:?} -> {:?}",
                session_id, previous, current
            );
            let notification_tx = {
                let sessions = self.sessions.read().await;
                match sessions.get(&session_id) {
                    Some(entry) => entry.notification_tx.clone(),
                    None => continue,
                }
            };
            let forwarders = self
                .install_forwarders(&session_id, &current, &notification_tx)
                .await;

            let mut sessions = self.sessions.write().await;
            if let Some(entry) = sessions.get_mut(&session_id) {
                entry.stop_forwarders();
                entry.servers = current;
                entry.forwarders = forwarders;
                for method in [
                    "notifications/tools/list_changed",
                    "notifications/resources/list_changed",
                    "notifications/prompts/list_changed",
                ] {
                    let envelope = serde_json::to_value(McpNotification::new(method.to_string()))
                        .expect("notification serializes");
                    let _ = entry.outbox_tx.send(envelope);
                }
            }
        }
    }

    async fn install_forwarders(
        &self,
        session_id: &str,
        servers: &[String],
        notification_tx: &mpsc::UnboundedSender<McpNotification>,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        let mut forwarders = Vec::new();
        for server in servers {
            match self.manager.client(server).await {
                Ok(client) => {
                    forwarders.push(notifications::spawn_outbound_forwarder(
                        server.clone(),
                        &client,
                        session_id.to_string(),
                        notification_tx.clone(),
                    ));
                }
                Err(e) => debug!(
                    "No forwarder for (session '{}', server '{}'): {}",
                    session_id, server, e
                ),
            }
        }
        forwarders
    }
}

enum DispatchError {
    /// Failure inside the gateway; translated via `From<GatewayError>`
    Gateway(GatewayError),
    /// JSON-RPC error from the origin server, passed through untouched
    Downstream(McpError),
}

fn invalid_params(message: &str) -> DispatchError {
    DispatchError::Downstream(McpError::invalid_params(message.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{OAuthRendezvous, SessionStore};
    use crate::mcp::manager::{ConnectionStatus, RetryPolicy};
    use crate::mcp::test_support::{fake_server_entry, snapshot_from};

    async fn harness() -> (Arc<OutboundManager>, Arc<SessionManager>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SessionStore::new(dir.path().to_path_buf()).unwrap());
        let presets = Arc::new(PresetStore::new(dir.path()));
        std::mem::forget(dir);
        let manager = OutboundManager::new(
            store,
            Arc::new(OAuthRendezvous::new()),
            "http://127.0.0.1:3050".to_string(),
            RetryPolicy {
                initial_delay: Duration::from_millis(50),
                max_attempts: 2,
            },
        );
        let snapshot = snapshot_from(&[
            ("echo", fake_server_entry("echo", "ping", &["web"])),
            ("capability", fake_server_entry("capability", "reflect", &["backend"])),
        ]);
        manager.start(&snapshot).await;
        for server in ["echo", "capability"] {
            for _ in 0..200 {
                if let Some(connection) = manager.get(server).await {
                    if connection.status == ConnectionStatus::Connected {
                        break;
                    }
                }
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
        }
        let aggregator = Arc::new(CapabilityAggregator::new(Arc::clone(&manager), None));
        let sessions = SessionManager::new(Arc::clone(&manager), aggregator, presets);
        (manager, sessions)
    }

    #[tokio::test]
    async fn test_stdio_aggregation_scenario() {
        let (manager, sessions) = harness().await;
        let session_id = sessions
            .create_session(Some(STDIO_SESSION_ID.to_string()), &SessionQuery::default())
            .await
            .unwrap();
        assert_eq!(session_id, "stdio");

        let response = sessions
            .handle_envelope(
                &session_id,
                json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"}),
            )
            .await
            .unwrap();
        let tools = response.result.unwrap()["tools"].clone();
        let mut names: Vec<String> = tools
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["name"].as_str().unwrap().to_string())
            .collect();
        names.sort();
        assert_eq!(names, vec!["capability_1mcp_reflect", "echo_1mcp_ping"]);

        let response = sessions
            .handle_envelope(
                &session_id,
                json!({
                    "jsonrpc": "2.0", "id": 2, "method": "tools/call",
                    "params": {"name": "echo_1mcp_ping", "arguments": {}}
                }),
            )
            .await
            .unwrap();
        let result = response.result.unwrap();
        assert_eq!(result["content"][0]["text"], "pong from echo");
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_initialize_and_ping_are_local() {
        let (manager, sessions) = harness().await;
        let session_id = sessions
            .create_session(None, &SessionQuery::default())
            .await
            .unwrap();

        let response = sessions
            .handle_envelope(
                &session_id,
                json!({"jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {}}),
            )
            .await
            .unwrap();
        let result = response.result.unwrap();
        assert_eq!(result["serverInfo"]["name"], "1mcp");
        assert!(result["capabilities"]["tools"].is_object());

        let response = sessions
            .handle_envelope(&session_id, json!({"jsonrpc": "2.0", "id": 2, "method": "ping"}))
            .await
            .unwrap();
        assert!(response.error.is_none());
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_tag_filter_limits_view() {
        let (manager, sessions) = harness().await;
        let query = SessionQuery {
            tag_filter: Some("backend".to_string()),
            ..Default::default()
        };
        let session_id = sessions.create_session(None, &query).await.unwrap();

        let response = sessions
            .handle_envelope(
                &session_id,
                json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"}),
            )
            .await
            .unwrap();
        let tools = response.result.unwrap()["tools"].clone();
        assert_eq!(tools.as_array().unwrap().len(), 1);
        assert_eq!(tools[0]["name"], "capability_1mcp_reflect");

        // Calling a tool outside the filter's view still resolves by name,
        // but an unknown mangled name is NotFound
        let response = sessions
            .handle_envelope(
                &session_id,
                json!({
                    "jsonrpc": "2.0", "id": 2, "method": "tools/call",
                    "params": {"name": "nosuch_1mcp_tool"}
                }),
            )
            .await
            .unwrap();
        assert!(response.error.is_some());
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_method_is_method_not_found() {
        let (manager, sessions) = harness().await;
        let session_id = sessions
            .create_session(None, &SessionQuery::default())
            .await
            .unwrap();
        let response = sessions
            .handle_envelope(
                &session_id,
                json!({"jsonrpc": "2.0", "id": 5, "method": "sampling/createMessage"}),
            )
            .await
            .unwrap();
        assert_eq!(response.error.unwrap().code, -32601);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_duplicate_session_id_rejected() {
        let (manager, sessions) = harness().await;
        let session_id = sessions
            .create_session(Some("fixed".to_string()), &SessionQuery::default())
            .await
            .unwrap();
        assert!(sessions
            .create_session(Some(session_id.clone()), &SessionQuery::default())
            .await
            .is_err());
        sessions.remove_session(&session_id).await;
        assert!(!sessions.has_session(&session_id).await);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_reload_emits_list_changed_to_sessions() {
        let (manager, sessions) = harness().await;
        let session_id = sessions
            .create_session(None, &SessionQuery::default())
            .await
            .unwrap();
        let mut outbox = sessions.take_outbox(&session_id).await.unwrap();

        // Remove 'echo' via a reload diff
        let old = snapshot_from(&[
            ("echo", fake_server_entry("echo", "ping", &["web"])),
            ("capability", fake_server_entry("capability", "reflect", &["backend"])),
        ]);
        let new = snapshot_from(&[(
            "capability",
            fake_server_entry("capability", "reflect", &["backend"]),
        )]);
        let diff = crate::config::diff_snapshots(&old, &new);
        manager.apply_reload(&diff, &new).await;

        // The session eventually hears a tools/list_changed
        let mut saw_list_changed = false;
        for _ in 0..100 {
            match tokio::time::timeout(Duration::from_millis(100), outbox.recv()).await {
                Ok(Some(envelope)) => {
                    if envelope["method"] == "notifications/tools/list_changed" {
                        saw_list_changed = true;
                        break;
                    }
                }
                Ok(None) => break,
                Err(_) => continue,
            }
        }
        assert!(saw_list_changed, "session '{}' never heard list_changed", session_id);
        manager.shutdown().await;
    }
}
