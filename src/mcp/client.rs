//! MCP client for connecting to outbound MCP servers
//!
//! Runs over any [`Transport`], correlating responses to requests by id,
//! fanning incoming notifications out on a broadcast channel, and surfacing
//! transport loss to the connection manager.

use crate::error::{GatewayError, Result};
use crate::mcp::clients::{Transport, TransportEvent};
use crate::mcp::errors::McpError;
use crate::mcp::types::{
    InitializeResult, McpNotification, McpRequest, McpResponse, Prompt, PromptsListResult,
    ResourceDef, ResourceTemplate, ResourceTemplatesListResult, ResourcesListResult, Tool,
    ToolsListResult,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

/// MCP protocol version offered during the handshake
pub const PROTOCOL_VERSION: &str = "2025-06-18";

/// Transport loss, forwarded to the connection manager
#[derive(Debug, Clone)]
pub struct TransportClosed {
    pub reason: String,
    pub abnormal: bool,
}

/// Outbound MCP client bound to one transport
pub struct McpClient {
    name: String,
    transport: Arc<dyn Transport>,
    pending: Arc<Mutex<HashMap<String, oneshot::Sender<McpResponse>>>>,
    notifications_tx: broadcast::Sender<McpNotification>,
    request_timeout: Duration,
    demux: Mutex<Option<tokio::task::JoinHandle<()>>>,
    /// Set once the transport reports a close; new requests fail fast
    closed: Arc<AtomicBool>,
}

impl McpClient {
    pub fn new(name: String, transport: Arc<dyn Transport>, request_timeout: Duration) -> Self {
        let (notifications_tx, _) = broadcast::channel(256);
        Self {
            name,
            transport,
            pending: Arc::new(Mutex::new(HashMap::new())),
            notifications_tx,
            request_timeout,
            demux: Mutex::new(None),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Start the transport and the demultiplexer. The returned channel
    /// carries at most one [`TransportClosed`] event.
    pub async fn start(&self) -> Result<mpsc::UnboundedReceiver<TransportClosed>> {
        let mut events = self.transport.start().await?;
        let (closed_tx, closed_rx) = mpsc::unbounded_channel();

        let name = self.name.clone();
        let pending = Arc::clone(&self.pending);
        let notifications_tx = self.notifications_tx.clone();
        let transport = Arc::clone(&self.transport);
        let closed_flag = Arc::clone(&self.closed);
        let demux = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    TransportEvent::Message(envelope) => {
                        dispatch_envelope(&name, envelope, &pending, &notifications_tx, &transport)
                            .await;
                    }
                    TransportEvent::Closed { reason, abnormal } => {
                        debug!("Transport for server '{}' closed: {}", name, reason);
                        closed_flag.store(true, Ordering::SeqCst);
                        pending.lock().await.clear();
                        let _ = closed_tx.send(TransportClosed { reason, abnormal });
                        return;
                    }
                }
            }
            // Event channel dropped without a close event: treat as abnormal
            closed_flag.store(true, Ordering::SeqCst);
            pending.lock().await.clear();
            let _ = closed_tx.send(TransportClosed {
                reason: "transport event stream ended".to_string(),
                abnormal: true,
            });
        });
        *self.demux.lock().await = Some(demux);

        Ok(closed_rx)
    }

    /// Subscribe to notifications arriving from this server
    pub fn subscribe_notifications(&self) -> broadcast::Receiver<McpNotification> {
        self.notifications_tx.subscribe()
    }

    /// Send a request and wait for its correlated response. A JSON-RPC level
    /// error still resolves to `Ok`; the caller decides how it propagates.
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<McpResponse> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(GatewayError::not_connected(self.name.clone()));
        }
        let request_id = Uuid::new_v4().to_string();
        let request = McpRequest::new(request_id.clone(), method, params);

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            pending.insert(request_id.clone(), tx);
        }

        if let Err(e) = self.transport.send(serde_json::to_value(&request)?).await {
            self.pending.lock().await.remove(&request_id);
            return Err(e);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => {
                self.pending.lock().await.remove(&request_id);
                Err(GatewayError::connection(format!(
                    "Response channel closed for MCP server '{}'",
                    self.name
                )))
            }
            Err(_) => {
                self.pending.lock().await.remove(&request_id);
                // Best effort: tell the server we gave up on this request
                let _ = self
                    .notify("notifications/cancelled", Some(json!({ "requestId": request_id })))
                    .await;
                Err(GatewayError::timeout(format!(
                    "Request '{}' to MCP server '{}' timed out",
                    method, self.name
                )))
            }
        }
    }

    /// Send a request and unwrap its result, converting a JSON-RPC error
    /// into a gateway error
    async fn request_result(&self, method: &str, params: Option<Value>) -> Result<Value> {
        let response = self.request(method, params).await?;
        if let Some(error) = response.error {
            return Err(GatewayError::mcp(format!(
                "MCP server '{}' returned error for {}: {}",
                self.name, method, error.message
            )));
        }
        response.result.ok_or_else(|| {
            GatewayError::mcp(format!(
                "MCP server '{}' returned no result for {}",
                self.name, method
            ))
        })
    }

    /// Send a notification (no response expected)
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let notification = McpRequest::notification(method, params);
        self.transport.send(serde_json::to_value(&notification)?).await
    }

    /// Perform the MCP initialize handshake
    pub async fn initialize(&self) -> Result<InitializeResult> {
        debug!("Initializing MCP server '{}'", self.name);
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {
                "roots": { "listChanged": true }
            },
            "clientInfo": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION")
            }
        });

        let result = self.request_result("initialize", Some(params)).await?;
        let initialized: InitializeResult = serde_json::from_value(result).map_err(|e| {
            GatewayError::mcp(format!(
                "MCP server '{}' returned a malformed initialize result: {}",
                self.name, e
            ))
        })?;

        self.notify("notifications/initialized", None).await?;
        Ok(initialized)
    }

    /// List available tools
    pub async fn list_tools(&self) -> Result<Vec<Tool>> {
        let result = self.request_result("tools/list", Some(json!({}))).await?;
        let list: ToolsListResult = serde_json::from_value(result)?;
        Ok(list.tools)
    }

    /// List available resources
    pub async fn list_resources(&self) -> Result<Vec<ResourceDef>> {
        let result = self.request_result("resources/list", Some(json!({}))).await?;
        let list: ResourcesListResult = serde_json::from_value(result)?;
        Ok(list.resources)
    }

    /// List available resource templates
    pub async fn list_resource_templates(&self) -> Result<Vec<ResourceTemplate>> {
        let result = self
            .request_result("resources/templates/list", Some(json!({})))
            .await?;
        let list: ResourceTemplatesListResult = serde_json::from_value(result)?;
        Ok(list.resource_templates)
    }

    /// List available prompts
    pub async fn list_prompts(&self) -> Result<Vec<Prompt>> {
        let result = self.request_result("prompts/list", Some(json!({}))).await?;
        let list: PromptsListResult = serde_json::from_value(result)?;
        Ok(list.prompts)
    }

    /// Set the server's log level
    pub async fn set_log_level(&self, level: &str) -> Result<()> {
        self.request_result("logging/setLevel", Some(json!({ "level": level })))
            .await
            .map(|_| ())
    }

    /// Liveness probe
    pub async fn ping(&self) -> Result<()> {
        self.request_result("ping", None).await.map(|_| ())
    }

    /// Tear down the transport and fail all pending requests
    pub async fn close(&self) {
        self.transport.close().await;
        if let Some(demux) = self.demux.lock().await.take() {
            demux.abort();
        }
        self.pending.lock().await.clear();
    }
}

/// Route one incoming envelope: response to its waiter, notification to the
/// broadcast, server-initiated request to a MethodNotFound reply.
async fn dispatch_envelope(
    name: &str,
    envelope: Value,
    pending: &Arc<Mutex<HashMap<String, oneshot::Sender<McpResponse>>>>,
    notifications_tx: &broadcast::Sender<McpNotification>,
    transport: &Arc<dyn Transport>,
) {
    let has_id = envelope.get("id").map_or(false, |id| !id.is_null());
    let has_method = envelope.get("method").is_some();

    if has_id && !has_method {
        match serde_json::from_value::<McpResponse>(envelope) {
            Ok(response) => {
                let key = response.id_key();
                let mut pending = pending.lock().await;
                match pending.remove(&key) {
                    Some(waiter) => {
                        if waiter.send(response).is_err() {
                            warn!("Waiter for request {} on server '{}' was dropped", key, name);
                        }
                    }
                    None => {
                        warn!("Response for unknown request id {} from server '{}'", key, name);
                    }
                }
            }
            Err(e) => warn!("Malformed response from server '{}': {}", name, e),
        }
        return;
    }

    if has_method && !has_id {
        match serde_json::from_value::<McpNotification>(envelope) {
            Ok(notification) => {
                debug!("Notification '{}' from server '{}'", notification.method, name);
                // No subscribers is fine; drop it
                let _ = notifications_tx.send(notification);
            }
            Err(e) => warn!("Malformed notification from server '{}': {}", name, e),
        }
        return;
    }

    if has_method && has_id {
        // Server-initiated request (sampling etc.): not proxied
        let method = envelope
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        warn!(
            "Server '{}' sent an unsupported request '{}'; replying MethodNotFound",
            name, method
        );
        let response = McpResponse::error(
            envelope.get("id").cloned().unwrap_or(Value::Null),
            McpError::method_not_found(&method),
        );
        if let Ok(envelope) = serde_json::to_value(&response) {
            let _ = transport.send(envelope).await;
        }
        return;
    }

    warn!("Unclassifiable envelope from server '{}'", name);
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    /// Transport double: records sent envelopes, lets the test inject events
    struct FakeTransport {
        sent: Mutex<Vec<Value>>,
        events_tx: Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
        injected: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
    }

    impl FakeTransport {
        fn new() -> (Arc<Self>, mpsc::UnboundedSender<TransportEvent>) {
            let (tx, rx) = mpsc::unbounded_channel();
            (
                Arc::new(Self {
                    sent: Mutex::new(Vec::new()),
                    events_tx: Mutex::new(Some(tx.clone())),
                    injected: Mutex::new(Some(rx)),
                }),
                tx,
            )
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn start(&self) -> Result<mpsc::UnboundedReceiver<TransportEvent>> {
            Ok(self.injected.lock().await.take().expect("started once"))
        }
        async fn send(&self, envelope: Value) -> Result<()> {
            self.sent.lock().await.push(envelope);
            Ok(())
        }
        async fn close(&self) {
            self.events_tx.lock().await.take();
        }
    }

    #[tokio::test]
    async fn test_request_response_correlation() {
        let (transport, inject) = FakeTransport::new();
        let client = McpClient::new(
            "fake".to_string(),
            transport.clone() as Arc<dyn Transport>,
            Duration::from_secs(5),
        );
        client.start().await.unwrap();

        let request = tokio::spawn({
            let transport = transport.clone();
            async move {
                // Wait for the outgoing request to learn its id
                loop {
                    if let Some(sent) = transport.sent.lock().await.first().cloned() {
                        return sent;
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            }
        });

        let response_task = tokio::spawn(async move {
            let sent = request.await.unwrap();
            let id = sent["id"].clone();
            inject
                .send(TransportEvent::Message(json!({
                    "jsonrpc": "2.0", "id": id, "result": {"tools": []}
                })))
                .unwrap();
        });

        let tools = client.list_tools().await.unwrap();
        assert!(tools.is_empty());
        response_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_notifications_are_broadcast() {
        let (transport, inject) = FakeTransport::new();
        let client = McpClient::new(
            "fake".to_string(),
            transport as Arc<dyn Transport>,
            Duration::from_secs(1),
        );
        client.start().await.unwrap();
        let mut notifications = client.subscribe_notifications();

        inject
            .send(TransportEvent::Message(json!({
                "jsonrpc": "2.0",
                "method": "notifications/tools/list_changed"
            })))
            .unwrap();

        let notification = tokio::time::timeout(Duration::from_secs(2), notifications.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(notification.method, "notifications/tools/list_changed");
    }

    #[tokio::test]
    async fn test_closed_event_is_forwarded() {
        let (transport, inject) = FakeTransport::new();
        let client = McpClient::new(
            "fake".to_string(),
            transport as Arc<dyn Transport>,
            Duration::from_secs(1),
        );
        let mut closed = client.start().await.unwrap();

        inject
            .send(TransportEvent::Closed {
                reason: "child died".to_string(),
                abnormal: true,
            })
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), closed.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(event.abnormal);
    }

    #[tokio::test]
    async fn test_server_request_gets_method_not_found() {
        let (transport, inject) = FakeTransport::new();
        let client = McpClient::new(
            "fake".to_string(),
            transport.clone() as Arc<dyn Transport>,
            Duration::from_secs(1),
        );
        client.start().await.unwrap();

        inject
            .send(TransportEvent::Message(json!({
                "jsonrpc": "2.0", "id": 9, "method": "sampling/createMessage", "params": {}
            })))
            .unwrap();

        // Wait for the reply to be written back
        let mut reply = None;
        for _ in 0..100 {
            if let Some(sent) = transport.sent.lock().await.first().cloned() {
                reply = Some(sent);
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let reply = reply.expect("error reply sent");
        assert_eq!(reply["id"], 9);
        assert_eq!(reply["error"]["code"], -32601);
    }
}
