//! Outbound connection manager
//!
//! Owns one [`OutboundConnection`] per enabled server spec: connect with
//! exponential backoff, suspend into `AwaitingOAuth` on 401, probe
//! capabilities, supervise the live connection, and apply hot-reload diffs.
//! Each spec gets its own supervisor task, so one server's backoff never
//! blocks another's.

use crate::auth::{OAuthRendezvous, OutboundOAuthClient, SessionStore};
use crate::config::{ConfigDiff, OutboundServerSpec, ServersSnapshot, TransportKind};
use crate::error::{GatewayError, Result};
use crate::mcp::client::{McpClient, TransportClosed};
use crate::mcp::clients::{HttpTransport, SseTransport, StdioTransport, Transport};
use crate::mcp::types::ServerCapabilities;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tracing::{debug, error, info, warn};

/// Names this gateway announces; an outbound server reporting one of them is
/// a loop back into an aggregator
const GATEWAY_SERVER_NAMES: &[&str] = &["1mcp", "onemcp"];

/// Connection lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Pending,
    Connecting,
    #[serde(rename = "awaiting_oauth")]
    AwaitingOAuth,
    Connected,
    Disconnected,
    Error,
}

/// Observable state of one outbound connection
#[derive(Debug, Clone)]
pub struct OutboundConnection {
    pub spec: Arc<OutboundServerSpec>,
    pub status: ConnectionStatus,
    pub capabilities: Option<ServerCapabilities>,
    pub instructions: Option<String>,
    pub last_error: Option<String>,
    pub restart_count: u32,
    pub last_connected_at: Option<DateTime<Utc>>,
}

impl OutboundConnection {
    fn new(spec: Arc<OutboundServerSpec>) -> Self {
        Self {
            spec,
            status: ConnectionStatus::Pending,
            capabilities: None,
            instructions: None,
            last_error: None,
            restart_count: 0,
            last_connected_at: None,
        }
    }
}

/// Connection state transitions broadcast to the session layer
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Connected { server: String },
    Disconnected { server: String },
}

/// Connect retry knobs (per-spec backoff)
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(1000),
            max_attempts: 5,
        }
    }
}

/// Options for [`OutboundManager::execute`]
#[derive(Clone, Default)]
pub struct ExecuteOptions {
    /// Capability category that must be declared by the server
    pub required_capability: Option<&'static str>,
    /// Retries for non-protocol failures
    pub retry_count: u32,
    /// Delay between retries; defaults to one second
    pub retry_delay: Option<Duration>,
    /// Overall deadline; defaults to the spec's timeout
    pub timeout: Option<Duration>,
    /// Cooperative cancellation; flips to `true` when the caller gives up
    pub cancel: Option<watch::Receiver<bool>>,
}

type OpFuture<T> = Pin<Box<dyn Future<Output = Result<T>> + Send>>;

struct ConnectionEntry {
    state: OutboundConnection,
    client: Option<Arc<McpClient>>,
    supervisor: Option<tokio::task::JoinHandle<()>>,
}

/// The manager itself; shared behind an `Arc`
pub struct OutboundManager {
    connections: RwLock<HashMap<String, ConnectionEntry>>,
    store: Arc<SessionStore>,
    rendezvous: Arc<OAuthRendezvous>,
    /// Public base URL of the gateway, for OAuth callback redirects
    callback_base: String,
    retry: RetryPolicy,
    events_tx: broadcast::Sender<ConnectionEvent>,
    /// Guard against a transport's close callback re-entering disconnect
    disconnecting: Mutex<HashSet<String>>,
}

impl OutboundManager {
    pub fn new(
        store: Arc<SessionStore>,
        rendezvous: Arc<OAuthRendezvous>,
        callback_base: String,
        retry: RetryPolicy,
    ) -> Arc<Self> {
        let (events_tx, _) = broadcast::channel(256);
        Arc::new(Self {
            connections: RwLock::new(HashMap::new()),
            store,
            rendezvous,
            callback_base,
            retry,
            events_tx,
            disconnecting: Mutex::new(HashSet::new()),
        })
    }

    /// Subscribe to connection state transitions
    pub fn subscribe_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events_tx.subscribe()
    }

    /// Launch connections for every enabled spec in the snapshot
    pub async fn start(self: &Arc<Self>, snapshot: &ServersSnapshot) {
        for (name, spec) in snapshot {
            if spec.disabled {
                info!("Server '{}' is disabled; not starting", name);
                continue;
            }
            self.spawn_connection(Arc::clone(spec)).await;
        }
    }

    /// Snapshot of one connection
    pub async fn get(&self, server: &str) -> Option<OutboundConnection> {
        self.connections
            .read()
            .await
            .get(server)
            .map(|entry| entry.state.clone())
    }

    /// Snapshot of every connection
    pub async fn get_all(&self) -> HashMap<String, OutboundConnection> {
        self.connections
            .read()
            .await
            .iter()
            .map(|(name, entry)| (name.clone(), entry.state.clone()))
            .collect()
    }

    /// The live client for a Connected server
    pub async fn client(&self, server: &str) -> Result<Arc<McpClient>> {
        let connections = self.connections.read().await;
        let entry = connections
            .get(server)
            .ok_or_else(|| GatewayError::not_found(format!("unknown outbound server '{}'", server)))?;
        if entry.state.status != ConnectionStatus::Connected {
            return Err(GatewayError::not_connected(server));
        }
        entry
            .client
            .clone()
            .ok_or_else(|| GatewayError::not_connected(server))
    }

    /// Run an operation against a Connected server with capability guard,
    /// bounded retries, a deadline, and cooperative cancellation.
    pub async fn execute<T, F>(&self, server: &str, options: ExecuteOptions, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: Fn(Arc<McpClient>) -> OpFuture<T>,
    {
        let (client, spec_timeout) = {
            let connections = self.connections.read().await;
            let entry = connections.get(server).ok_or_else(|| {
                GatewayError::not_found(format!("unknown outbound server '{}'", server))
            })?;
            if entry.state.status != ConnectionStatus::Connected {
                return Err(GatewayError::not_connected(server));
            }
            if let Some(capability) = options.required_capability {
                let declared = entry
                    .state
                    .capabilities
                    .as_ref()
                    .map_or(false, |caps| caps.has(capability));
                if !declared {
                    return Err(GatewayError::capability_missing(server, capability));
                }
            }
            let client = entry
                .client
                .clone()
                .ok_or_else(|| GatewayError::not_connected(server))?;
            (client, Duration::from_millis(entry.state.spec.timeout_ms))
        };

        let deadline = options.timeout.unwrap_or(spec_timeout);
        let retry_delay = options.retry_delay.unwrap_or(Duration::from_millis(1000));
        let mut cancel = options.cancel.clone();

        let mut last_error = None;
        for attempt in 0..=options.retry_count {
            if let Some(cancel) = cancel.as_mut() {
                if *cancel.borrow() {
                    return Err(GatewayError::Cancelled);
                }
            }
            if attempt > 0 {
                match cancel.as_mut() {
                    Some(cancel) => {
                        tokio::select! {
                            _ = tokio::time::sleep(retry_delay) => {}
                            changed = cancel.changed() => {
                                if changed.is_ok() && *cancel.borrow() {
                                    return Err(GatewayError::Cancelled);
                                }
                            }
                        }
                    }
                    None => tokio::time::sleep(retry_delay).await,
                }
            }

            let work = op(Arc::clone(&client));
            let outcome = match cancel.as_mut() {
                Some(cancel) => {
                    tokio::select! {
                        outcome = tokio::time::timeout(deadline, work) => outcome,
                        changed = cancel.changed() => {
                            if changed.is_ok() && *cancel.borrow() {
                                return Err(GatewayError::Cancelled);
                            }
                            continue;
                        }
                    }
                }
                None => tokio::time::timeout(deadline, work).await,
            };

            match outcome {
                Err(_) => {
                    return Err(GatewayError::timeout(format!(
                        "operation against server '{}' exceeded {:?}",
                        server, deadline
                    )))
                }
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) => {
                    // Typed protocol errors are never retried
                    let retryable = !matches!(
                        e,
                        GatewayError::Mcp { .. }
                            | GatewayError::Cancelled
                            | GatewayError::Timeout { .. }
                            | GatewayError::Validation { .. }
                            | GatewayError::NotFound { .. }
                    );
                    if !retryable {
                        return Err(e);
                    }
                    warn!(
                        "Operation against server '{}' failed (attempt {}/{}): {}",
                        server,
                        attempt + 1,
                        options.retry_count + 1,
                        e
                    );
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| GatewayError::connection("operation failed")))
    }

    /// Apply a reload diff: disconnect removed and changed specs, start
    /// added and changed ones. Live inbound sessions stay up; the session
    /// layer reacts to the emitted connection events.
    pub async fn apply_reload(self: &Arc<Self>, diff: &ConfigDiff, snapshot: &ServersSnapshot) {
        if diff.is_empty() {
            debug!("Reload diff is empty; nothing to do");
            return;
        }
        for name in diff.removed.iter().chain(diff.changed.iter()) {
            self.disconnect(name, true).await;
        }
        for name in diff.added.iter().chain(diff.changed.iter()) {
            match snapshot.get(name) {
                Some(spec) if !spec.disabled => self.spawn_connection(Arc::clone(spec)).await,
                Some(_) => info!("Server '{}' is disabled after reload", name),
                None => warn!("Reload diff names unknown server '{}'", name),
            }
        }
    }

    /// Disconnect one server. `forget` removes the entry entirely (spec
    /// removed from config); otherwise it stays visible as Disconnected.
    pub async fn disconnect(&self, server: &str, forget: bool) {
        {
            let mut disconnecting = self.disconnecting.lock().await;
            if !disconnecting.insert(server.to_string()) {
                // A close callback is already driving this disconnect
                return;
            }
        }

        self.rendezvous.cancel(server);

        let (client, supervisor) = {
            let mut connections = self.connections.write().await;
            match connections.get_mut(server) {
                Some(entry) => {
                    entry.state.status = ConnectionStatus::Disconnected;
                    entry.state.capabilities = None;
                    entry.state.instructions = None;
                    (entry.client.take(), entry.supervisor.take())
                }
                None => (None, None),
            }
        };
        if let Some(supervisor) = supervisor {
            supervisor.abort();
        }
        if let Some(client) = client {
            client.close().await;
        }
        if forget {
            self.connections.write().await.remove(server);
        }
        self.disconnecting.lock().await.remove(server);

        info!("Disconnected outbound server '{}'", server);
        let _ = self.events_tx.send(ConnectionEvent::Disconnected {
            server: server.to_string(),
        });
    }

    /// Tear everything down (shutdown path)
    pub async fn shutdown(&self) {
        let names: Vec<String> = self.connections.read().await.keys().cloned().collect();
        for name in names {
            self.disconnect(&name, true).await;
        }
        self.rendezvous.cancel_all();
    }

    async fn spawn_connection(self: &Arc<Self>, spec: Arc<OutboundServerSpec>) {
        let name = spec.name.clone();
        {
            let mut connections = self.connections.write().await;
            connections.insert(
                name.clone(),
                ConnectionEntry {
                    state: OutboundConnection::new(Arc::clone(&spec)),
                    client: None,
                    supervisor: None,
                },
            );
        }

        let manager = Arc::clone(self);
        let supervisor = tokio::spawn(async move {
            manager.run_connection(spec).await;
        });

        if let Some(entry) = self.connections.write().await.get_mut(&name) {
            entry.supervisor = Some(supervisor);
        }
    }

    /// Per-spec supervisor: connect with retry, then babysit the live
    /// connection until it drops or the manager tears it down.
    async fn run_connection(self: Arc<Self>, spec: Arc<OutboundServerSpec>) {
        let name = spec.name.clone();
        let mut attempt: u32 = 0;

        loop {
            self.set_status(&name, ConnectionStatus::Connecting, None).await;

            let oauth = self.oauth_for(&spec);
            let transport: Arc<dyn Transport> = match self.build_transport(&spec, oauth.clone()) {
                Ok(transport) => transport,
                Err(e) => {
                    error!("Server '{}' has an unusable transport config: {}", name, e);
                    self.set_status(&name, ConnectionStatus::Error, Some(e.to_string())).await;
                    return;
                }
            };
            let client = Arc::new(McpClient::new(
                name.clone(),
                transport,
                Duration::from_millis(spec.timeout_ms),
            ));

            let connect_result = async {
                let closed_rx = client.start().await?;
                let init = client.initialize().await?;
                Ok::<_, GatewayError>((closed_rx, init))
            }
            .await;

            let (mut closed_rx, init) = match connect_result {
                Ok(ok) => ok,
                Err(GatewayError::Auth { message }) => {
                    client.close().await;
                    warn!("Server '{}' requires authorization: {}", name, message);
                    self.set_status(&name, ConnectionStatus::AwaitingOAuth, Some(message)).await;
                    let Some(oauth) = oauth else {
                        self.set_status(
                            &name,
                            ConnectionStatus::Error,
                            Some("server demands OAuth but transport kind does not support it".to_string()),
                        )
                        .await;
                        return;
                    };
                    match oauth.ensure_token().await {
                        Ok(_) => {
                            info!("Server '{}' authorized; retrying handshake", name);
                            // Immediate retry, no backoff
                            continue;
                        }
                        Err(e) => {
                            error!("Authorization for server '{}' failed: {}", name, e);
                            self.set_status(&name, ConnectionStatus::Error, Some(e.to_string())).await;
                            return;
                        }
                    }
                }
                Err(e) => {
                    client.close().await;
                    // Stdio servers with a restart policy account connect
                    // failures against the restart budget instead of backoff
                    if spec.kind == TransportKind::Stdio && spec.restart_on_exit {
                        self.set_status(&name, ConnectionStatus::Disconnected, Some(e.to_string()))
                            .await;
                        if self.consume_restart_budget(&name, &spec).await {
                            tokio::time::sleep(Duration::from_millis(spec.restart_delay_ms)).await;
                            continue;
                        }
                        return;
                    }
                    attempt += 1;
                    if attempt >= self.retry.max_attempts {
                        error!(
                            "Server '{}' failed to connect after {} attempts: {}",
                            name, attempt, e
                        );
                        self.set_status(&name, ConnectionStatus::Error, Some(e.to_string())).await;
                        return;
                    }
                    let delay = self.retry.initial_delay * 2u32.saturating_pow(attempt - 1);
                    warn!(
                        "Server '{}' connect attempt {} failed: {}; retrying in {:?}",
                        name, attempt, e, delay
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };

            // Refuse to proxy another aggregating gateway
            let server_name_lower = init.server_info.name.to_lowercase();
            if GATEWAY_SERVER_NAMES.iter().any(|g| server_name_lower == *g) {
                error!(
                    "Server '{}' identifies as '{}', another aggregating gateway",
                    name, init.server_info.name
                );
                client.close().await;
                self.set_status(
                    &name,
                    ConnectionStatus::Error,
                    Some(GatewayError::CircularDependency { server: name.clone() }.to_string()),
                )
                .await;
                return;
            }

            attempt = 0;
            {
                let mut connections = self.connections.write().await;
                if let Some(entry) = connections.get_mut(&name) {
                    entry.client = Some(Arc::clone(&client));
                    entry.state.status = ConnectionStatus::Connected;
                    entry.state.capabilities = Some(init.capabilities.clone());
                    entry.state.instructions = init.instructions.clone();
                    entry.state.last_error = None;
                    entry.state.restart_count = 0;
                    entry.state.last_connected_at = Some(Utc::now());
                }
            }
            info!(
                "Server '{}' connected ({} v{})",
                name, init.server_info.name, init.server_info.version
            );
            let _ = self.events_tx.send(ConnectionEvent::Connected { server: name.clone() });

            // Babysit until the transport drops
            let closed: Option<TransportClosed> = closed_rx.recv().await;
            let closed = closed.unwrap_or(TransportClosed {
                reason: "transport event stream dropped".to_string(),
                abnormal: true,
            });

            if self.disconnecting.lock().await.contains(&name) {
                // The manager initiated this close; disconnect() owns the rest
                return;
            }
            client.close().await;

            warn!("Server '{}' connection lost: {}", name, closed.reason);
            {
                let mut connections = self.connections.write().await;
                if let Some(entry) = connections.get_mut(&name) {
                    entry.client = None;
                    entry.state.status = ConnectionStatus::Disconnected;
                    entry.state.capabilities = None;
                    entry.state.instructions = None;
                    entry.state.last_error = Some(closed.reason.clone());
                }
            }
            let _ = self.events_tx.send(ConnectionEvent::Disconnected { server: name.clone() });

            match spec.kind {
                TransportKind::Stdio => {
                    if !(spec.restart_on_exit && closed.abnormal) {
                        return;
                    }
                    if self.consume_restart_budget(&name, &spec).await {
                        tokio::time::sleep(Duration::from_millis(spec.restart_delay_ms)).await;
                        continue;
                    }
                    return;
                }
                TransportKind::Http | TransportKind::Sse => {
                    // Network drop: go back through connect-with-retry
                    attempt = 0;
                    tokio::time::sleep(self.retry.initial_delay).await;
                    continue;
                }
            }
        }
    }

    /// Account one respawn against the spec's restart budget. Returns true
    /// when a respawn may proceed; on an exhausted budget the connection is
    /// parked in Error until a reload replaces the spec.
    async fn consume_restart_budget(&self, server: &str, spec: &OutboundServerSpec) -> bool {
        let restarts = {
            let mut connections = self.connections.write().await;
            match connections.get_mut(server) {
                Some(entry) => {
                    if let Some(max) = spec.max_restarts {
                        if entry.state.restart_count >= max {
                            entry.state.status = ConnectionStatus::Error;
                            entry.state.last_error =
                                Some(format!("restart budget of {} exhausted", max));
                            error!(
                                "Server '{}' exhausted its restart budget ({}); giving up",
                                server, max
                            );
                            return false;
                        }
                    }
                    entry.state.restart_count += 1;
                    entry.state.restart_count
                }
                None => return false,
            }
        };
        info!(
            "Restarting server '{}' in {} ms (restart {})",
            server, spec.restart_delay_ms, restarts
        );
        true
    }

    fn oauth_for(&self, spec: &Arc<OutboundServerSpec>) -> Option<Arc<OutboundOAuthClient>> {
        if spec.kind == TransportKind::Stdio {
            return None;
        }
        let url = spec.url.clone()?;
        let oauth_spec = spec.oauth.clone().unwrap_or(crate::config::OAuthSpec {
            client_id: None,
            client_secret: None,
            scopes: Vec::new(),
            redirect_url: None,
        });
        let redirect_url = oauth_spec.redirect_url.clone().unwrap_or_else(|| {
            format!("{}/oauth/callback/{}", self.callback_base, spec.name)
        });
        Some(Arc::new(OutboundOAuthClient::new(
            spec.name.clone(),
            url,
            oauth_spec,
            redirect_url,
            Arc::clone(&self.store),
            Arc::clone(&self.rendezvous),
        )))
    }

    fn build_transport(
        &self,
        spec: &Arc<OutboundServerSpec>,
        oauth: Option<Arc<OutboundOAuthClient>>,
    ) -> Result<Arc<dyn Transport>> {
        Ok(match spec.kind {
            TransportKind::Stdio => Arc::new(StdioTransport::new(Arc::clone(spec))),
            TransportKind::Http => Arc::new(HttpTransport::new(Arc::clone(spec), oauth)?),
            TransportKind::Sse => Arc::new(SseTransport::new(Arc::clone(spec), oauth)?),
        })
    }

    async fn set_status(&self, server: &str, status: ConnectionStatus, error: Option<String>) {
        let mut connections = self.connections.write().await;
        if let Some(entry) = connections.get_mut(server) {
            entry.state.status = status;
            if error.is_some() {
                entry.state.last_error = error;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_servers_config;
    use crate::mcp::test_support::{fake_server_entry, fake_server_snapshot, snapshot_from};
    use serde_json::json;

    fn manager() -> Arc<OutboundManager> {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SessionStore::new(dir.path().to_path_buf()).unwrap());
        std::mem::forget(dir);
        OutboundManager::new(
            store,
            Arc::new(OAuthRendezvous::new()),
            "http://127.0.0.1:3050".to_string(),
            RetryPolicy {
                initial_delay: Duration::from_millis(50),
                max_attempts: 2,
            },
        )
    }

    async fn wait_for_status(
        manager: &OutboundManager,
        server: &str,
        status: ConnectionStatus,
    ) -> OutboundConnection {
        for _ in 0..200 {
            if let Some(connection) = manager.get(server).await {
                if connection.status == status {
                    return connection;
                }
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("server '{}' never reached {:?}", server, status);
    }

    #[tokio::test]
    async fn test_connects_and_probes_capabilities() {
        let manager = manager();
        manager.start(&fake_server_snapshot("echo", "ping")).await;

        let connection = wait_for_status(&manager, "echo", ConnectionStatus::Connected).await;
        assert!(connection.capabilities.unwrap().has("tools"));
        assert!(connection.last_connected_at.is_some());
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_execute_runs_ops_and_guards_capabilities() {
        let manager = manager();
        manager.start(&fake_server_snapshot("echo", "ping")).await;
        wait_for_status(&manager, "echo", ConnectionStatus::Connected).await;

        let tools = manager
            .execute("echo", ExecuteOptions::default(), |client| {
                Box::pin(async move { client.list_tools().await })
            })
            .await
            .unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "ping");

        let err = manager
            .execute(
                "echo",
                ExecuteOptions {
                    required_capability: Some("prompts"),
                    ..Default::default()
                },
                |client| Box::pin(async move { client.list_prompts().await }),
            )
            .await
            .unwrap_err();
        assert_eq!(err.category(), "capability_missing");

        let err = manager
            .execute("ghost", ExecuteOptions::default(), |client| {
                Box::pin(async move { client.ping().await.map(|_| ()) })
            })
            .await
            .unwrap_err();
        assert_eq!(err.category(), "not_found");
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_connect_failure_settles_in_error() {
        let manager = manager();
        let snapshot = parse_servers_config(
            r#"{"mcpServers": {"broken": {"command": "sh", "args": ["-c", "exit 1"], "timeout": 2000}}}"#,
        )
        .unwrap();
        manager.start(&snapshot).await;
        let connection = wait_for_status(&manager, "broken", ConnectionStatus::Error).await;
        assert!(connection.last_error.is_some());
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_restart_budget_exhaustion() {
        let manager = manager();
        // Exits with code 1 before ever answering the handshake, like a
        // misconfigured child; short timeout keeps the test quick
        let document = json!({
            "mcpServers": {
                "flaky": {
                    "command": "sh",
                    "args": ["-c", "exit 1"],
                    "restartOnExit": true,
                    "maxRestarts": 2,
                    "restartDelay": 50,
                    "timeout": 2000,
                }
            }
        });
        let snapshot = parse_servers_config(&document.to_string()).unwrap();
        manager.start(&snapshot).await;

        let connection = wait_for_status(&manager, "flaky", ConnectionStatus::Error).await;
        assert!(connection.last_error.unwrap().contains("restart budget"));
        assert_eq!(connection.restart_count, 2);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_circular_dependency_rejected() {
        let manager = manager();
        // The fake server announces itself under the gateway's own name
        let mut entry = fake_server_entry("loopy", "t", &[]);
        entry["env"]["SERVER_NAME"] = json!("1mcp");
        let snapshot_loop = snapshot_from(&[("loopy", entry)]);
        manager.start(&snapshot_loop).await;

        let connection = wait_for_status(&manager, "loopy", ConnectionStatus::Error).await;
        assert!(connection.last_error.unwrap().contains("aggregating gateway"));
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_reload_applies_diff() {
        let manager = manager();
        let old = fake_server_snapshot("echo", "ping");
        manager.start(&old).await;
        wait_for_status(&manager, "echo", ConnectionStatus::Connected).await;

        let mut events = manager.subscribe_events();

        // New snapshot: echo removed, capability added
        let new = fake_server_snapshot("capability", "reflect");
        let diff = crate::config::diff_snapshots(&old, &new);
        manager.apply_reload(&diff, &new).await;

        wait_for_status(&manager, "capability", ConnectionStatus::Connected).await;
        assert!(manager.get("echo").await.is_none(), "removed spec is forgotten");

        let mut saw_disconnect = false;
        let mut saw_connect = false;
        while let Ok(event) = events.try_recv() {
            match event {
                ConnectionEvent::Disconnected { server } if server == "echo" => saw_disconnect = true,
                ConnectionEvent::Connected { server } if server == "capability" => saw_connect = true,
                _ => {}
            }
        }
        assert!(saw_disconnect && saw_connect);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_empty_diff_is_a_no_op() {
        let manager = manager();
        let snapshot = fake_server_snapshot("echo", "ping");
        manager.start(&snapshot).await;
        wait_for_status(&manager, "echo", ConnectionStatus::Connected).await;

        let mut events = manager.subscribe_events();
        let diff = crate::config::diff_snapshots(&snapshot, &snapshot);
        manager.apply_reload(&diff, &snapshot).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(events.try_recv().is_err(), "no events for an identical reload");
        let connection = manager.get("echo").await.unwrap();
        assert_eq!(connection.status, ConnectionStatus::Connected);
        manager.shutdown().await;
    }
}
