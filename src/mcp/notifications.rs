//! Notification bridge
//!
//! Forwards notifications across every (inbound session, outbound
//! connection) pair the session's filter selects. Each direction has a fixed
//! method table; everything else is dropped. Forwarded params are shallow
//! clones gaining exactly one provenance field (`server` going inbound,
//! `client` going outbound), with known names and URIs re-mangled.

use crate::mcp::client::McpClient;
use crate::mcp::manager::{ConnectionStatus, OutboundManager};
use crate::mcp::naming;
use crate::mcp::types::McpNotification;
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Notification methods forwarded from outbound servers to inbound sessions
pub const OUTBOUND_TO_INBOUND: &[&str] = &[
    "notifications/cancelled",
    "notifications/progress",
    "notifications/message",
    "notifications/resources/updated",
    "notifications/resources/list_changed",
    "notifications/tools/list_changed",
    "notifications/prompts/list_changed",
];

/// Notification methods forwarded from inbound sessions to outbound servers
pub const INBOUND_TO_OUTBOUND: &[&str] = &[
    "notifications/cancelled",
    "notifications/progress",
    "notifications/initialized",
    "notifications/roots/list_changed",
];

/// Rewrite an outbound-origin notification for delivery to a session.
/// Returns `None` when the method is not bridged.
pub fn annotate_outbound(server: &str, notification: &McpNotification) -> Option<McpNotification> {
    if !OUTBOUND_TO_INBOUND.contains(&notification.method.as_str()) {
        return None;
    }

    let mut params = match &notification.params {
        Some(Value::Object(map)) => map.clone(),
        Some(other) => {
            // Params should be an object; wrap anything else so the
            // provenance field has somewhere to live
            let mut map = Map::new();
            map.insert("value".to_string(), other.clone());
            map
        }
        None => Map::new(),
    };

    // Identifiers of known items are re-mangled into the flat namespace
    if notification.method == "notifications/resources/updated" {
        if let Some(Value::String(uri)) = params.get("uri") {
            let mangled = naming::mangle_uri(server, uri);
            params.insert("uri".to_string(), Value::String(mangled));
        }
    }

    params.insert("server".to_string(), Value::String(server.to_string()));
    Some(McpNotification::with_params(
        notification.method.clone(),
        Value::Object(params),
    ))
}

/// Rewrite an inbound-origin notification for delivery to outbound servers.
/// Returns `None` when the method is not bridged.
pub fn annotate_inbound(session_id: &str, notification: &McpNotification) -> Option<McpNotification> {
    if !INBOUND_TO_OUTBOUND.contains(&notification.method.as_str()) {
        return None;
    }
    let mut params = match &notification.params {
        Some(Value::Object(map)) => map.clone(),
        Some(other) => {
            let mut map = Map::new();
            map.insert("value".to_string(), other.clone());
            map
        }
        None => Map::new(),
    };
    params.insert("client".to_string(), Value::String(session_id.to_string()));
    Some(McpNotification::with_params(
        notification.method.clone(),
        Value::Object(params),
    ))
}

/// Spawn the outbound-to-inbound forwarder for one (session, server) pair.
/// Lives until the server's broadcast closes or the session queue drops.
pub fn spawn_outbound_forwarder(
    server: String,
    client: &McpClient,
    session_id: String,
    session_tx: mpsc::UnboundedSender<McpNotification>,
) -> tokio::task::JoinHandle<()> {
    let mut notifications = client.subscribe_notifications();
    tokio::spawn(async move {
        loop {
            match notifications.recv().await {
                Ok(notification) => {
                    let Some(annotated) = annotate_outbound(&server, &notification) else {
                        debug!(
                            "Dropping unbridged notification '{}' from server '{}'",
                            notification.method, server
                        );
                        continue;
                    };
                    if session_tx.send(annotated).is_err() {
                        // Session is gone; the forwarder dies with it
                        return;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(
                        "Session '{}' lagged {} notification(s) from server '{}'",
                        session_id, skipped, server
                    );
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            }
        }
    })
}

/// Forward an inbound notification to every selected outbound server.
/// Servers that are not Connected drop the notification with a warning; no
/// queueing.
pub async fn forward_inbound(
    manager: &Arc<OutboundManager>,
    servers: &[String],
    session_id: &str,
    notification: &McpNotification,
) {
    let Some(annotated) = annotate_inbound(session_id, notification) else {
        debug!(
            "Dropping unbridged inbound notification '{}' from session '{}'",
            notification.method, session_id
        );
        return;
    };

    for server in servers {
        let connection = manager.get(server).await;
        let connected = connection
            .map(|c| c.status == ConnectionStatus::Connected)
            .unwrap_or(false);
        if !connected {
            warn!(
                "Dropping notification '{}' for server '{}': not connected",
                annotated.method, server
            );
            continue;
        }
        match manager.client(server).await {
            Ok(client) => {
                if let Err(e) = client
                    .notify(&annotated.method, annotated.params.clone())
                    .await
                {
                    warn!(
                        "Failed to forward notification '{}' to server '{}': {}",
                        annotated.method, server, e
                    );
                }
            }
            Err(e) => warn!(
                "Dropping notification '{}' for server '{}': {}",
                annotated.method, server, e
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_outbound_annotation_adds_exactly_one_server_field() {
        let notification = McpNotification::with_params(
            "notifications/progress".to_string(),
            json!({"progressToken": "t", "progress": 5}),
        );
        let annotated = annotate_outbound("files", &notification).unwrap();
        let params = annotated.params.unwrap();
        assert_eq!(params["server"], "files");
        assert_eq!(params["progressToken"], "t");
        assert_eq!(params["progress"], 5);
        assert_eq!(params.as_object().unwrap().len(), 3);
    }

    #[test]
    fn test_resource_updated_uri_is_remangled() {
        let notification = McpNotification::with_params(
            "notifications/resources/updated".to_string(),
            json!({"uri": "file:///tmp/x"}),
        );
        let annotated = annotate_outbound("files", &notification).unwrap();
        let params = annotated.params.unwrap();
        assert_eq!(params["uri"], "file://files_1mcp_/tmp/x");
    }

    #[test]
    fn test_unbridged_methods_are_dropped() {
        let notification = McpNotification::new("notifications/unknown/event".to_string());
        assert!(annotate_outbound("s", &notification).is_none());

        let inbound = McpNotification::new("notifications/resources/updated".to_string());
        // resources/updated only flows outbound-to-inbound
        assert!(annotate_inbound("session-1", &inbound).is_none());
    }

    #[test]
    fn test_inbound_annotation_adds_client_field() {
        let notification = McpNotification::with_params(
            "notifications/roots/list_changed".to_string(),
            json!({}),
        );
        let annotated = annotate_inbound("session-1", &notification).unwrap();
        assert_eq!(annotated.params.unwrap()["client"], "session-1");
    }
}
