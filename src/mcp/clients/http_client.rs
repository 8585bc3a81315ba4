//! HTTP round-trip transport
//!
//! Each envelope is one POST to the configured URL. Responses come back on
//! the shared event channel so the correlation layer treats all three
//! transports identically. Config headers ride on every request, augmented
//! by the outbound OAuth client when one is attached.

use crate::auth::OutboundOAuthClient;
use crate::config::OutboundServerSpec;
use crate::error::{GatewayError, Result};
use crate::mcp::clients::{Transport, TransportEvent};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::StatusCode;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

/// HTTP transport for one outbound server
pub struct HttpTransport {
    spec: Arc<OutboundServerSpec>,
    http: reqwest::Client,
    oauth: Option<Arc<OutboundOAuthClient>>,
    events_tx: Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
}

impl HttpTransport {
    pub fn new(spec: Arc<OutboundServerSpec>, oauth: Option<Arc<OutboundOAuthClient>>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(spec.timeout_ms))
            .user_agent(concat!("onemcp/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| GatewayError::connection(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            spec,
            http,
            oauth,
            events_tx: Mutex::new(None),
        })
    }

    fn config_headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        for (name, value) in &self.spec.headers {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                GatewayError::config(format!(
                    "Server '{}' has invalid header name '{}': {}",
                    self.spec.name, name, e
                ))
            })?;
            let value = HeaderValue::from_str(value).map_err(|e| {
                GatewayError::config(format!(
                    "Server '{}' has invalid header value for '{}': {}",
                    self.spec.name, name, e
                ))
            })?;
            headers.insert(name, value);
        }
        Ok(headers)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn start(&self) -> Result<mpsc::UnboundedReceiver<TransportEvent>> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.events_tx.lock().await = Some(tx);
        Ok(rx)
    }

    async fn send(&self, envelope: Value) -> Result<()> {
        let url = self.spec.url.as_deref().ok_or_else(|| {
            GatewayError::config(format!("HTTP server '{}' has no url", self.spec.name))
        })?;

        let mut request = self.http.post(url).headers(self.config_headers()?).json(&envelope);
        if let Some(oauth) = &self.oauth {
            request = oauth.attach_auth(request);
        }

        let response = request.send().await?;
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(GatewayError::auth(format!(
                "Server '{}' rejected the request with 401",
                self.spec.name
            )));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::connection(format!(
                "Server '{}' returned status {}: {}",
                self.spec.name, status, body
            )));
        }

        // 202 carries no body (notification accepted); anything else should
        // be one or more JSON-RPC envelopes
        if status == StatusCode::ACCEPTED {
            return Ok(());
        }
        let body = response.text().await?;
        if body.trim().is_empty() {
            return Ok(());
        }
        let parsed: Value = serde_json::from_str(&body).map_err(|e| {
            GatewayError::mcp(format!(
                "Server '{}' returned a non-JSON body: {}",
                self.spec.name, e
            ))
        })?;

        let guard = self.events_tx.lock().await;
        let events = guard
            .as_ref()
            .ok_or_else(|| GatewayError::not_connected(self.spec.name.clone()))?;
        match parsed {
            Value::Array(batch) => {
                for envelope in batch {
                    let _ = events.send(TransportEvent::Message(envelope));
                }
            }
            single => {
                let _ = events.send(TransportEvent::Message(single));
            }
        }
        Ok(())
    }

    async fn close(&self) {
        if self.events_tx.lock().await.take().is_some() {
            debug!("HTTP transport for server '{}' closed", self.spec.name);
        } else {
            warn!("HTTP transport for server '{}' closed twice", self.spec.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_servers_config;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn spec_for(url: &str) -> Arc<OutboundServerSpec> {
        let document = serde_json::json!({
            "mcpServers": {
                "web": {"type": "http", "url": url, "headers": {"X-Team": "infra"}}
            }
        });
        parse_servers_config(&document.to_string())
            .unwrap()
            .remove("web")
            .unwrap()
    }

    #[tokio::test]
    async fn test_roundtrip_delivers_response_event() {
        let mock = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/mcp"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "jsonrpc": "2.0", "id": "r1", "result": {"ok": true}
            })))
            .mount(&mock)
            .await;

        let transport = HttpTransport::new(spec_for(&format!("{}/mcp", mock.uri())), None).unwrap();
        let mut events = transport.start().await.unwrap();
        transport
            .send(serde_json::json!({"jsonrpc": "2.0", "id": "r1", "method": "ping"}))
            .await
            .unwrap();

        match events.recv().await {
            Some(TransportEvent::Message(envelope)) => {
                assert_eq!(envelope["id"], "r1");
                assert_eq!(envelope["result"]["ok"], true);
            }
            other => panic!("expected message, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unauthorized_maps_to_auth_error() {
        let mock = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&mock)
            .await;

        let transport = HttpTransport::new(spec_for(&format!("{}/mcp", mock.uri())), None).unwrap();
        transport.start().await.unwrap();
        let err = transport
            .send(serde_json::json!({"jsonrpc": "2.0", "id": 1, "method": "initialize"}))
            .await
            .unwrap_err();
        assert_eq!(err.category(), "auth");
    }

    #[tokio::test]
    async fn test_accepted_notification_produces_no_event() {
        let mock = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(202))
            .mount(&mock)
            .await;

        let transport = HttpTransport::new(spec_for(&format!("{}/mcp", mock.uri())), None).unwrap();
        let mut events = transport.start().await.unwrap();
        transport
            .send(serde_json::json!({"jsonrpc": "2.0", "method": "notifications/initialized"}))
            .await
            .unwrap();
        assert!(events.try_recv().is_err());
    }
}
