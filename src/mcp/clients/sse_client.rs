//! SSE transport (legacy HTTP+SSE pairing)
//!
//! A persistent `text/event-stream` GET carries server-to-client messages; a
//! companion POST endpoint carries client-to-server messages. The server may
//! announce the POST endpoint with an `endpoint` event; until then the base
//! URL is used. Stream loss surfaces as an abnormal close to the connection
//! manager, which owns reconnection.

use crate::auth::OutboundOAuthClient;
use crate::config::OutboundServerSpec;
use crate::error::{GatewayError, Result};
use crate::mcp::clients::{Transport, TransportEvent};
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::StatusCode;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

/// SSE transport for one outbound server
pub struct SseTransport {
    spec: Arc<OutboundServerSpec>,
    http: reqwest::Client,
    oauth: Option<Arc<OutboundOAuthClient>>,
    /// POST endpoint, possibly rewritten by the server's `endpoint` event
    post_url: Arc<Mutex<String>>,
    reader: Mutex<Option<tokio::task::JoinHandle<()>>>,
    events_tx: Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
}

impl SseTransport {
    pub fn new(spec: Arc<OutboundServerSpec>, oauth: Option<Arc<OutboundOAuthClient>>) -> Result<Self> {
        let url = spec
            .url
            .clone()
            .ok_or_else(|| GatewayError::config(format!("SSE server '{}' has no url", spec.name)))?;
        // The stream must outlive individual request timeouts
        let http = reqwest::Client::builder()
            .user_agent(concat!("onemcp/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| GatewayError::connection(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            spec,
            http,
            oauth,
            post_url: Arc::new(Mutex::new(url)),
            reader: Mutex::new(None),
            events_tx: Mutex::new(None),
        })
    }

    fn config_headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
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
impl Transport for SseTransport {
    async fn start(&self) -> Result<mpsc::UnboundedReceiver<TransportEvent>> {
        let stream_url = self.spec.url.clone().unwrap_or_default();
        let mut headers = self.config_headers()?;
        headers.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));

        let mut request = self.http.get(&stream_url).headers(headers);
        if let Some(oauth) = &self.oauth {
            request = oauth.attach_auth(request);
        }

        info!("Opening SSE stream for server '{}' at {}", self.spec.name, stream_url);
        let response = request.send().await.map_err(|e| {
            GatewayError::connection(format!(
                "Failed to open SSE stream for server '{}': {}",
                self.spec.name, e
            ))
        })?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(GatewayError::auth(format!(
                "Server '{}' rejected the SSE stream with 401",
                self.spec.name
            )));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::connection(format!(
                "SSE stream for server '{}' failed with status {}: {}",
                self.spec.name, status, body
            )));
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        *self.events_tx.lock().await = Some(events_tx.clone());

        let name = self.spec.name.clone();
        let post_url = Arc::clone(&self.post_url);
        let base_url = stream_url.clone();
        let reader = tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut buffer = String::new();
            loop {
                match stream.next().await {
                    Some(Ok(chunk)) => {
                        buffer.push_str(&String::from_utf8_lossy(&chunk));
                        // Process complete SSE events
                        while let Some(event_end) = buffer.find("\n\n") {
                            let event_text = buffer[..event_end].to_string();
                            buffer = buffer[event_end + 2..].to_string();
                            handle_sse_event(&name, &event_text, &base_url, &post_url, &events_tx).await;
                        }
                    }
                    Some(Err(e)) => {
                        error!("SSE stream error for server '{}': {}", name, e);
                        let _ = events_tx.send(TransportEvent::Closed {
                            reason: format!("stream error: {}", e),
                            abnormal: true,
                        });
                        return;
                    }
                    None => {
                        info!("SSE stream ended for server '{}'", name);
                        let _ = events_tx.send(TransportEvent::Closed {
                            reason: "stream closed by server".to_string(),
                            abnormal: true,
                        });
                        return;
                    }
                }
            }
        });
        *self.reader.lock().await = Some(reader);

        Ok(events_rx)
    }

    async fn send(&self, envelope: Value) -> Result<()> {
        let url = self.post_url.lock().await.clone();
        let mut headers = self.config_headers()?;
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let mut request = self.http.post(&url).headers(headers).json(&envelope);
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
                "SSE POST for server '{}' failed with status {}: {}",
                self.spec.name, status, body
            )));
        }
        debug!("SSE POST sent for server '{}'", self.spec.name);
        Ok(())
    }

    async fn close(&self) {
        self.events_tx.lock().await.take();
        if let Some(reader) = self.reader.lock().await.take() {
            reader.abort();
        }
        debug!("SSE transport for server '{}' closed", self.spec.name);
    }
}

/// Dispatch one parsed SSE event
async fn handle_sse_event(
    name: &str,
    event_text: &str,
    base_url: &str,
    post_url: &Arc<Mutex<String>>,
    events_tx: &mpsc::UnboundedSender<TransportEvent>,
) {
    let mut event_name = "message";
    let mut data_lines: Vec<&str> = Vec::new();
    for line in event_text.lines() {
        if let Some(rest) = line.strip_prefix("event:") {
            event_name = rest.trim();
        } else if let Some(rest) = line.strip_prefix("data:") {
            data_lines.push(rest.strip_prefix(' ').unwrap_or(rest));
        }
    }
    if data_lines.is_empty() {
        return;
    }
    let data = data_lines.join("\n");

    match event_name {
        // Legacy SSE servers announce their POST endpoint before anything else
        "endpoint" => {
            let resolved = match url::Url::parse(base_url).and_then(|base| base.join(data.trim())) {
                Ok(resolved) => resolved.to_string(),
                Err(e) => {
                    warn!("Server '{}' sent an unusable endpoint event '{}': {}", name, data, e);
                    return;
                }
            };
            debug!("Server '{}' announced POST endpoint {}", name, resolved);
            *post_url.lock().await = resolved;
        }
        _ => match serde_json::from_str::<Value>(&data) {
            Ok(envelope) => {
                let _ = events_tx.send(TransportEvent::Message(envelope));
            }
            Err(e) => {
                warn!("Failed to parse SSE data from server '{}': {} ({})", name, data, e);
            }
        },
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
            "mcpServers": {"events": {"type": "sse", "url": url}}
        });
        parse_servers_config(&document.to_string())
            .unwrap()
            .remove("events")
            .unwrap()
    }

    #[tokio::test]
    async fn test_stream_events_are_delivered() {
        let mock = MockServer::start().await;
        let body = "event: endpoint\ndata: /messages?session=1\n\n\
                    data: {\"jsonrpc\":\"2.0\",\"id\":\"a\",\"result\":{}}\n\n";
        Mock::given(method("GET"))
            .and(path("/sse"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_raw(body, "text/event-stream"),
            )
            .mount(&mock)
            .await;

        let transport = SseTransport::new(spec_for(&format!("{}/sse", mock.uri())), None).unwrap();
        let mut events = transport.start().await.unwrap();

        match tokio::time::timeout(std::time::Duration::from_secs(5), events.recv()).await {
            Ok(Some(TransportEvent::Message(envelope))) => assert_eq!(envelope["id"], "a"),
            other => panic!("expected message, got {:?}", other),
        }
        // Endpoint event rewrote the POST target
        assert_eq!(
            *transport.post_url.lock().await,
            format!("{}/messages?session=1", mock.uri())
        );

        // Stream end surfaces as abnormal close
        match tokio::time::timeout(std::time::Duration::from_secs(5), events.recv()).await {
            Ok(Some(TransportEvent::Closed { abnormal, .. })) => assert!(abnormal),
            other => panic!("expected close, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unauthorized_stream_maps_to_auth_error() {
        let mock = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&mock)
            .await;

        let transport = SseTransport::new(spec_for(&format!("{}/sse", mock.uri())), None).unwrap();
        let err = transport.start().await.unwrap_err();
        assert_eq!(err.category(), "auth");
    }
}
