//! Outbound MCP transports
//!
//! Three transport implementations (stdio child process, HTTP round-trip,
//! SSE stream) behind a common interface: start the I/O, send opaque
//! JSON-RPC envelopes, and surface incoming envelopes plus disconnects on an
//! event channel.

pub mod http_client;
pub mod sse_client;
pub mod stdio;

use crate::error::Result;
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

// Re-export main types
pub use http_client::HttpTransport;
pub use sse_client::SseTransport;
pub use stdio::StdioTransport;

/// Events surfaced by a running transport
#[derive(Debug)]
pub enum TransportEvent {
    /// An incoming JSON-RPC envelope (response, notification, or request)
    Message(Value),
    /// The transport lost its connection. `abnormal` is true for child exits
    /// with a non-zero status or signal, and for dropped network streams.
    Closed { reason: String, abnormal: bool },
}

/// Common interface over the three outbound transports
#[async_trait]
pub trait Transport: Send + Sync {
    /// Launch the underlying I/O and return the incoming event stream.
    /// Called at most once per transport instance.
    async fn start(&self) -> Result<mpsc::UnboundedReceiver<TransportEvent>>;

    /// Send one JSON-RPC envelope
    async fn send(&self, envelope: Value) -> Result<()>;

    /// Tear down the transport; idempotent
    async fn close(&self);
}
