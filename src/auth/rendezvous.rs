//! Authorization-code rendezvous for outbound OAuth flows
//!
//! The outbound OAuth client parks here after surfacing an authorization URL;
//! the inbound-facing callback route (`/oauth/callback/{serverName}`) wakes it
//! with the code once a human completes the dance. One pending authorization
//! per server name at a time.

use crate::error::{GatewayError, Result};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{info, warn};

/// How long a waiter blocks before the connect attempt fails
pub const RENDEZVOUS_TIMEOUT: Duration = Duration::from_secs(300);

enum Outcome {
    Code(String),
    Cancelled,
}

struct Pending {
    authorization_url: String,
    state: String,
    waiter: oneshot::Sender<Outcome>,
}

/// Parking lot keyed by outbound server name
#[derive(Default)]
pub struct OAuthRendezvous {
    pending: Mutex<HashMap<String, Pending>>,
}

impl OAuthRendezvous {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park until the callback delivers an authorization code.
    ///
    /// Stores `authorization_url` so operators can retrieve it while the
    /// waiter blocks. Replaces (and cancels) any earlier waiter for the same
    /// server.
    pub async fn wait_for_code(
        &self,
        server: &str,
        authorization_url: String,
        state: String,
    ) -> Result<String> {
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().unwrap();
            if let Some(previous) = pending.remove(server) {
                warn!("Replacing pending authorization for server '{}'", server);
                let _ = previous.waiter.send(Outcome::Cancelled);
            }
            pending.insert(
                server.to_string(),
                Pending {
                    authorization_url: authorization_url.clone(),
                    state,
                    waiter: tx,
                },
            );
        }

        info!(
            "Server '{}' requires authorization; visit: {}",
            server, authorization_url
        );

        match tokio::time::timeout(RENDEZVOUS_TIMEOUT, rx).await {
            Ok(Ok(Outcome::Code(code))) => Ok(code),
            Ok(Ok(Outcome::Cancelled)) => Err(GatewayError::Cancelled),
            Ok(Err(_)) => Err(GatewayError::auth(format!(
                "Authorization waiter for server '{}' was dropped",
                server
            ))),
            Err(_) => {
                self.pending.lock().unwrap().remove(server);
                Err(GatewayError::timeout(format!(
                    "Authorization for server '{}' was not completed in time",
                    server
                )))
            }
        }
    }

    /// Deliver the authorization code from the HTTP callback.
    ///
    /// The callback's `state` must equal the stored value; a mismatch leaves
    /// the waiter parked so a forged callback cannot complete the flow.
    pub fn deliver(&self, server: &str, code: &str, state: &str) -> Result<()> {
        let mut pending = self.pending.lock().unwrap();
        let matches = match pending.get(server) {
            None => {
                return Err(GatewayError::not_found(format!(
                    "unknown_server: no pending authorization for '{}'",
                    server
                )))
            }
            Some(entry) => entry.state == state,
        };
        if !matches {
            warn!("State mismatch on OAuth callback for server '{}'", server);
            return Err(GatewayError::auth(format!(
                "State mismatch on OAuth callback for server '{}'",
                server
            )));
        }
        let entry = pending.remove(server).expect("checked above");
        let _ = entry.waiter.send(Outcome::Code(code.to_string()));
        Ok(())
    }

    /// Release a waiter because its spec was removed; later callbacks for the
    /// server fail with `unknown_server`
    pub fn cancel(&self, server: &str) -> bool {
        match self.pending.lock().unwrap().remove(server) {
            Some(entry) => {
                let _ = entry.waiter.send(Outcome::Cancelled);
                true
            }
            None => false,
        }
    }

    /// Release every waiter (shutdown path)
    pub fn cancel_all(&self) {
        let mut pending = self.pending.lock().unwrap();
        for (server, entry) in pending.drain() {
            info!("Cancelling pending authorization for server '{}'", server);
            let _ = entry.waiter.send(Outcome::Cancelled);
        }
    }

    /// Authorization URL for a parked server, if any
    pub fn authorization_url(&self, server: &str) -> Option<String> {
        self.pending
            .lock()
            .unwrap()
            .get(server)
            .map(|entry| entry.authorization_url.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_deliver_wakes_waiter() {
        let rendezvous = Arc::new(OAuthRendezvous::new());
        let waiter = {
            let rendezvous = Arc::clone(&rendezvous);
            tokio::spawn(async move {
                rendezvous
                    .wait_for_code("cloud", "https://as.example/authorize?x=1".to_string(), "st-1".to_string())
                    .await
            })
        };

        // Let the waiter park first
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(
            rendezvous.authorization_url("cloud").as_deref(),
            Some("https://as.example/authorize?x=1")
        );
        rendezvous.deliver("cloud", "abc", "st-1").unwrap();

        let code = waiter.await.unwrap().unwrap();
        assert_eq!(code, "abc");
        assert!(rendezvous.authorization_url("cloud").is_none());
    }

    #[tokio::test]
    async fn test_state_mismatch_keeps_waiter() {
        let rendezvous = Arc::new(OAuthRendezvous::new());
        let waiter = {
            let rendezvous = Arc::clone(&rendezvous);
            tokio::spawn(async move {
                rendezvous
                    .wait_for_code("cloud", "u".to_string(), "expected".to_string())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(rendezvous.deliver("cloud", "abc", "forged").is_err());
        // The genuine callback still succeeds
        rendezvous.deliver("cloud", "abc", "expected").unwrap();
        assert_eq!(waiter.await.unwrap().unwrap(), "abc");
    }

    #[tokio::test]
    async fn test_unknown_server_rejected() {
        let rendezvous = OAuthRendezvous::new();
        let err = rendezvous.deliver("ghost", "c", "s").unwrap_err();
        assert!(err.to_string().contains("unknown_server"));
    }

    #[tokio::test]
    async fn test_cancel_releases_waiter() {
        let rendezvous = Arc::new(OAuthRendezvous::new());
        let waiter = {
            let rendezvous = Arc::clone(&rendezvous);
            tokio::spawn(async move {
                rendezvous
                    .wait_for_code("cloud", "u".to_string(), "s".to_string())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(rendezvous.cancel("cloud"));
        match waiter.await.unwrap() {
            Err(GatewayError::Cancelled) => {}
            other => panic!("expected cancellation, got {:?}", other),
        }
        // Subsequent callbacks are unknown_server
        assert!(rendezvous.deliver("cloud", "c", "s").is_err());
    }
}
