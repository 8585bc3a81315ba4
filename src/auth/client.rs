//! Outbound OAuth 2.1 client
//!
//! Drives the authorization-code + PKCE dance against outbound MCP servers
//! that demand it. Client registrations and tokens persist through the
//! session store so restarts pick up where they left off; the authorization
//! code itself arrives through the [`OAuthRendezvous`]. State machine:
//! Unregistered -> Registered -> AwaitingAuth -> Tokenized -> Refreshing.

use crate::auth::pkce;
use crate::auth::rendezvous::OAuthRendezvous;
use crate::auth::session_store::{now_ms, Category, SessionStore};
use crate::config::OAuthSpec;
use crate::error::{GatewayError, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// TTL for persisted client registrations
pub const CLIENT_INFO_TTL_MS: i64 = 30 * 24 * 60 * 60 * 1000;
/// Fallback token TTL when the AS omits `expires_in`
pub const DEFAULT_TOKEN_TTL_MS: i64 = 60 * 60 * 1000;
/// TTL for PKCE verifiers and CSRF state
pub const HANDSHAKE_TTL_MS: i64 = 10 * 60 * 1000;
/// Refresh this far before the recorded expiry
const EXPIRY_MARGIN_MS: i64 = 30 * 1000;

/// Persisted dynamic-registration result (RFC 7591)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientInfo {
    pub client_id: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub client_secret: Option<String>,
}

/// Persisted token bundle for one outbound server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredTokens {
    pub access_token: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub refresh_token: Option<String>,
    /// Epoch ms; `None` when the AS issued no `expires_in`
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub expires_at: Option<i64>,
}

impl StoredTokens {
    /// Token still usable (with a refresh margin)? `expires_in` wins over the
    /// store's own TTL when present.
    pub fn is_fresh(&self) -> bool {
        match self.expires_at {
            Some(expires_at) => now_ms() + EXPIRY_MARGIN_MS < expires_at,
            None => true,
        }
    }
}

/// Authorization-server metadata (RFC 8414 subset)
#[derive(Debug, Clone, Deserialize)]
struct AsMetadata {
    authorization_endpoint: String,
    token_endpoint: String,
    #[serde(default)]
    registration_endpoint: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenEndpointResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct RegistrationEndpointResponse {
    client_id: String,
    #[serde(default)]
    client_secret: Option<String>,
}

/// OAuth client bound to one outbound server
pub struct OutboundOAuthClient {
    server_name: String,
    /// Base URL of the outbound MCP server, used for metadata discovery
    server_url: String,
    spec: OAuthSpec,
    redirect_url: String,
    store: Arc<SessionStore>,
    rendezvous: Arc<OAuthRendezvous>,
    http: reqwest::Client,
    /// Coalesces concurrent refresh attempts into one
    refresh_lock: Mutex<()>,
}

impl OutboundOAuthClient {
    pub fn new(
        server_name: String,
        server_url: String,
        spec: OAuthSpec,
        redirect_url: String,
        store: Arc<SessionStore>,
        rendezvous: Arc<OAuthRendezvous>,
    ) -> Self {
        Self {
            server_name,
            server_url,
            spec,
            redirect_url,
            store,
            rendezvous,
            http: reqwest::Client::new(),
            refresh_lock: Mutex::new(()),
        }
    }

    /// Current access token, if one is persisted and fresh
    pub fn access_token(&self) -> Option<String> {
        let (tokens, meta) = self
            .store
            .get::<StoredTokens>(Category::Tokens, &self.server_name)?;
        if tokens.is_fresh() && !meta.is_expired() {
            Some(tokens.access_token)
        } else {
            None
        }
    }

    /// Attach the current bearer token to an outgoing request
    pub fn attach_auth(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.access_token() {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// Produce a usable access token, walking as much of the state machine as
    /// needed: cached token, then refresh, then the full authorization dance.
    pub async fn ensure_token(&self) -> Result<String> {
        if let Some(token) = self.access_token() {
            return Ok(token);
        }
        match self.refresh().await {
            Ok(token) => Ok(token),
            Err(e) => {
                debug!(
                    "Refresh unavailable for server '{}' ({}); starting authorization",
                    self.server_name, e
                );
                self.authorize().await
            }
        }
    }

    /// Refresh the access token. Concurrent callers coalesce: whoever loses
    /// the lock race re-checks the store and returns the fresh token.
    pub async fn refresh(&self) -> Result<String> {
        let _guard = self.refresh_lock.lock().await;
        if let Some(token) = self.access_token() {
            return Ok(token);
        }

        let (tokens, _) = self
            .store
            .get::<StoredTokens>(Category::Tokens, &self.server_name)
            .ok_or_else(|| GatewayError::auth("no persisted tokens to refresh"))?;
        let refresh_token = tokens
            .refresh_token
            .ok_or_else(|| GatewayError::auth("no refresh token issued"))?;

        let metadata = self.discover().await?;
        let client = self.ensure_client_info(&metadata).await?;

        let mut form = vec![
            ("grant_type", "refresh_token".to_string()),
            ("refresh_token", refresh_token),
            ("client_id", client.client_id.clone()),
        ];
        if let Some(secret) = &client.client_secret {
            form.push(("client_secret", secret.clone()));
        }

        debug!("Refreshing token for server '{}'", self.server_name);
        let response = self
            .http
            .post(&metadata.token_endpoint)
            .form(&form)
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            return Err(GatewayError::auth(format!(
                "token refresh for server '{}' failed with status {}",
                self.server_name, status
            )));
        }
        let issued: TokenEndpointResponse = response.json().await?;
        self.persist_tokens(issued)
    }

    /// Run the full authorization-code dance; blocks on the rendezvous until
    /// the callback delivers a code or the wait times out.
    pub async fn authorize(&self) -> Result<String> {
        let metadata = self.discover().await?;
        let client = self.ensure_client_info(&metadata).await?;

        let verifier = pkce::generate_verifier();
        let state = pkce::random_urlsafe(16);
        self.store.put(
            Category::Verifier,
            &self.server_name,
            &serde_json::json!({ "verifier": verifier }),
            HANDSHAKE_TTL_MS,
        )?;
        self.store.put(
            Category::State,
            &self.server_name,
            &serde_json::json!({ "state": state }),
            HANDSHAKE_TTL_MS,
        )?;

        let mut authorize_url = url::Url::parse(&metadata.authorization_endpoint)
            .map_err(|e| GatewayError::auth(format!("invalid authorization endpoint: {}", e)))?;
        authorize_url
            .query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &client.client_id)
            .append_pair("redirect_uri", &self.redirect_url)
            .append_pair("code_challenge", &pkce::challenge_s256(&verifier))
            .append_pair("code_challenge_method", "S256")
            .append_pair("state", &state);
        if !self.spec.scopes.is_empty() {
            authorize_url
                .query_pairs_mut()
                .append_pair("scope", &self.spec.scopes.join(" "));
        }

        let code = self
            .rendezvous
            .wait_for_code(&self.server_name, authorize_url.to_string(), state)
            .await?;

        let mut form = vec![
            ("grant_type", "authorization_code".to_string()),
            ("code", code),
            ("redirect_uri", self.redirect_url.clone()),
            ("client_id", client.client_id.clone()),
            ("code_verifier", verifier),
        ];
        if let Some(secret) = &client.client_secret {
            form.push(("client_secret", secret.clone()));
        }

        let response = self
            .http
            .post(&metadata.token_endpoint)
            .form(&form)
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            return Err(GatewayError::auth(format!(
                "code exchange for server '{}' failed with status {}",
                self.server_name, status
            )));
        }
        let issued: TokenEndpointResponse = response.json().await?;

        let _ = self.store.delete(Category::Verifier, &self.server_name);
        let _ = self.store.delete(Category::State, &self.server_name);
        info!("Server '{}' authorized", self.server_name);
        self.persist_tokens(issued)
    }

    /// Drop persisted tokens (e.g. after a hard 401 on a fresh token)
    pub fn forget_tokens(&self) {
        let _ = self.store.delete(Category::Tokens, &self.server_name);
    }

    fn persist_tokens(&self, issued: TokenEndpointResponse) -> Result<String> {
        // expires_in wins when present; otherwise the store TTL is the only bound
        let ttl_ms = issued
            .expires_in
            .map(|s| s * 1000)
            .unwrap_or(DEFAULT_TOKEN_TTL_MS);
        let tokens = StoredTokens {
            access_token: issued.access_token.clone(),
            refresh_token: issued.refresh_token,
            expires_at: issued.expires_in.map(|s| now_ms() + s * 1000),
        };
        self.store
            .put(Category::Tokens, &self.server_name, &tokens, ttl_ms)?;
        Ok(issued.access_token)
    }

    /// Load or dynamically register the client against the AS
    async fn ensure_client_info(&self, metadata: &AsMetadata) -> Result<ClientInfo> {
        if let (Some(client_id), secret) = (self.spec.client_id.clone(), self.spec.client_secret.clone()) {
            return Ok(ClientInfo {
                client_id,
                client_secret: secret,
            });
        }
        if let Some((info, meta)) = self.store.get::<ClientInfo>(Category::Client, &self.server_name) {
            if !meta.is_expired() {
                return Ok(info);
            }
        }

        let registration_endpoint = metadata.registration_endpoint.clone().ok_or_else(|| {
            GatewayError::auth(format!(
                "server '{}' requires OAuth but offers no registration endpoint and no clientId is configured",
                self.server_name
            ))
        })?;

        debug!("Registering OAuth client for server '{}'", self.server_name);
        let response = self
            .http
            .post(&registration_endpoint)
            .json(&serde_json::json!({
                "client_name": format!("1mcp gateway ({})", self.server_name),
                "redirect_uris": [self.redirect_url],
                "grant_types": ["authorization_code", "refresh_token"],
                "token_endpoint_auth_method": "none",
            }))
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            return Err(GatewayError::auth(format!(
                "dynamic registration for server '{}' failed with status {}",
                self.server_name, status
            )));
        }
        let registered: RegistrationEndpointResponse = response.json().await?;
        let info = ClientInfo {
            client_id: registered.client_id,
            client_secret: registered.client_secret,
        };
        self.store
            .put(Category::Client, &self.server_name, &info, CLIENT_INFO_TTL_MS)?;
        Ok(info)
    }

    /// Fetch AS metadata from the well-known location, falling back to the
    /// conventional endpoint paths on the server origin.
    async fn discover(&self) -> Result<AsMetadata> {
        let base = url::Url::parse(&self.server_url)
            .map_err(|e| GatewayError::auth(format!("invalid server url: {}", e)))?;
        let origin = format!(
            "{}://{}",
            base.scheme(),
            base.host_str()
                .map(|h| match base.port() {
                    Some(port) => format!("{}:{}", h, port),
                    None => h.to_string(),
                })
                .unwrap_or_default()
        );

        let well_known = format!("{}/.well-known/oauth-authorization-server", origin);
        match self.http.get(&well_known).send().await {
            Ok(response) if response.status().is_success() => {
                match response.json::<AsMetadata>().await {
                    Ok(metadata) => return Ok(metadata),
                    Err(e) => warn!(
                        "Malformed AS metadata from '{}' for server '{}': {}",
                        well_known, self.server_name, e
                    ),
                }
            }
            Ok(response) => debug!(
                "No AS metadata at '{}' (status {}); using conventional endpoints",
                well_known,
                response.status()
            ),
            Err(e) => debug!(
                "AS metadata fetch failed for server '{}': {}; using conventional endpoints",
                self.server_name, e
            ),
        }

        Ok(AsMetadata {
            authorization_endpoint: format!("{}/authorize", origin),
            token_endpoint: format!("{}/token", origin),
            registration_endpoint: Some(format!("{}/register", origin)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn harness(server_url: &str) -> (tempfile::TempDir, Arc<OAuthRendezvous>, OutboundOAuthClient) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SessionStore::new(dir.path().to_path_buf()).unwrap());
        let rendezvous = Arc::new(OAuthRendezvous::new());
        let client = OutboundOAuthClient::new(
            "cloud".to_string(),
            server_url.to_string(),
            OAuthSpec {
                client_id: None,
                client_secret: None,
                scopes: vec!["mcp.read".to_string()],
                redirect_url: None,
            },
            "http://127.0.0.1:3050/oauth/callback/cloud".to_string(),
            store,
            Arc::clone(&rendezvous),
        );
        (dir, rendezvous, client)
    }

    #[tokio::test]
    async fn test_full_authorization_dance() {
        let mock = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/.well-known/oauth-authorization-server"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&mock)
            .await;
        Mock::given(method("POST"))
            .and(path("/register"))
            .respond_with(
                ResponseTemplate::new(201)
                    .set_body_json(serde_json::json!({"client_id": "dyn-1"})),
            )
            .mount(&mock)
            .await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=authorization_code"))
            .and(body_string_contains("code=the-code"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "at-1",
                "refresh_token": "rt-1",
                "expires_in": 3600
            })))
            .mount(&mock)
            .await;

        let (_dir, rendezvous, client) = harness(&mock.uri());

        let authorize = tokio::spawn(async move { client.authorize().await.map(|t| (t, client)) });

        // Wait for the waiter to park, then play the human side of the dance
        let mut authorization_url = None;
        for _ in 0..50 {
            if let Some(url) = rendezvous.authorization_url("cloud") {
                authorization_url = Some(url);
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let authorization_url = authorization_url.expect("authorization URL surfaced");
        assert!(authorization_url.contains("code_challenge_method=S256"));
        assert!(authorization_url.contains("client_id=dyn-1"));

        let state = url::Url::parse(&authorization_url)
            .unwrap()
            .query_pairs()
            .find(|(k, _)| k == "state")
            .map(|(_, v)| v.into_owned())
            .unwrap();
        rendezvous.deliver("cloud", "the-code", &state).unwrap();

        let (token, client) = authorize.await.unwrap().unwrap();
        assert_eq!(token, "at-1");
        // Token persisted and considered fresh
        assert_eq!(client.access_token().as_deref(), Some("at-1"));
    }

    #[tokio::test]
    async fn test_refresh_uses_refresh_token_grant() {
        let mock = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/.well-known/oauth-authorization-server"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "authorization_endpoint": format!("{}/authorize", mock.uri()),
                "token_endpoint": format!("{}/token", mock.uri()),
            })))
            .mount(&mock)
            .await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .and(body_string_contains("refresh_token=rt-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "at-2",
                "expires_in": 60
            })))
            .mount(&mock)
            .await;

        let (_dir, _rendezvous, client) = harness(&mock.uri());
        // Seed an expired token bundle with a refresh token; clientId comes
        // from the spec so no registration round-trip is needed
        let client = OutboundOAuthClient {
            spec: OAuthSpec {
                client_id: Some("static-client".to_string()),
                client_secret: None,
                scopes: vec![],
                redirect_url: None,
            },
            ..client
        };
        client
            .store
            .put(
                Category::Tokens,
                "cloud",
                &StoredTokens {
                    access_token: "at-1".to_string(),
                    refresh_token: Some("rt-1".to_string()),
                    expires_at: Some(now_ms() - 1_000),
                },
                DEFAULT_TOKEN_TTL_MS,
            )
            .unwrap();

        assert!(client.access_token().is_none(), "expired token is not offered");
        let token = client.refresh().await.unwrap();
        assert_eq!(token, "at-2");
        assert_eq!(client.access_token().as_deref(), Some("at-2"));
    }

    #[tokio::test]
    async fn test_refresh_without_refresh_token_fails() {
        let mock = MockServer::start().await;
        let (_dir, _rendezvous, client) = harness(&mock.uri());
        assert!(client.refresh().await.is_err());
    }
}
