//! Inbound OAuth 2.1 authorization server
//!
//! Dynamic client registration (RFC 7591), authorization code + PKCE flow,
//! token issuance, and bearer verification for agents connecting to the
//! gateway. All artifacts persist through the session store; HTTP wiring
//! lives with the gateway routes.

use crate::auth::pkce;
use crate::auth::session_store::{now_ms, Category, SessionStore};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

/// Registration lifetime when the request does not negotiate one
pub const REGISTRATION_TTL_MS: i64 = 30 * 24 * 60 * 60 * 1000;
/// Authorization request lifetime
pub const AUTH_REQUEST_TTL_MS: i64 = 10 * 60 * 1000;
/// Authorization code lifetime
pub const AUTH_CODE_TTL_MS: i64 = 60 * 1000;
/// Access token lifetime when not configured
pub const DEFAULT_TOKEN_TTL_MS: i64 = 24 * 60 * 60 * 1000;

/// RFC 6749 / 6750 error identifiers with their HTTP status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OAuthErrorKind {
    InvalidRequest,
    InvalidClient,
    InvalidGrant,
    UnauthorizedClient,
    UnsupportedGrantType,
    InvalidScope,
    InvalidToken,
    ServerError,
}

impl OAuthErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OAuthErrorKind::InvalidRequest => "invalid_request",
            OAuthErrorKind::InvalidClient => "invalid_client",
            OAuthErrorKind::InvalidGrant => "invalid_grant",
            OAuthErrorKind::UnauthorizedClient => "unauthorized_client",
            OAuthErrorKind::UnsupportedGrantType => "unsupported_grant_type",
            OAuthErrorKind::InvalidScope => "invalid_scope",
            OAuthErrorKind::InvalidToken => "invalid_token",
            OAuthErrorKind::ServerError => "server_error",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            OAuthErrorKind::InvalidClient | OAuthErrorKind::InvalidToken => 401,
            OAuthErrorKind::ServerError => 500,
            _ => 400,
        }
    }
}

/// Error carried back to the HTTP layer
#[derive(Debug, Clone)]
pub struct OAuthError {
    pub kind: OAuthErrorKind,
    pub description: String,
}

impl OAuthError {
    pub fn new(kind: OAuthErrorKind, description: impl Into<String>) -> Self {
        Self {
            kind,
            description: description.into(),
        }
    }
}

type OAuthResult<T> = std::result::Result<T, OAuthError>;

/// Stored client registration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientRegistration {
    pub client_id: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub client_secret: Option<String>,
    pub redirect_uris: Vec<String>,
    #[serde(default)]
    pub scope: String,
    #[serde(default)]
    pub grant_types: Vec<String>,
    pub token_endpoint_auth_method: String,
}

/// RFC 7591 registration request body (the fields the gateway honors)
#[derive(Debug, Clone, Deserialize)]
pub struct RegistrationRequest {
    #[serde(default)]
    pub redirect_uris: Vec<String>,
    #[serde(default)]
    pub token_endpoint_auth_method: Option<String>,
    #[serde(default)]
    pub grant_types: Option<Vec<String>>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub client_name: Option<String>,
}

/// Registration response returned to the client
#[derive(Debug, Clone, Serialize)]
pub struct RegistrationResponse {
    pub client_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    pub redirect_uris: Vec<String>,
    pub grant_types: Vec<String>,
    pub token_endpoint_auth_method: String,
    pub client_id_issued_at: i64,
    pub client_secret_expires_at: i64,
}

/// Query parameters accepted by `/authorize`
#[derive(Debug, Clone, Deserialize)]
pub struct AuthorizeParams {
    pub client_id: String,
    pub redirect_uri: String,
    pub response_type: String,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub code_challenge: Option<String>,
    #[serde(default)]
    pub code_challenge_method: Option<String>,
    #[serde(default)]
    pub resource: Option<String>,
}

/// Short-lived record bridging `/authorize` and `/consent`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthRequest {
    pub client_id: String,
    pub redirect_uri: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub code_challenge: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub resource: Option<String>,
    pub scopes: Vec<String>,
}

/// Single-use authorization code record
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthCode {
    pub client_id: String,
    pub redirect_uri: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub resource: Option<String>,
    pub scopes: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub code_challenge: Option<String>,
}

/// Stored binding behind an issued bearer token
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessTokenBinding {
    pub client_id: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub resource: Option<String>,
    pub scopes: Vec<String>,
    pub expires_at: i64,
}

/// Form body accepted by `/token`
#[derive(Debug, Clone, Deserialize)]
pub struct TokenParams {
    pub grant_type: String,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub redirect_uri: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub code_verifier: Option<String>,
}

/// Successful `/token` response body
#[derive(Debug, Clone, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: i64,
    pub scope: String,
}

/// Where the user agent goes after `/authorize` or `/consent`
#[derive(Debug, Clone)]
pub struct Redirect {
    pub location: String,
}

/// The inbound authorization server
pub struct AuthorizationServer {
    store: Arc<SessionStore>,
    token_ttl_ms: i64,
}

impl AuthorizationServer {
    pub fn new(store: Arc<SessionStore>) -> Self {
        Self::with_token_ttl(store, DEFAULT_TOKEN_TTL_MS)
    }

    pub fn with_token_ttl(store: Arc<SessionStore>, token_ttl_ms: i64) -> Self {
        Self {
            store,
            token_ttl_ms,
        }
    }

    /// Register a client (RFC 7591). A secret is issued unless the client
    /// asked for `token_endpoint_auth_method = none`.
    pub fn register(&self, request: RegistrationRequest) -> OAuthResult<RegistrationResponse> {
        if request.redirect_uris.is_empty() {
            return Err(OAuthError::new(
                OAuthErrorKind::InvalidRequest,
                "redirect_uris is required",
            ));
        }
        for uri in &request.redirect_uris {
            url::Url::parse(uri).map_err(|_| {
                OAuthError::new(
                    OAuthErrorKind::InvalidRequest,
                    format!("invalid redirect_uri '{}'", uri),
                )
            })?;
        }

        let auth_method = request
            .token_endpoint_auth_method
            .unwrap_or_else(|| "client_secret_basic".to_string());
        let client_id = pkce::random_urlsafe(16);
        let client_secret = if auth_method == "none" {
            None
        } else {
            Some(pkce::random_urlsafe(32))
        };

        let registration = ClientRegistration {
            client_id: client_id.clone(),
            client_secret: client_secret.clone(),
            redirect_uris: request.redirect_uris.clone(),
            scope: request.scope.unwrap_or_default(),
            grant_types: request
                .grant_types
                .unwrap_or_else(|| vec!["authorization_code".to_string()]),
            token_endpoint_auth_method: auth_method.clone(),
        };
        self.store
            .put(Category::Session, &client_id, &registration, REGISTRATION_TTL_MS)
            .map_err(|e| OAuthError::new(OAuthErrorKind::ServerError, e.to_string()))?;

        let now = now_ms();
        info!(
            "Registered OAuth client '{}' ({})",
            client_id,
            request.client_name.as_deref().unwrap_or("unnamed")
        );
        Ok(RegistrationResponse {
            client_id,
            client_secret,
            redirect_uris: registration.redirect_uris,
            grant_types: registration.grant_types,
            token_endpoint_auth_method: auth_method,
            client_id_issued_at: now / 1000,
            client_secret_expires_at: (now + REGISTRATION_TTL_MS) / 1000,
        })
    }

    /// Validate an `/authorize` request and park it for consent. Returns the
    /// auth request id the consent page is parameterized by.
    pub fn begin_authorization(&self, params: AuthorizeParams) -> OAuthResult<String> {
        let registration = self.load_registration(&params.client_id)?;

        if !registration.redirect_uris.contains(&params.redirect_uri) {
            return Err(OAuthError::new(
                OAuthErrorKind::InvalidRequest,
                "redirect_uri is not registered for this client",
            ));
        }
        if params.response_type != "code" {
            return Err(OAuthError::new(
                OAuthErrorKind::UnsupportedGrantType,
                format!("unsupported response_type '{}'", params.response_type),
            ));
        }
        if params.code_challenge.is_some() {
            match params.code_challenge_method.as_deref() {
                Some("S256") => {}
                other => {
                    return Err(OAuthError::new(
                        OAuthErrorKind::InvalidRequest,
                        format!("unsupported code_challenge_method {:?}", other),
                    ))
                }
            }
        }

        let scopes: Vec<String> = params
            .scope
            .as_deref()
            .unwrap_or_default()
            .split_whitespace()
            .map(str::to_string)
            .collect();

        let auth_request_id = pkce::random_urlsafe(16);
        let record = AuthRequest {
            client_id: params.client_id.clone(),
            redirect_uri: params.redirect_uri,
            code_challenge: params.code_challenge,
            state: params.state,
            resource: params.resource,
            scopes,
        };
        self.store
            .put(Category::AuthRequest, &auth_request_id, &record, AUTH_REQUEST_TTL_MS)
            .map_err(|e| OAuthError::new(OAuthErrorKind::ServerError, e.to_string()))?;

        info!(
            "Authorization request {} opened for client '{}'",
            auth_request_id, params.client_id
        );
        Ok(auth_request_id)
    }

    /// Look up a parked authorization request for the consent page
    pub fn auth_request(&self, auth_request_id: &str) -> OAuthResult<AuthRequest> {
        let (record, meta) = self
            .store
            .get::<AuthRequest>(Category::AuthRequest, auth_request_id)
            .ok_or_else(|| {
                OAuthError::new(OAuthErrorKind::InvalidRequest, "unknown authorization request")
            })?;
        if meta.is_expired() {
            return Err(OAuthError::new(
                OAuthErrorKind::InvalidRequest,
                "authorization request expired",
            ));
        }
        Ok(record)
    }

    /// Complete consent. Approved: mint a code bound to the granted scopes
    /// and redirect back to the client. Denied: redirect with
    /// `error=access_denied`. Either way the auth request is consumed.
    pub fn consent(
        &self,
        auth_request_id: &str,
        approved: bool,
        granted_scopes: Vec<String>,
    ) -> OAuthResult<Redirect> {
        let request = self.auth_request(auth_request_id)?;
        let _ = self.store.delete(Category::AuthRequest, auth_request_id);

        if !approved {
            info!(
                "Consent denied for client '{}' (request {})",
                request.client_id, auth_request_id
            );
            return Ok(Redirect {
                location: append_query(
                    &request.redirect_uri,
                    &[
                        ("error", Some("access_denied")),
                        ("state", request.state.as_deref()),
                    ],
                ),
            });
        }

        for scope in &granted_scopes {
            if !request.scopes.contains(scope) {
                return Err(OAuthError::new(
                    OAuthErrorKind::InvalidScope,
                    format!("scope '{}' was not requested", scope),
                ));
            }
        }

        let code = pkce::random_urlsafe(24);
        let record = AuthCode {
            client_id: request.client_id.clone(),
            redirect_uri: request.redirect_uri.clone(),
            resource: request.resource.clone(),
            scopes: granted_scopes.clone(),
            code_challenge: request.code_challenge.clone(),
        };
        self.store
            .put(Category::AuthCode, &code, &record, AUTH_CODE_TTL_MS)
            .map_err(|e| OAuthError::new(OAuthErrorKind::ServerError, e.to_string()))?;

        info!(
            "Consent approved for client '{}' with scopes {:?} (request {})",
            request.client_id, granted_scopes, auth_request_id
        );
        Ok(Redirect {
            location: append_query(
                &request.redirect_uri,
                &[
                    ("code", Some(code.as_str())),
                    ("state", request.state.as_deref()),
                ],
            ),
        })
    }

    /// Exchange an authorization code for a bearer token. The code is
    /// consumed whether or not the exchange succeeds.
    pub fn exchange_token(&self, params: TokenParams) -> OAuthResult<TokenResponse> {
        if params.grant_type != "authorization_code" {
            return Err(OAuthError::new(
                OAuthErrorKind::UnsupportedGrantType,
                format!("unsupported grant_type '{}'", params.grant_type),
            ));
        }
        let code = params.code.as_deref().ok_or_else(|| {
            OAuthError::new(OAuthErrorKind::InvalidRequest, "code is required")
        })?;

        let read = self.store.get::<AuthCode>(Category::AuthCode, code);
        // Claim the code before validating anything: the delete is the
        // single-use gate under concurrent exchanges
        let claimed = self.store.delete(Category::AuthCode, code).unwrap_or(false);
        let (record, meta) = match read {
            Some(found) if claimed => found,
            _ => {
                warn!("Token exchange with unknown or already-used code");
                return Err(OAuthError::new(
                    OAuthErrorKind::InvalidGrant,
                    "authorization code is invalid or already used",
                ));
            }
        };

        if meta.is_expired() {
            return Err(OAuthError::new(
                OAuthErrorKind::InvalidGrant,
                "authorization code expired",
            ));
        }
        if params.client_id.as_deref() != Some(record.client_id.as_str()) {
            return Err(OAuthError::new(
                OAuthErrorKind::InvalidClient,
                "client_id does not match the authorization code",
            ));
        }
        if params.redirect_uri.as_deref() != Some(record.redirect_uri.as_str()) {
            return Err(OAuthError::new(
                OAuthErrorKind::InvalidGrant,
                "redirect_uri does not match the authorization code",
            ));
        }
        if let Some(challenge) = &record.code_challenge {
            let verifier = params.code_verifier.as_deref().ok_or_else(|| {
                OAuthError::new(OAuthErrorKind::InvalidRequest, "code_verifier is required")
            })?;
            if !pkce::verify_s256(verifier, challenge) {
                return Err(OAuthError::new(
                    OAuthErrorKind::InvalidGrant,
                    "code_verifier does not match the challenge",
                ));
            }
        }

        let token = pkce::random_urlsafe(32);
        let binding = AccessTokenBinding {
            client_id: record.client_id.clone(),
            resource: record.resource.clone(),
            scopes: record.scopes.clone(),
            expires_at: now_ms() + self.token_ttl_ms,
        };
        self.store
            .put(Category::Session, &token, &binding, self.token_ttl_ms)
            .map_err(|e| OAuthError::new(OAuthErrorKind::ServerError, e.to_string()))?;

        info!(
            "Issued access token to client '{}' with scopes {:?}",
            record.client_id, record.scopes
        );
        Ok(TokenResponse {
            access_token: token,
            token_type: "Bearer".to_string(),
            expires_in: self.token_ttl_ms / 1000,
            scope: record.scopes.join(" "),
        })
    }

    /// Resolve a bearer token to its binding
    pub fn verify(&self, bearer: &str) -> OAuthResult<AccessTokenBinding> {
        let (binding, meta) = self
            .store
            .get::<AccessTokenBinding>(Category::Session, bearer)
            .ok_or_else(|| OAuthError::new(OAuthErrorKind::InvalidToken, "unknown token"))?;
        if meta.is_expired() || binding.expires_at < now_ms() {
            return Err(OAuthError::new(OAuthErrorKind::InvalidToken, "token expired"));
        }
        Ok(binding)
    }

    fn load_registration(&self, client_id: &str) -> OAuthResult<ClientRegistration> {
        let (registration, meta) = self
            .store
            .get::<ClientRegistration>(Category::Session, client_id)
            .ok_or_else(|| OAuthError::new(OAuthErrorKind::InvalidClient, "unknown client"))?;
        if meta.is_expired() {
            return Err(OAuthError::new(
                OAuthErrorKind::InvalidClient,
                "client registration expired",
            ));
        }
        Ok(registration)
    }
}

/// Append query parameters to a redirect URI, preserving existing ones
fn append_query(uri: &str, params: &[(&str, Option<&str>)]) -> String {
    let mut result = uri.to_string();
    let mut separator = if uri.contains('?') { '&' } else { '?' };
    for (key, value) in params {
        if let Some(value) = value {
            result.push(separator);
            result.push_str(key);
            result.push('=');
            result.push_str(&urlencoding::encode(value));
            separator = '&';
        }
    }
    result
}
