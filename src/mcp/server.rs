//! Inbound gateway surface
//!
//! The actix-web front end: streamable MCP endpoint, legacy SSE pairing,
//! inbound authorization-server routes, the outbound OAuth callback, and a
//! health snapshot. Also hosts the stdio inbound runner for `--transport
//! stdio`. Every MCP envelope funnels into the session manager's dispatch.

use crate::auth::server::{AuthorizeParams, RegistrationRequest, TokenParams};
use crate::auth::OAuthError;
use crate::error::Result;
use crate::gateway::Gateway;
use crate::mcp::session::{SessionQuery, STDIO_SESSION_ID};
use actix_web::http::header;
use actix_web::{web, App, HttpRequest, HttpResponse, HttpServer};
use futures_util::StreamExt;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info, warn};

/// Session id header used by the streamable transport
const SESSION_HEADER: &str = "Mcp-Session-Id";

/// Install the gateway's route table on an actix app
pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health_check))
        // Streamable MCP endpoint
        .route("/", web::post().to(streamable_post))
        .route("/", web::get().to(streamable_get))
        // Legacy SSE pairing
        .route("/sse", web::get().to(sse_open))
        .route("/messages", web::post().to(legacy_messages))
        // Outbound OAuth rendezvous callback
        .route("/oauth/callback/{server}", web::get().to(oauth_callback))
        .route("/oauth/completed", web::get().to(oauth_completed))
        // Inbound authorization server
        .route("/register", web::post().to(as_register))
        .route("/authorize", web::get().to(as_authorize))
        .route("/consent", web::get().to(as_consent_page))
        .route("/consent", web::post().to(as_consent_submit))
        .route("/token", web::post().to(as_token));
}

/// Run the HTTP gateway until the process is told to stop
pub async fn serve_http(gateway: Arc<Gateway>) -> Result<()> {
    let host = gateway.options.host.clone();
    let port = gateway.options.port;
    info!("Gateway listening on {}:{}", host, port);

    let data = web::Data::new(Arc::clone(&gateway));
    HttpServer::new(move || App::new().app_data(data.clone()).configure(configure_routes))
        .bind((host, port))?
        .run()
        .await?;
    Ok(())
}

/// Drive a single inbound session over the process's own stdin/stdout
pub async fn run_stdio_inbound(gateway: Arc<Gateway>, query: SessionQuery) -> Result<()> {
    let session_id = gateway
        .sessions
        .create_session(Some(STDIO_SESSION_ID.to_string()), &query)
        .await?;
    let mut outbox = gateway
        .sessions
        .take_outbox(&session_id)
        .await
        .expect("fresh session has an outbox");

    // Writer task: everything leaving the gateway shares stdout
    let (write_tx, mut write_rx) = tokio::sync::mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(line) = write_rx.recv().await {
            if stdout.write_all(line.as_bytes()).await.is_err() {
                return;
            }
            if stdout.write_all(b"\n").await.is_err() {
                return;
            }
            let _ = stdout.flush().await;
        }
    });

    // Bridged notifications
    {
        let write_tx = write_tx.clone();
        tokio::spawn(async move {
            while let Some(envelope) = outbox.recv().await {
                if let Ok(line) = serde_json::to_string(&envelope) {
                    if write_tx.send(line).is_err() {
                        return;
                    }
                }
            }
        });
    }

    info!("Serving MCP over stdio (session '{}')", session_id);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }
        let envelope: Value = match serde_json::from_str(&line) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Dropping unparseable inbound line: {}", e);
                continue;
            }
        };
        if let Some(response) = gateway.sessions.handle_envelope(&session_id, envelope).await {
            match serde_json::to_string(&response) {
                Ok(line) => {
                    if write_tx.send(line).is_err() {
                        break;
                    }
                }
                Err(e) => error!("Failed to serialize response: {}", e),
            }
        }
    }

    gateway.sessions.remove_session(&session_id).await;
    drop(write_tx);
    let _ = writer.await;
    Ok(())
}

/// Removes the session when the inbound streaming connection drops
struct SessionGuard {
    gateway: Arc<Gateway>,
    session_id: String,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let gateway = Arc::clone(&self.gateway);
        let session_id = self.session_id.clone();
        tokio::spawn(async move {
            gateway.sessions.remove_session(&session_id).await;
        });
    }
}

/// Bearer enforcement for the MCP endpoints when inbound auth is on
async fn check_bearer(gateway: &Gateway, request: &HttpRequest) -> std::result::Result<(), HttpResponse> {
    if !gateway.options.auth_enabled {
        return Ok(());
    }
    let token = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));
    let Some(token) = token else {
        return Err(unauthorized("missing bearer token"));
    };
    match gateway.auth_server.verify(token) {
        Ok(_) => Ok(()),
        Err(e) => Err(unauthorized(&e.description)),
    }
}

fn unauthorized(description: &str) -> HttpResponse {
    HttpResponse::Unauthorized()
        .insert_header((
            header::WWW_AUTHENTICATE,
            format!("Bearer error=\"invalid_token\", error_description=\"{}\"", description),
        ))
        .json(json!({ "error": "invalid_token", "error_description": description }))
}

async fn health_check(gateway: web::Data<Arc<Gateway>>) -> HttpResponse {
    let connections = gateway.manager.get_all().await;
    let servers: serde_json::Map<String, Value> = connections
        .into_iter()
        .map(|(name, connection)| {
            (
                name,
                json!({
                    "status": connection.status,
                    "restartCount": connection.restart_count,
                    "lastError": connection.last_error,
                    "lastConnectedAt": connection.last_connected_at,
                }),
            )
        })
        .collect();
    HttpResponse::Ok().json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "sessions": gateway.sessions.session_count().await,
        "servers": servers,
    }))
}

async fn streamable_post(
    gateway: web::Data<Arc<Gateway>>,
    request: HttpRequest,
    query: web::Query<SessionQuery>,
    body: web::Json<Value>,
) -> HttpResponse {
    if let Err(response) = check_bearer(&gateway, &request).await {
        return response;
    }

    let envelope = body.into_inner();
    let header_session = request
        .headers()
        .get(SESSION_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);

    let (session_id, minted) = match header_session {
        Some(session_id) => {
            if !gateway.sessions.has_session(&session_id).await {
                return HttpResponse::NotFound()
                    .json(json!({ "error": format!("unknown session '{}'", session_id) }));
            }
            (session_id, false)
        }
        None => {
            // Only an initialize may open a session
            if envelope.get("method").and_then(Value::as_str) != Some("initialize") {
                return HttpResponse::BadRequest().json(json!({
                    "error": "missing Mcp-Session-Id; open a session with initialize first"
                }));
            }
            match gateway.sessions.create_session(None, &query).await {
                Ok(session_id) => (session_id, true),
                Err(e) => {
                    return HttpResponse::BadRequest().json(json!({ "error": e.to_string() }))
                }
            }
        }
    };

    match gateway.sessions.handle_envelope(&session_id, envelope).await {
        Some(response) => {
            let mut builder = HttpResponse::Ok();
            if minted {
                builder.insert_header((SESSION_HEADER, session_id));
            }
            builder.json(response)
        }
        None => HttpResponse::Accepted().finish(),
    }
}

async fn streamable_get(
    gateway: web::Data<Arc<Gateway>>,
    request: HttpRequest,
    query: web::Query<SessionQuery>,
) -> HttpResponse {
    if let Err(response) = check_bearer(&gateway, &request).await {
        return response;
    }
    // An existing session attaches by header; otherwise the query parameters
    // open a fresh one whose id rides back on the response
    let session_id = match request
        .headers()
        .get(SESSION_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
    {
        Some(session_id) => session_id,
        None => match gateway.sessions.create_session(None, &query).await {
            Ok(session_id) => session_id,
            Err(e) => return HttpResponse::BadRequest().json(json!({ "error": e.to_string() })),
        },
    };
    let Some(outbox) = gateway.sessions.take_outbox(&session_id).await else {
        return HttpResponse::NotFound()
            .json(json!({ "error": format!("no claimable stream for session '{}'", session_id) }));
    };

    let guard = SessionGuard {
        gateway: Arc::clone(&gateway),
        session_id: session_id.clone(),
    };
    let stream = UnboundedReceiverStream::new(outbox).map(move |envelope| {
        let _keepalive = &guard;
        Ok::<_, actix_web::Error>(web::Bytes::from(format!(
            "event: message\ndata: {}\n\n",
            envelope
        )))
    });
    HttpResponse::Ok()
        .insert_header((header::CONTENT_TYPE, "text/event-stream"))
        .insert_header((header::CACHE_CONTROL, "no-cache"))
        .insert_header((SESSION_HEADER, session_id))
        .streaming(stream)
}

async fn sse_open(
    gateway: web::Data<Arc<Gateway>>,
    request: HttpRequest,
    query: web::Query<SessionQuery>,
) -> HttpResponse {
    if let Err(response) = check_bearer(&gateway, &request).await {
        return response;
    }
    let session_id = match gateway.sessions.create_session(None, &query).await {
        Ok(session_id) => session_id,
        Err(e) => return HttpResponse::BadRequest().json(json!({ "error": e.to_string() })),
    };
    let outbox = gateway
        .sessions
        .take_outbox(&session_id)
        .await
        .expect("fresh session has an outbox");

    info!("SSE session '{}' opened (deprecated transport)", session_id);
    let endpoint_frame = web::Bytes::from(format!(
        "event: endpoint\ndata: /messages?sessionId={}\n\n",
        session_id
    ));
    let guard = SessionGuard {
        gateway: Arc::clone(&gateway),
        session_id,
    };
    let messages = UnboundedReceiverStream::new(outbox).map(move |envelope| {
        let _keepalive = &guard;
        Ok::<_, actix_web::Error>(web::Bytes::from(format!(
            "event: message\ndata: {}\n\n",
            envelope
        )))
    });
    let stream = futures_util::stream::iter(vec![Ok::<_, actix_web::Error>(endpoint_frame)])
        .chain(messages);

    HttpResponse::Ok()
        .insert_header((header::CONTENT_TYPE, "text/event-stream"))
        .insert_header((header::CACHE_CONTROL, "no-cache"))
        .streaming(stream)
}

#[derive(serde::Deserialize)]
struct MessagesQuery {
    #[serde(rename = "sessionId")]
    session_id: String,
}

async fn legacy_messages(
    gateway: web::Data<Arc<Gateway>>,
    request: HttpRequest,
    query: web::Query<MessagesQuery>,
    body: web::Json<Value>,
) -> HttpResponse {
    if let Err(response) = check_bearer(&gateway, &request).await {
        return response;
    }
    let session_id = query.into_inner().session_id;
    if !gateway.sessions.has_session(&session_id).await {
        return HttpResponse::NotFound()
            .json(json!({ "error": format!("unknown session '{}'", session_id) }));
    }

    // Responses ride the SSE stream, matching the legacy pairing
    if let Some(response) = gateway
        .sessions
        .handle_envelope(&session_id, body.into_inner())
        .await
    {
        match serde_json::to_value(&response) {
            Ok(envelope) => {
                if let Err(e) = gateway.sessions.push_to_outbox(&session_id, envelope).await {
                    warn!("Failed to queue response for session '{}': {}", session_id, e);
                }
            }
            Err(e) => error!("Failed to serialize response: {}", e),
        }
    }
    HttpResponse::Accepted().finish()
}

#[derive(serde::Deserialize)]
struct CallbackQuery {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

async fn oauth_callback(
    gateway: web::Data<Arc<Gateway>>,
    path: web::Path<String>,
    query: web::Query<CallbackQuery>,
) -> HttpResponse {
    let server = path.into_inner();
    let query = query.into_inner();

    if let Some(error) = query.error {
        warn!("OAuth callback for server '{}' carried an error: {}", server, error);
        gateway.rendezvous.cancel(&server);
        return HttpResponse::BadRequest()
            .json(json!({ "error": error, "server": server }));
    }
    let (Some(code), Some(state)) = (query.code, query.state) else {
        return HttpResponse::BadRequest()
            .json(json!({ "error": "callback requires code and state" }));
    };

    match gateway.rendezvous.deliver(&server, &code, &state) {
        Ok(()) => HttpResponse::Found()
            .insert_header((header::LOCATION, "/oauth/completed"))
            .finish(),
        Err(e) => {
            debug!("OAuth callback for server '{}' rejected: {}", server, e);
            let status = if e.to_string().contains("unknown_server") {
                HttpResponse::NotFound()
            } else {
                HttpResponse::BadRequest()
            };
            let mut status = status;
            status.json(json!({ "error": e.to_string() }))
        }
    }
}

async fn oauth_completed() -> HttpResponse {
    HttpResponse::Ok().content_type("text/html; charset=utf-8").body(
        "<html><body><h1>Authorization complete</h1>\
         <p>You can close this window and return to your MCP client.</p></body></html>",
    )
}

fn oauth_error_response(error: OAuthError) -> HttpResponse {
    let body = json!({
        "error": error.kind.as_str(),
        "error_description": error.description,
    });
    match error.kind.http_status() {
        401 => HttpResponse::Unauthorized().json(body),
        500 => HttpResponse::InternalServerError().json(body),
        _ => HttpResponse::BadRequest().json(body),
    }
}

async fn as_register(
    gateway: web::Data<Arc<Gateway>>,
    body: web::Json<RegistrationRequest>,
) -> HttpResponse {
    match gateway.auth_server.register(body.into_inner()) {
        Ok(response) => HttpResponse::Created().json(response),
        Err(e) => oauth_error_response(e),
    }
}

async fn as_authorize(
    gateway: web::Data<Arc<Gateway>>,
    query: web::Query<AuthorizeParams>,
) -> HttpResponse {
    match gateway.auth_server.begin_authorization(query.into_inner()) {
        Ok(auth_request_id) => HttpResponse::Found()
            .insert_header((
                header::LOCATION,
                format!("/consent?authRequestId={}", urlencoding::encode(&auth_request_id)),
            ))
            .finish(),
        Err(e) => oauth_error_response(e),
    }
}

#[derive(serde::Deserialize)]
struct ConsentPageQuery {
    #[serde(rename = "authRequestId")]
    auth_request_id: String,
}

async fn as_consent_page(
    gateway: web::Data<Arc<Gateway>>,
    query: web::Query<ConsentPageQuery>,
) -> HttpResponse {
    let auth_request_id = query.into_inner().auth_request_id;
    let request = match gateway.auth_server.auth_request(&auth_request_id) {
        Ok(request) => request,
        Err(e) => return oauth_error_response(e),
    };

    let scope_list = request.scopes.join(" ");
    let page = format!(
        "<html><body><h1>Authorize client</h1>\
         <p>Client <code>{client}</code> requests scopes: <code>{scopes}</code></p>\
         <form method=\"post\" action=\"/consent\">\
         <input type=\"hidden\" name=\"authRequestId\" value=\"{id}\">\
         <input type=\"hidden\" name=\"scope\" value=\"{scopes}\">\
         <button name=\"action\" value=\"approve\">Approve</button>\
         <button name=\"action\" value=\"deny\">Deny</button>\
         </form></body></html>",
        client = request.client_id,
        id = auth_request_id,
        scopes = scope_list,
    );
    HttpResponse::Ok().content_type("text/html; charset=utf-8").body(page)
}

#[derive(serde::Deserialize)]
struct ConsentForm {
    #[serde(rename = "authRequestId")]
    auth_request_id: String,
    action: String,
    /// Space-separated granted scopes
    #[serde(default)]
    scope: Option<String>,
}

async fn as_consent_submit(
    gateway: web::Data<Arc<Gateway>>,
    form: web::Form<ConsentForm>,
) -> HttpResponse {
    let form = form.into_inner();
    let approved = form.action == "approve";
    let granted: Vec<String> = form
        .scope
        .as_deref()
        .unwrap_or_default()
        .split_whitespace()
        .map(str::to_string)
        .collect();
    match gateway
        .auth_server
        .consent(&form.auth_request_id, approved, granted)
    {
        Ok(redirect) => HttpResponse::Found()
            .insert_header((header::LOCATION, redirect.location))
            .finish(),
        Err(e) => oauth_error_response(e),
    }
}

async fn as_token(
    gateway: web::Data<Arc<Gateway>>,
    form: web::Form<TokenParams>,
) -> HttpResponse {
    match gateway.auth_server.exchange_token(form.into_inner()) {
        Ok(response) => HttpResponse::Ok().json(response),
        Err(e) => oauth_error_response(e),
    }
}
