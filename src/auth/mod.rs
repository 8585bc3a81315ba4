//! OAuth subsystem for the MCP gateway
//!
//! Both halves of the OAuth story share the session store: the inbound
//! authorization server that protects the gateway itself, and the outbound
//! client that authorizes against upstream MCP servers (with the rendezvous
//! bridging the human callback back to the waiting connector).

pub mod client;
pub mod pkce;
pub mod rendezvous;
pub mod server;
pub mod session_store;

pub use client::{ClientInfo, OutboundOAuthClient, StoredTokens};
pub use rendezvous::OAuthRendezvous;
pub use server::{
    AccessTokenBinding, AuthorizationServer, AuthorizeParams, OAuthError, OAuthErrorKind,
    RegistrationRequest, TokenParams, TokenResponse,
};
pub use session_store::{Category, RecordMeta, SessionStore};
