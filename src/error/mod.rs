//! Error handling module for the MCP gateway

mod error;

// Re-export the main error types and utilities
pub use error::{redact_secrets, GatewayError, Result};
