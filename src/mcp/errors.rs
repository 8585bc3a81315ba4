//! MCP-compliant error handling
//!
//! JSON-RPC 2.0 error codes and the error object surfaced to inbound agents.

use crate::error::{redact_secrets, GatewayError};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON-RPC error codes used by the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum McpErrorCode {
    // Standard JSON-RPC error codes
    ParseError = -32700,
    InvalidRequest = -32600,
    MethodNotFound = -32601,
    InvalidParams = -32602,
    InternalError = -32603,

    // Gateway-specific codes (above -32000 as per spec)
    ServerNotFound = -32000,
    ServerNotConnected = -31999,
    CapabilityMissing = -31998,
    AuthenticationFailed = -31997,
    TimeoutError = -31996,
    RequestCancelled = -31995,
}

impl McpErrorCode {
    /// Get the error code as i32
    pub fn code(&self) -> i32 {
        *self as i32
    }
}

/// JSON-RPC 2.0 error object
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub data: Option<Value>,
}

impl McpError {
    /// Create a new error
    pub fn new(code: McpErrorCode, message: String) -> Self {
        Self {
            code: code.code(),
            message,
            data: None,
        }
    }

    /// Create a new error with additional data
    pub fn with_data(code: McpErrorCode, message: String, data: Value) -> Self {
        Self {
            code: code.code(),
            message,
            data: Some(data),
        }
    }

    /// Create a method not found error
    pub fn method_not_found(method: &str) -> Self {
        Self::with_data(
            McpErrorCode::MethodNotFound,
            format!("Method '{}' not found", method),
            serde_json::json!({ "method": method }),
        )
    }

    /// Create an invalid params error
    pub fn invalid_params(message: String) -> Self {
        Self::new(McpErrorCode::InvalidParams, message)
    }

    /// Create an internal error
    pub fn internal_error(message: String) -> Self {
        Self::new(McpErrorCode::InternalError, message)
    }
}

/// Convert a gateway error to the JSON-RPC error surfaced inbound.
///
/// Messages are redacted before leaving the process; the original category is
/// attached as `data` so agents can distinguish failure classes.
impl From<GatewayError> for McpError {
    fn from(error: GatewayError) -> Self {
        let category = error.category();
        let message = redact_secrets(&error.to_string());
        let code = match &error {
            GatewayError::Validation { .. } => McpErrorCode::InvalidParams,
            GatewayError::NotFound { .. } => McpErrorCode::ServerNotFound,
            GatewayError::ClientNotConnected { .. } => McpErrorCode::ServerNotConnected,
            GatewayError::CapabilityMissing { .. } => McpErrorCode::CapabilityMissing,
            GatewayError::Auth { .. } => McpErrorCode::AuthenticationFailed,
            GatewayError::Timeout { .. } => McpErrorCode::TimeoutError,
            GatewayError::Cancelled => McpErrorCode::RequestCancelled,
            _ => McpErrorCode::InternalError,
        };
        McpError::with_data(code, message, serde_json::json!({ "category": category }))
    }
}
