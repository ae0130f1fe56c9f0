use crate::message::{DecodeError, RpcError};
use thiserror::Error;

/// Error taxonomy for the MCP client stack.
///
/// Transport and decode failures are absorbed at the connection boundary:
/// the owning connection is marked failed and the error is recorded, never
/// propagated as a crash. Per-call timeouts and remote tool failures surface
/// to the agent as ordinary failed results.
#[derive(Debug, Error)]
pub enum McpError {
    #[error("protocol decode failed: {0}")]
    Decode(#[from] DecodeError),

    #[error("transport failure: {0}")]
    Connection(String),

    #[error("server protocol version {received} is not supported (requested {requested})")]
    IncompatibleVersion { requested: String, received: String },

    #[error("request {method} timed out after {timeout_ms}ms")]
    Timeout { method: String, timeout_ms: u64 },

    #[error("connection closed before the request completed")]
    ConnectionClosed,

    #[error("{0}")]
    Rpc(RpcError),

    #[error("tool not found: {0}")]
    ToolNotFound(String),

    #[error("tool execution failed: {0}")]
    ToolFailed(String),

    #[error("invalid MCP configuration: {0}")]
    Config(String),
}

impl McpError {
    pub fn connection(err: impl std::fmt::Display) -> Self {
        McpError::Connection(err.to_string())
    }

    /// True when the error is the JSON-RPC method-not-found code, which
    /// listing calls treat as "capability absent" rather than a failure.
    pub fn is_method_not_found(&self) -> bool {
        matches!(self, McpError::Rpc(error) if error.code == crate::message::METHOD_NOT_FOUND)
    }
}
