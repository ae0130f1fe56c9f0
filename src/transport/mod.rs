//! Shared MCP transport abstractions.
//!
//! Both backends frame complete JSON-RPC messages as text and normalize
//! their failure modes into the crate error taxonomy so the client's
//! receive loop can treat them uniformly.

use crate::config::McpServerConfig;
use crate::error::McpError;
use async_trait::async_trait;
use std::sync::Arc;

pub mod http;
pub mod stdio;

pub use http::HttpTransport;
pub use stdio::StdioTransport;

/// Supported MCP transport backends.
///
/// - [`TransportKind::Stdio`] for locally spawned processes.
/// - [`TransportKind::Http`] for remote servers over HTTP/SSE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Http,
    Stdio,
}

impl TransportKind {
    /// Resolves transport type from config, defaulting to streamable HTTP.
    pub fn from_config(config: &McpServerConfig) -> Result<Self, McpError> {
        let transport = config
            .transport
            .as_deref()
            .unwrap_or("streamable-http")
            .to_ascii_lowercase();
        match transport.as_str() {
            "streamable-http" | "streamable_http" | "http" => Ok(TransportKind::Http),
            "stdio" => Ok(TransportKind::Stdio),
            other => Err(McpError::Config(format!("Unsupported MCP transport: {other}"))),
        }
    }
}

/// Byte-stream channel carrying protocol frames for exactly one connection.
///
/// All methods take `&self`; implementations use interior mutability so one
/// receive loop and any number of senders can share the transport.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establishes the channel. Erring when called on an already-connected
    /// transport; only the first call may succeed.
    async fn connect(&self) -> Result<(), McpError>;

    /// Best-effort teardown. Always releases local resources (pipes,
    /// sockets, spawned processes) and never errors.
    async fn disconnect(&self);

    /// Writes one complete message frame.
    async fn send(&self, frame: &str) -> Result<(), McpError>;

    /// Suspends until one complete frame is available. End of stream maps
    /// to [`McpError::ConnectionClosed`].
    async fn receive(&self) -> Result<String, McpError>;

    /// Point-in-time liveness check, not authoritative against a
    /// concurrent close.
    fn is_connected(&self) -> bool;

    /// Hint recorded after the handshake; HTTP attaches it as the
    /// `MCP-Protocol-Version` header, stdio has no use for it.
    fn set_protocol_version(&self, _version: &str) {}
}

pub fn build_transport(config: &McpServerConfig) -> Result<Arc<dyn Transport>, McpError> {
    match TransportKind::from_config(config)? {
        TransportKind::Stdio => Ok(Arc::new(StdioTransport::from_config(config)?)),
        TransportKind::Http => Ok(Arc::new(HttpTransport::from_config(config)?)),
    }
}
