//! mcplink connects an AI agent runtime to external Model Context Protocol
//! servers and republishes their tools behind the local tool contract.
//!
//! The crate is organized around a small set of collaborating layers:
//! - [`message`] models the JSON-RPC envelope and performs lossless
//!   encode/decode of wire frames, including batch payloads.
//! - [`protocol`] defines the MCP payload types (handshake, tool, resource,
//!   and prompt records) and the protocol-version negotiation rules.
//! - [`transport`] is the byte-stream seam: a subprocess stdio transport and
//!   a streamable HTTP transport behind one capability trait.
//! - [`client`] owns a single connection: the initialize handshake, the
//!   in-flight request table, and the background receive loop that
//!   demultiplexes responses, notifications, and server requests.
//! - [`manager`] holds the named collection of clients, isolates per-server
//!   failures, and aggregates remote tools into one namespaced view.
//! - [`tools`] adapts namespaced remote tools to the local tool contract so
//!   the agent loop cannot distinguish them from native tools.
//!
//! The `mcplink` binary (`src/main.rs`) is a thin diagnostic CLI over the
//! manager: it connects the configured servers, lists their tools, and can
//! invoke a single tool call.

pub mod client;
pub mod config;
pub mod error;
pub mod manager;
pub mod message;
pub mod protocol;
pub mod tools;
pub mod transport;
