//! Single-connection MCP client.
//!
//! One client owns one transport. Callers issue concurrent `call`s that are
//! pipelined on the wire; a dedicated receive-loop task demultiplexes the
//! inbound stream back to the waiting callers through single-assignment
//! result slots keyed by correlation id. Responses may arrive in any order;
//! the id, not arrival order, determines resolution.

use crate::config::McpServerConfig;
use crate::error::McpError;
use crate::message::{self, Message, Notification, Request, RequestId, Response, RpcError};
use crate::protocol::{
    self, methods, CallToolParams, CallToolResult, ClientCapabilities, Implementation,
    InitializeParams, InitializeResult, ListPromptsResult, ListResourcesResult, ListToolsResult,
    PaginatedParams,
};
use crate::transport::Transport;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Tool listings are paginated; stop aggregating past this many entries.
const MAX_TOOL_LIST: usize = 100;

/// Connection lifecycle. `Failed` is terminal and reachable from any
/// non-terminal state on unrecoverable transport error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Unconnected,
    Connecting,
    Handshaking,
    Ready,
    Closing,
    Closed,
    Failed,
}

impl ClientState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ClientState::Unconnected,
            1 => ClientState::Connecting,
            2 => ClientState::Handshaking,
            3 => ClientState::Ready,
            4 => ClientState::Closing,
            5 => ClientState::Closed,
            _ => ClientState::Failed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            ClientState::Unconnected => 0,
            ClientState::Connecting => 1,
            ClientState::Handshaking => 2,
            ClientState::Ready => 3,
            ClientState::Closing => 4,
            ClientState::Closed => 5,
            ClientState::Failed => 6,
        }
    }
}

struct AtomicState(AtomicU8);

impl AtomicState {
    fn new(state: ClientState) -> Self {
        Self(AtomicU8::new(state.as_u8()))
    }

    fn load(&self) -> ClientState {
        ClientState::from_u8(self.0.load(Ordering::SeqCst))
    }

    fn store(&self, state: ClientState) {
        self.0.store(state.as_u8(), Ordering::SeqCst);
    }

    fn transition(&self, from: ClientState, to: ClientState) -> bool {
        self.0
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

/// Server-initiated traffic forwarded to the owning manager.
#[derive(Debug, Clone)]
pub struct ClientEvent {
    pub server_id: String,
    pub kind: ClientEventKind,
}

#[derive(Debug, Clone)]
pub enum ClientEventKind {
    Notification {
        method: String,
        params: Option<Value>,
    },
    Request {
        id: RequestId,
        method: String,
        params: Option<Value>,
    },
    /// The receive loop terminated; pending calls have been flushed.
    Disconnected,
}

type PendingMap = HashMap<RequestId, oneshot::Sender<Result<Value, McpError>>>;

pub struct McpClient {
    server_id: String,
    config: McpServerConfig,
    transport: Arc<dyn Transport>,
    pending: Arc<Mutex<PendingMap>>,
    next_request_id: AtomicI64,
    state: Arc<AtomicState>,
    server_info: RwLock<Option<InitializeResult>>,
    events: Option<mpsc::UnboundedSender<ClientEvent>>,
    shutdown: CancellationToken,
    request_timeout: Duration,
}

impl McpClient {
    pub fn new(
        config: McpServerConfig,
        transport: Arc<dyn Transport>,
        events: Option<mpsc::UnboundedSender<ClientEvent>>,
    ) -> Self {
        let request_timeout = config
            .request_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT);
        Self {
            server_id: config.id.clone(),
            config,
            transport,
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_request_id: AtomicI64::new(0),
            state: Arc::new(AtomicState::new(ClientState::Unconnected)),
            server_info: RwLock::new(None),
            events,
            shutdown: CancellationToken::new(),
            request_timeout,
        }
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn state(&self) -> ClientState {
        self.state.load()
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Immutable handshake snapshot; `None` until the client is Ready.
    pub async fn server_info(&self) -> Option<InitializeResult> {
        self.server_info.read().await.clone()
    }

    pub async fn supports_tools(&self) -> bool {
        self.server_info
            .read()
            .await
            .as_ref()
            .map(|details| details.capabilities.tools.is_some())
            .unwrap_or(true)
    }

    pub async fn supports_resources(&self) -> bool {
        self.server_info
            .read()
            .await
            .as_ref()
            .map(|details| details.capabilities.resources.is_some())
            .unwrap_or(true)
    }

    pub async fn supports_prompts(&self) -> bool {
        self.server_info
            .read()
            .await
            .as_ref()
            .map(|details| details.capabilities.prompts.is_some())
            .unwrap_or(true)
    }

    /// Drives the transport, performs the initialize handshake, and leaves
    /// the connection Ready. Every failure path disconnects the transport
    /// so the connection is never left half-open.
    pub async fn connect(&self) -> Result<InitializeResult, McpError> {
        if !self
            .state
            .transition(ClientState::Unconnected, ClientState::Connecting)
        {
            return Err(McpError::Connection(format!(
                "client is not connectable from state {:?}",
                self.state.load()
            )));
        }

        if let Err(err) = self.transport.connect().await {
            self.fail_connection().await;
            return Err(err);
        }

        self.spawn_receive_loop();
        self.state.store(ClientState::Handshaking);

        match self.handshake().await {
            Ok(details) => {
                self.state.store(ClientState::Ready);
                debug!(
                    server_id = %self.server_id,
                    server = %details.server_info.name,
                    protocol_version = %details.protocol_version,
                    "MCP connection ready"
                );
                Ok(details)
            }
            Err(err) => {
                self.fail_connection().await;
                Err(err)
            }
        }
    }

    async fn handshake(&self) -> Result<InitializeResult, McpError> {
        let requested = self
            .config
            .protocol_version
            .clone()
            .unwrap_or_else(|| protocol::LATEST_PROTOCOL_VERSION.to_string());
        let params = InitializeParams {
            protocol_version: requested.clone(),
            capabilities: ClientCapabilities::default(),
            client_info: Implementation {
                name: env!("CARGO_PKG_NAME").to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                title: None,
            },
        };

        let value = self
            .call(
                methods::INITIALIZE,
                Some(protocol::to_params_value(&params)?),
                self.request_timeout,
            )
            .await?;
        let details: InitializeResult = protocol::from_result_value(value)?;

        if !protocol::is_supported_version(&details.protocol_version) {
            return Err(McpError::IncompatibleVersion {
                requested,
                received: details.protocol_version,
            });
        }

        self.transport.set_protocol_version(&details.protocol_version);
        self.notify(methods::INITIALIZED, None).await?;
        *self.server_info.write().await = Some(details.clone());
        Ok(details)
    }

    async fn fail_connection(&self) {
        self.state.store(ClientState::Failed);
        self.shutdown.cancel();
        self.transport.disconnect().await;
        flush_pending(&self.pending).await;
    }

    /// Sends one request and suspends the caller until its response
    /// arrives, the timeout elapses, or the connection closes. Concurrent
    /// calls are independent; each caller waits only on its own slot.
    pub async fn call(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, McpError> {
        match self.state.load() {
            ClientState::Ready | ClientState::Handshaking => {}
            ClientState::Closing | ClientState::Closed | ClientState::Failed => {
                return Err(McpError::ConnectionClosed);
            }
            other => {
                return Err(McpError::Connection(format!(
                    "client is not connected (state {other:?})"
                )));
            }
        }

        let id = RequestId::Integer(self.next_request_id.fetch_add(1, Ordering::SeqCst));
        let (tx, rx) = oneshot::channel();
        {
            self.pending.lock().await.insert(id.clone(), tx);
        }

        debug!(server_id = %self.server_id, request_id = %id, method, "Sending MCP request");
        let frame = message::encode(&Message::Request(Request {
            id: id.clone(),
            method: method.to_string(),
            params,
        }));
        if let Err(err) = self.transport.send(&frame).await {
            self.pending.lock().await.remove(&id);
            return Err(err);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(McpError::ConnectionClosed),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                debug!(
                    server_id = %self.server_id,
                    request_id = %id,
                    method,
                    timeout_ms = timeout.as_millis() as u64,
                    "MCP request timed out"
                );
                Err(McpError::Timeout {
                    method: method.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Fire-and-forget send; no correlation, no waiting.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError> {
        let frame = message::encode(&Message::Notification(Notification {
            method: method.to_string(),
            params,
        }));
        self.transport.send(&frame).await
    }

    /// Answers a server-initiated request with a result.
    pub async fn respond_result(&self, id: RequestId, result: Value) -> Result<(), McpError> {
        let frame = message::encode(&Message::Response(Response {
            id,
            outcome: Ok(result),
        }));
        self.transport.send(&frame).await
    }

    /// Answers a server-initiated request with an error.
    pub async fn respond_error(&self, id: RequestId, error: RpcError) -> Result<(), McpError> {
        let frame = message::encode(&Message::Response(Response {
            id,
            outcome: Err(error),
        }));
        self.transport.send(&frame).await
    }

    /// Cancels the receive loop, tears down the transport, and fails every
    /// outstanding call with [`McpError::ConnectionClosed`].
    pub async fn close(&self) {
        self.state.store(ClientState::Closing);
        self.shutdown.cancel();
        self.transport.disconnect().await;
        flush_pending(&self.pending).await;
        self.state.store(ClientState::Closed);
    }

    fn spawn_receive_loop(&self) {
        let transport = self.transport.clone();
        let pending = self.pending.clone();
        let state = self.state.clone();
        let events = self.events.clone();
        let shutdown = self.shutdown.clone();
        let server_id = self.server_id.clone();

        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    frame = transport.receive() => frame,
                };
                let frame = match frame {
                    Ok(frame) => frame,
                    Err(err) => {
                        if !matches!(state.load(), ClientState::Closing | ClientState::Closed) {
                            warn!(server_id = %server_id, error = %err, "MCP transport receive failed");
                            state.store(ClientState::Failed);
                        }
                        break;
                    }
                };

                let messages = match message::decode(&frame) {
                    Ok(messages) => messages,
                    Err(err) => {
                        warn!(server_id = %server_id, error = %err, "Undecodable MCP frame; failing connection");
                        state.store(ClientState::Failed);
                        transport.disconnect().await;
                        break;
                    }
                };

                for incoming in messages {
                    dispatch_message(&pending, &transport, &events, &server_id, incoming).await;
                }
            }

            flush_pending(&pending).await;
            if let Some(tx) = &events {
                let _ = tx.send(ClientEvent {
                    server_id: server_id.clone(),
                    kind: ClientEventKind::Disconnected,
                });
            }
        });
    }
}

async fn dispatch_message(
    pending: &Arc<Mutex<PendingMap>>,
    transport: &Arc<dyn Transport>,
    events: &Option<mpsc::UnboundedSender<ClientEvent>>,
    server_id: &str,
    incoming: Message,
) {
    match incoming {
        Message::Response(response) => {
            debug!(server_id = %server_id, response_id = %response.id, "Received MCP response");
            let sender = pending.lock().await.remove(&response.id);
            match sender {
                Some(tx) => {
                    let _ = tx.send(response.outcome.map_err(McpError::Rpc));
                }
                None => {
                    warn!(
                        server_id = %server_id,
                        response_id = %response.id,
                        "Dropping MCP response with unknown id"
                    );
                }
            }
        }
        Message::Notification(notification) => {
            debug!(server_id = %server_id, method = %notification.method, "Received MCP notification");
            if let Some(tx) = events {
                let _ = tx.send(ClientEvent {
                    server_id: server_id.to_string(),
                    kind: ClientEventKind::Notification {
                        method: notification.method,
                        params: notification.params,
                    },
                });
            }
        }
        Message::Request(request) => {
            debug!(
                server_id = %server_id,
                request_id = %request.id,
                method = %request.method,
                "Received MCP server request"
            );
            match events {
                Some(tx) => {
                    let _ = tx.send(ClientEvent {
                        server_id: server_id.to_string(),
                        kind: ClientEventKind::Request {
                            id: request.id,
                            method: request.method,
                            params: request.params,
                        },
                    });
                }
                None => {
                    let reply = message::encode(&Message::Response(Response {
                        id: request.id,
                        outcome: Err(RpcError::method_not_found(&request.method)),
                    }));
                    let _ = transport.send(&reply).await;
                }
            }
        }
    }
}

async fn flush_pending(pending: &Arc<Mutex<PendingMap>>) {
    let mut pending = pending.lock().await;
    for (_, tx) in pending.drain() {
        let _ = tx.send(Err(McpError::ConnectionClosed));
    }
}

impl McpClient {
    async fn list_page<T: DeserializeOwned>(
        &self,
        method: &str,
        cursor: Option<String>,
    ) -> Result<T, McpError> {
        let params = match cursor {
            Some(cursor) => Some(protocol::to_params_value(&PaginatedParams {
                cursor: Some(cursor),
            })?),
            None => None,
        };
        let value = self.call(method, params, self.request_timeout).await?;
        protocol::from_result_value(value)
    }

    /// Aggregates the paginated tool listing, following cursors until the
    /// cap is reached or the server runs out of pages.
    pub async fn list_tools(&self) -> Result<ListToolsResult, McpError> {
        let first: ListToolsResult = self.list_page(methods::TOOLS_LIST, None).await?;
        let mut tools = first.tools;
        let mut next_cursor = first.next_cursor;

        if tools.len() >= MAX_TOOL_LIST {
            tools.truncate(MAX_TOOL_LIST);
        } else {
            while let Some(cursor) = next_cursor.clone() {
                let page: ListToolsResult =
                    self.list_page(methods::TOOLS_LIST, Some(cursor)).await?;
                tools.extend(page.tools);
                next_cursor = page.next_cursor;
                if tools.len() >= MAX_TOOL_LIST {
                    tools.truncate(MAX_TOOL_LIST);
                    break;
                }
            }
        }

        Ok(ListToolsResult { tools, next_cursor })
    }

    pub async fn list_resources(&self) -> Result<ListResourcesResult, McpError> {
        self.list_page(methods::RESOURCES_LIST, None).await
    }

    pub async fn list_prompts(&self) -> Result<ListPromptsResult, McpError> {
        self.list_page(methods::PROMPTS_LIST, None).await
    }

    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Option<Map<String, Value>>,
    ) -> Result<CallToolResult, McpError> {
        let params = CallToolParams {
            name: name.to_string(),
            arguments,
        };
        let value = self
            .call(
                methods::TOOLS_CALL,
                Some(protocol::to_params_value(&params)?),
                self.request_timeout,
            )
            .await?;
        protocol::from_result_value(value)
    }

    pub async fn ping(&self) -> Result<(), McpError> {
        self.call(methods::PING, None, self.request_timeout)
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests;
