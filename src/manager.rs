//! Named collection of MCP connections.
//!
//! The manager is an explicitly constructed handle (cheaply clonable over
//! shared inner state) that connects the configured servers, isolates
//! per-server failures, and aggregates every Ready server's tools into one
//! namespaced view. The aggregated view is rebuilt offline and swapped as
//! an `Arc` snapshot, so readers never observe a partially rebuilt
//! namespace.

use crate::client::{ClientEvent, ClientEventKind, McpClient};
use crate::config::{McpConfig, McpServerConfig};
use crate::error::McpError;
use crate::message::RpcError;
use crate::protocol::{
    methods, CallToolResult, InitializeResult, ListPromptsResult, ListResourcesResult,
    ListToolsResult,
};
use crate::transport;
use futures_util::{stream, StreamExt};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Double underscore keeps remote names from colliding with local tools.
pub const TOOL_NAME_SEPARATOR: &str = "__";

const CONNECT_CONCURRENCY_LIMIT: usize = 3;

/// Failed servers are only retried explicitly, and not more often than
/// this. Reconnection is a manager-level decision; there is no automatic
/// retry loop.
const RECONNECT_MIN_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Ready,
    Failed,
    Closed,
}

/// Per-server snapshot for user-facing reporting.
#[derive(Debug, Clone)]
pub struct ServerStatus {
    pub id: String,
    pub display_name: String,
    pub status: ConnectionStatus,
    pub last_error: Option<String>,
    pub tool_count: usize,
}

/// One published tool: the namespaced local name plus the lookup keys back
/// to the owning connection.
#[derive(Debug, Clone)]
pub struct NamespacedTool {
    pub local_name: String,
    pub server_id: String,
    pub remote_name: String,
    pub description: Option<String>,
    pub input_schema: Value,
}

pub fn split_local_name(local_name: &str) -> Option<(&str, &str)> {
    local_name.split_once(TOOL_NAME_SEPARATOR)
}

#[derive(Default)]
struct ToolNamespace {
    entries: HashMap<String, NamespacedTool>,
}

struct ServerEntry {
    config: McpServerConfig,
    client: Option<Arc<McpClient>>,
    status: ConnectionStatus,
    last_error: Option<String>,
    last_attempt: Option<Instant>,
    server_info: Option<InitializeResult>,
    cached_tools: Option<ListToolsResult>,
    cached_resources: Option<ListResourcesResult>,
    cached_prompts: Option<ListPromptsResult>,
}

impl ServerEntry {
    fn new(config: McpServerConfig) -> Self {
        Self {
            config,
            client: None,
            status: ConnectionStatus::Disconnected,
            last_error: None,
            last_attempt: None,
            server_info: None,
            cached_tools: None,
            cached_resources: None,
            cached_prompts: None,
        }
    }
}

struct ManagerInner {
    servers: RwLock<HashMap<String, ServerEntry>>,
    namespace: RwLock<Arc<ToolNamespace>>,
    events_tx: mpsc::UnboundedSender<ClientEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<ClientEvent>>>,
    pump: std::sync::Mutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct McpClientManager {
    inner: Arc<ManagerInner>,
}

impl McpClientManager {
    pub fn new(configs: Vec<McpServerConfig>) -> Self {
        let servers = configs
            .into_iter()
            .map(|config| (config.id.to_ascii_lowercase(), ServerEntry::new(config)))
            .collect();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(ManagerInner {
                servers: RwLock::new(servers),
                namespace: RwLock::new(Arc::new(ToolNamespace::default())),
                events_tx,
                events_rx: Mutex::new(Some(events_rx)),
                pump: std::sync::Mutex::new(None),
            }),
        }
    }

    pub fn from_config(config: &McpConfig) -> Self {
        Self::new(config.mcp_servers.clone())
    }

    /// Attempts every enabled server with bounded concurrency. One server
    /// failing to connect never affects the others; the manager as a whole
    /// cannot fail here.
    pub async fn connect_all(&self) {
        let ids: Vec<String> = {
            let servers = self.inner.servers.read().await;
            servers
                .values()
                .filter(|entry| entry.config.is_enabled())
                .map(|entry| entry.config.id.clone())
                .collect()
        };

        stream::iter(ids)
            .for_each_concurrent(CONNECT_CONCURRENCY_LIMIT, |id| {
                let manager = self.clone();
                async move {
                    manager.connect_server(&id).await;
                }
            })
            .await;

        self.spawn_event_pump();
    }

    /// Connects one server by id; a no-op when it is already Ready,
    /// disabled, or a failed attempt happened too recently.
    pub async fn connect_server(&self, id: &str) {
        let key = id.to_ascii_lowercase();

        let config = {
            let mut servers = self.inner.servers.write().await;
            let Some(entry) = servers.get_mut(&key) else {
                return;
            };
            if !entry.config.is_enabled() {
                return;
            }
            match entry.status {
                ConnectionStatus::Ready | ConnectionStatus::Connecting => return,
                ConnectionStatus::Failed => {
                    if let Some(last_attempt) = entry.last_attempt {
                        if last_attempt.elapsed() < RECONNECT_MIN_INTERVAL {
                            debug!(server_id = %entry.config.id, "Skipping reconnect inside rate-limit window");
                            return;
                        }
                    }
                }
                ConnectionStatus::Disconnected | ConnectionStatus::Closed => {}
            }
            entry.status = ConnectionStatus::Connecting;
            entry.last_attempt = Some(Instant::now());
            entry.last_error = None;
            entry.config.clone()
        };

        let transport = match transport::build_transport(&config) {
            Ok(transport) => transport,
            Err(err) => {
                self.record_failure(&key, err.to_string()).await;
                return;
            }
        };

        let client = Arc::new(McpClient::new(
            config.clone(),
            transport,
            Some(self.inner.events_tx.clone()),
        ));

        match client.connect().await {
            Ok(details) => {
                let mut servers = self.inner.servers.write().await;
                if let Some(entry) = servers.get_mut(&key) {
                    entry.client = Some(client.clone());
                    entry.status = ConnectionStatus::Ready;
                    entry.server_info = Some(details);
                    entry.last_error = None;
                }
            }
            Err(err) => {
                self.record_failure(&key, err.to_string()).await;
                return;
            }
        }

        self.refresh_server(&key).await;
        self.rebuild_namespace().await;
    }

    async fn record_failure(&self, key: &str, error: String) {
        warn!(server_id = %key, error = %error, "MCP server connection failed");
        let mut servers = self.inner.servers.write().await;
        if let Some(entry) = servers.get_mut(key) {
            entry.status = ConnectionStatus::Failed;
            entry.last_error = Some(error);
            entry.client = None;
        }
    }

    async fn ready_client(&self, key: &str) -> Option<Arc<McpClient>> {
        let servers = self.inner.servers.read().await;
        let entry = servers.get(key)?;
        if entry.status != ConnectionStatus::Ready {
            return None;
        }
        entry.client.clone()
    }

    /// Fetches the listings a Ready server's capabilities advertise. A
    /// method-not-found reply is treated as an empty listing, not a
    /// failure.
    async fn refresh_server(&self, key: &str) {
        self.refresh_tools(key).await;
        self.refresh_resources(key).await;
        self.refresh_prompts(key).await;
    }

    pub async fn refresh_tools(&self, id: &str) {
        let key = id.to_ascii_lowercase();
        let Some(client) = self.ready_client(&key).await else {
            return;
        };
        let fetch = if client.supports_tools().await {
            match client.list_tools().await {
                Ok(list) => Ok(list),
                Err(err) if err.is_method_not_found() => Ok(ListToolsResult::default()),
                Err(err) => Err(err),
            }
        } else {
            Ok(ListToolsResult::default())
        };
        let mut servers = self.inner.servers.write().await;
        let Some(entry) = servers.get_mut(&key) else {
            return;
        };
        match fetch {
            Ok(list) => {
                entry.cached_tools = Some(list);
                entry.last_error = None;
            }
            Err(err) => {
                entry.last_error = Some(format!("Tools listing failed: {err}"));
            }
        }
    }

    pub async fn refresh_resources(&self, id: &str) {
        let key = id.to_ascii_lowercase();
        let Some(client) = self.ready_client(&key).await else {
            return;
        };
        let fetch = if client.supports_resources().await {
            match client.list_resources().await {
                Ok(list) => Ok(list),
                Err(err) if err.is_method_not_found() => Ok(ListResourcesResult::default()),
                Err(err) => Err(err),
            }
        } else {
            Ok(ListResourcesResult::default())
        };
        let mut servers = self.inner.servers.write().await;
        let Some(entry) = servers.get_mut(&key) else {
            return;
        };
        match fetch {
            Ok(list) => {
                entry.cached_resources = Some(list);
                entry.last_error = None;
            }
            Err(err) => {
                entry.last_error = Some(format!("Resources listing failed: {err}"));
            }
        }
    }

    pub async fn refresh_prompts(&self, id: &str) {
        let key = id.to_ascii_lowercase();
        let Some(client) = self.ready_client(&key).await else {
            return;
        };
        let fetch = if client.supports_prompts().await {
            match client.list_prompts().await {
                Ok(list) => Ok(list),
                Err(err) if err.is_method_not_found() => Ok(ListPromptsResult::default()),
                Err(err) => Err(err),
            }
        } else {
            Ok(ListPromptsResult::default())
        };
        let mut servers = self.inner.servers.write().await;
        let Some(entry) = servers.get_mut(&key) else {
            return;
        };
        match fetch {
            Ok(list) => {
                entry.cached_prompts = Some(list);
                entry.last_error = None;
            }
            Err(err) => {
                entry.last_error = Some(format!("Prompts listing failed: {err}"));
            }
        }
    }

    fn tool_allowed(config: &McpServerConfig, remote_name: &str) -> bool {
        match &config.allowed_tools {
            Some(allowed) => allowed.iter().any(|name| name == remote_name),
            None => true,
        }
    }

    /// Rebuilds the aggregated tool view from scratch and swaps it in as
    /// one atomic snapshot.
    async fn rebuild_namespace(&self) {
        let mut entries = HashMap::new();
        {
            let servers = self.inner.servers.read().await;
            for entry in servers.values() {
                if entry.status != ConnectionStatus::Ready {
                    continue;
                }
                let Some(list) = &entry.cached_tools else {
                    continue;
                };
                for tool in &list.tools {
                    if !Self::tool_allowed(&entry.config, &tool.name) {
                        continue;
                    }
                    let local_name = format!(
                        "{}{}{}",
                        entry.config.id, TOOL_NAME_SEPARATOR, tool.name
                    );
                    entries.insert(
                        local_name.clone(),
                        NamespacedTool {
                            local_name,
                            server_id: entry.config.id.clone(),
                            remote_name: tool.name.clone(),
                            description: tool.description.clone(),
                            input_schema: tool.input_schema.clone(),
                        },
                    );
                }
            }
        }
        *self.inner.namespace.write().await = Arc::new(ToolNamespace { entries });
    }

    /// Aggregated namespaced view over every Ready connection, sorted by
    /// local name.
    pub async fn list_tools(&self) -> Vec<NamespacedTool> {
        let namespace = self.inner.namespace.read().await.clone();
        let mut tools: Vec<NamespacedTool> = namespace.entries.values().cloned().collect();
        tools.sort_by(|a, b| a.local_name.cmp(&b.local_name));
        tools
    }

    pub async fn find_tool(&self, local_name: &str) -> Option<NamespacedTool> {
        let namespace = self.inner.namespace.read().await.clone();
        namespace.entries.get(local_name).cloned()
    }

    /// Resolves a namespaced name and forwards `tools/call` to the owning
    /// connection. Fails with [`McpError::ToolNotFound`] when the name is
    /// unknown or the owning connection is not Ready.
    pub async fn call_tool(
        &self,
        local_name: &str,
        arguments: Option<Map<String, Value>>,
    ) -> Result<CallToolResult, McpError> {
        let tool = self
            .find_tool(local_name)
            .await
            .ok_or_else(|| McpError::ToolNotFound(local_name.to_string()))?;
        let client = self
            .ready_client(&tool.server_id.to_ascii_lowercase())
            .await
            .ok_or_else(|| McpError::ToolNotFound(local_name.to_string()))?;
        client.call_tool(&tool.remote_name, arguments).await
    }

    /// Handshake snapshot for one server, once Ready.
    pub async fn server_info(&self, id: &str) -> Option<InitializeResult> {
        let servers = self.inner.servers.read().await;
        servers
            .get(&id.to_ascii_lowercase())
            .and_then(|entry| entry.server_info.clone())
    }

    pub async fn server_resources(&self, id: &str) -> Option<ListResourcesResult> {
        let servers = self.inner.servers.read().await;
        servers
            .get(&id.to_ascii_lowercase())
            .and_then(|entry| entry.cached_resources.clone())
    }

    pub async fn server_prompts(&self, id: &str) -> Option<ListPromptsResult> {
        let servers = self.inner.servers.read().await;
        servers
            .get(&id.to_ascii_lowercase())
            .and_then(|entry| entry.cached_prompts.clone())
    }

    pub async fn server_states(&self) -> Vec<ServerStatus> {
        let servers = self.inner.servers.read().await;
        let mut states: Vec<ServerStatus> = servers
            .values()
            .map(|entry| ServerStatus {
                id: entry.config.id.clone(),
                display_name: entry.config.display_label().to_string(),
                status: entry.status,
                last_error: entry.last_error.clone(),
                tool_count: entry
                    .cached_tools
                    .as_ref()
                    .map(|list| list.tools.len())
                    .unwrap_or(0),
            })
            .collect();
        states.sort_by(|a, b| a.id.cmp(&b.id));
        states
    }

    /// Starts the background task that reacts to client events
    /// (list-changed notifications, server requests, disconnects).
    /// Idempotent; the receiver can only be taken once.
    pub fn spawn_event_pump(&self) {
        let receiver = {
            let mut guard = match self.inner.events_rx.try_lock() {
                Ok(guard) => guard,
                Err(_) => return,
            };
            guard.take()
        };
        let Some(mut receiver) = receiver else {
            return;
        };
        let manager = self.clone();
        let handle = tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                manager.handle_event(event).await;
            }
        });
        if let Ok(mut guard) = self.inner.pump.lock() {
            *guard = Some(handle);
        }
    }

    /// Applies one client event. List-changed notifications trigger
    /// exactly one re-fetch of that server's listing followed by an atomic
    /// swap of the aggregated view.
    pub async fn handle_event(&self, event: ClientEvent) {
        match event.kind {
            ClientEventKind::Notification { method, .. } => match method.as_str() {
                methods::TOOLS_LIST_CHANGED => {
                    debug!(server_id = %event.server_id, "Tool list changed; refreshing");
                    self.refresh_tools(&event.server_id).await;
                    self.rebuild_namespace().await;
                }
                methods::RESOURCES_LIST_CHANGED => {
                    self.refresh_resources(&event.server_id).await;
                }
                methods::PROMPTS_LIST_CHANGED => {
                    self.refresh_prompts(&event.server_id).await;
                }
                other => {
                    debug!(server_id = %event.server_id, method = %other, "Ignoring MCP notification");
                }
            },
            ClientEventKind::Request { id, method, .. } => {
                // Server-initiated requests (e.g. sampling) are not
                // supported; answer with method-not-found instead of
                // leaving the server hanging.
                let key = event.server_id.to_ascii_lowercase();
                if let Some(client) = self.ready_client(&key).await {
                    let _ = client
                        .respond_error(id, RpcError::method_not_found(&method))
                        .await;
                }
            }
            ClientEventKind::Disconnected => {
                let key = event.server_id.to_ascii_lowercase();
                let was_ready = {
                    let mut servers = self.inner.servers.write().await;
                    match servers.get_mut(&key) {
                        Some(entry) if entry.status == ConnectionStatus::Ready => {
                            entry.status = ConnectionStatus::Failed;
                            entry.last_error =
                                Some("Connection lost.".to_string());
                            entry.client = None;
                            true
                        }
                        _ => false,
                    }
                };
                if was_ready {
                    warn!(server_id = %event.server_id, "MCP connection lost");
                    self.rebuild_namespace().await;
                }
            }
        }
    }

    /// Tears down every connection regardless of state. Safe to call at
    /// shutdown even when connections are Failed or never came up; stdio
    /// children never outlive the host.
    pub async fn disconnect_all(&self) {
        if let Ok(mut guard) = self.inner.pump.lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }

        let clients: Vec<Arc<McpClient>> = {
            let mut servers = self.inner.servers.write().await;
            servers
                .values_mut()
                .filter_map(|entry| {
                    entry.status = ConnectionStatus::Closed;
                    entry.cached_tools = None;
                    entry.client.take()
                })
                .collect()
        };
        for client in clients {
            client.close().await;
        }
        *self.inner.namespace.write().await = Arc::new(ToolNamespace::default());
    }
}
