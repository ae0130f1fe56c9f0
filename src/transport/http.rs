//! Streamable HTTP transport.
//!
//! `send` POSTs one frame to the server's base URL; response bodies (plain
//! JSON or SSE `data:` events) are queued for `receive`, alongside frames
//! pushed by an optional background GET event stream once a session has
//! been established. The `mcp-session-id` token returned on the first
//! exchange rides on every later request.

use crate::config::McpServerConfig;
use crate::error::McpError;
use crate::transport::Transport;
use async_trait::async_trait;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const HTTP_CONNECT_TIMEOUT_SECONDS: u64 = 10;
const HTTP_REQUEST_TIMEOUT_SECONDS: u64 = 60;
const HTTP_POOL_IDLE_TIMEOUT_SECONDS: u64 = 90;
const HTTP_POOL_MAX_IDLE_PER_HOST: usize = 8;

const JSON_CONTENT_TYPE: &str = "application/json";
const JSON_AND_SSE_ACCEPT: &str = "application/json, text/event-stream";
const SSE_ACCEPT: &str = "text/event-stream";
const SESSION_ID_HEADER: &str = "mcp-session-id";
const PROTOCOL_VERSION_HEADER: &str = "MCP-Protocol-Version";

fn build_http_client() -> Result<reqwest::Client, McpError> {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(HTTP_CONNECT_TIMEOUT_SECONDS))
        .timeout(Duration::from_secs(HTTP_REQUEST_TIMEOUT_SECONDS))
        .pool_idle_timeout(Duration::from_secs(HTTP_POOL_IDLE_TIMEOUT_SECONDS))
        .pool_max_idle_per_host(HTTP_POOL_MAX_IDLE_PER_HOST)
        .build()
        .map_err(|err| McpError::Config(format!("Failed to build HTTP client: {err}")))
}

pub struct HttpTransport {
    server_id: String,
    base_url: String,
    headers: HashMap<String, String>,
    client: reqwest::Client,
    connected: AtomicBool,
    session_id: StdMutex<Option<String>>,
    protocol_version: StdMutex<Option<String>>,
    inbound_tx: StdMutex<Option<mpsc::UnboundedSender<String>>>,
    inbound_rx: Mutex<mpsc::UnboundedReceiver<String>>,
    listener_started: AtomicBool,
    listener: StdMutex<Option<JoinHandle<()>>>,
}

impl HttpTransport {
    pub fn from_config(config: &McpServerConfig) -> Result<Self, McpError> {
        let base_url = config.base_url.clone().ok_or_else(|| {
            McpError::Config("MCP base_url is required for HTTP transports.".to_string())
        })?;
        Self::new(
            config.id.clone(),
            base_url,
            config.headers.clone().unwrap_or_default(),
        )
    }

    pub fn new(
        server_id: String,
        base_url: String,
        headers: HashMap<String, String>,
    ) -> Result<Self, McpError> {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Ok(Self {
            server_id,
            base_url,
            headers,
            client: build_http_client()?,
            connected: AtomicBool::new(false),
            session_id: StdMutex::new(None),
            protocol_version: StdMutex::new(None),
            inbound_tx: StdMutex::new(Some(inbound_tx)),
            inbound_rx: Mutex::new(inbound_rx),
            listener_started: AtomicBool::new(false),
            listener: StdMutex::new(None),
        })
    }

    pub fn session_id(&self) -> Option<String> {
        lock_ignoring_poison(&self.session_id).clone()
    }

    fn inbound_sender(&self) -> Option<mpsc::UnboundedSender<String>> {
        lock_ignoring_poison(&self.inbound_tx).clone()
    }

    fn apply_shared_headers(&self, mut request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        for (name, value) in &self.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(version) = lock_ignoring_poison(&self.protocol_version).clone() {
            request = request.header(PROTOCOL_VERSION_HEADER, version);
        }
        if let Some(session_id) = self.session_id() {
            request = request.header(SESSION_ID_HEADER, session_id);
        }
        request
    }

    fn adopt_session(&self, response: &reqwest::Response) {
        let Some(session_id) = response
            .headers()
            .get(SESSION_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.to_string())
        else {
            return;
        };
        *lock_ignoring_poison(&self.session_id) = Some(session_id);
        self.ensure_listener();
    }

    /// Spawns the background GET event stream once a session exists, so
    /// server-initiated frames arrive between request/response exchanges.
    fn ensure_listener(&self) {
        if self.listener_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(tx) = self.inbound_sender() else {
            return;
        };
        let request = self.apply_shared_headers(
            self.client.get(&self.base_url).header("Accept", SSE_ACCEPT),
        );
        let server_id = self.server_id.clone();
        let handle = tokio::spawn(async move {
            let response = match request.send().await {
                Ok(response) => response,
                Err(_) => return,
            };
            if !response.status().is_success() {
                return;
            }
            let content_type = response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|value| value.to_str().ok())
                .unwrap_or("");
            if !is_event_stream_content_type(content_type) {
                return;
            }
            debug!(server_id = %server_id, "MCP event stream attached");
            let mut stream = response.bytes_stream();
            let mut buffer = SseLineBuffer::default();
            while let Some(chunk) = stream.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(_) => return,
                };
                for line in buffer.push(&chunk) {
                    forward_sse_line(&tx, &line);
                }
            }
            for line in buffer.finish() {
                forward_sse_line(&tx, &line);
            }
        });
        *lock_ignoring_poison(&self.listener) = Some(handle);
    }

    async fn queue_response_body(&self, response: reqwest::Response) -> Result<(), McpError> {
        let status = response.status();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("")
            .to_string();

        let Some(tx) = self.inbound_sender() else {
            return Err(McpError::ConnectionClosed);
        };

        if is_event_stream_content_type(&content_type) {
            let mut stream = response.bytes_stream();
            let mut buffer = SseLineBuffer::default();
            while let Some(chunk) = stream.next().await {
                let chunk = chunk.map_err(|err| McpError::connection(err))?;
                for line in buffer.push(&chunk) {
                    forward_sse_line(&tx, &line);
                }
            }
            for line in buffer.finish() {
                forward_sse_line(&tx, &line);
            }
            return Ok(());
        }

        let body = response
            .bytes()
            .await
            .map_err(|err| McpError::connection(err))?;
        let text = String::from_utf8_lossy(&body);
        let trimmed = text.trim();
        // 202 Accepted acknowledges a notification; there is no frame to
        // deliver.
        if trimmed.is_empty() || status == reqwest::StatusCode::ACCEPTED {
            return Ok(());
        }
        let _ = tx.send(trimmed.to_string());
        Ok(())
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn connect(&self) -> Result<(), McpError> {
        if self.connected.swap(true, Ordering::SeqCst) {
            return Err(McpError::Connection(
                "http transport is already connected".to_string(),
            ));
        }
        Ok(())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(handle) = lock_ignoring_poison(&self.listener).take() {
            handle.abort();
        }
        // Dropping the sender closes the inbound queue, which ends a
        // blocked receive with ConnectionClosed.
        lock_ignoring_poison(&self.inbound_tx).take();
    }

    async fn send(&self, frame: &str) -> Result<(), McpError> {
        if !self.is_connected() {
            return Err(McpError::Connection(
                "http transport is not connected".to_string(),
            ));
        }
        debug!(server_id = %self.server_id, url = %self.base_url, "Sending MCP HTTP request");
        let request = self.apply_shared_headers(
            self.client
                .post(&self.base_url)
                .header("Content-Type", JSON_CONTENT_TYPE)
                .header("Accept", JSON_AND_SSE_ACCEPT),
        );
        let response = request
            .body(frame.to_string())
            .send()
            .await
            .map_err(|err| McpError::connection(err))?;

        let status = response.status();
        debug!(server_id = %self.server_id, status = %status, "Received MCP HTTP response");
        if !status.is_success() {
            return Err(McpError::Connection(format!("HTTP error: {status}")));
        }
        self.adopt_session(&response);
        self.queue_response_body(response).await
    }

    async fn receive(&self) -> Result<String, McpError> {
        let mut rx = self.inbound_rx.lock().await;
        match rx.recv().await {
            Some(frame) => Ok(frame),
            None => Err(McpError::ConnectionClosed),
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn set_protocol_version(&self, version: &str) {
        if !version.trim().is_empty() {
            *lock_ignoring_poison(&self.protocol_version) = Some(version.to_string());
        }
    }
}

fn lock_ignoring_poison<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn forward_sse_line(tx: &mpsc::UnboundedSender<String>, line: &str) {
    let Some(payload) = sse_data_payload(line) else {
        return;
    };
    if payload.is_empty() {
        return;
    }
    if tx.send(payload.to_string()).is_err() {
        warn!("Dropping MCP event-stream frame after transport close");
    }
}

pub fn is_event_stream_content_type(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .map(str::trim)
        .is_some_and(|value| value.eq_ignore_ascii_case("text/event-stream"))
}

pub fn sse_data_payload(line: &str) -> Option<&str> {
    line.strip_prefix("data:").map(str::trim)
}

/// Incremental splitter for SSE bodies that arrive in arbitrary chunks.
#[derive(Default)]
pub struct SseLineBuffer {
    buffer: Vec<u8>,
}

impl SseLineBuffer {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        self.drain_lines(false)
    }

    pub fn finish(&mut self) -> Vec<String> {
        self.drain_lines(true)
    }

    fn drain_lines(&mut self, flush: bool) -> Vec<String> {
        let mut lines = Vec::new();
        let mut search_index = 0;

        while let Some(relative_pos) = self.buffer[search_index..].iter().position(|b| *b == b'\n')
        {
            let newline_index = search_index + relative_pos;
            let mut line_end = newline_index;
            if line_end > search_index && self.buffer[line_end - 1] == b'\r' {
                line_end -= 1;
            }

            let line_bytes = &self.buffer[search_index..line_end];
            if let Ok(text) = std::str::from_utf8(line_bytes) {
                let trimmed = text.trim();
                if !trimmed.is_empty() {
                    lines.push(trimmed.to_string());
                }
            }

            search_index = newline_index + 1;
        }

        if flush {
            if let Ok(text) = std::str::from_utf8(&self.buffer[search_index..]) {
                let trimmed = text.trim();
                if !trimmed.is_empty() {
                    lines.push(trimmed.to_string());
                }
            }
            self.buffer.clear();
        } else if search_index > 0 {
            self.buffer.drain(..search_index);
        }

        lines
    }
}
