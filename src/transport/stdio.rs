//! Subprocess stdio transport.
//!
//! The server runs as a child process with piped standard streams; frames
//! are newline-delimited JSON. Stderr is drained by an independent task so
//! a chatty child can never fill its stderr pipe buffer and stall protocol
//! I/O on stdout.

use crate::config::McpServerConfig;
use crate::error::McpError;
use crate::transport::Transport;
use async_trait::async_trait;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, warn};

const WRITE_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub struct StdioTransport {
    server_id: String,
    command: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    shutdown_grace: Duration,
    connected: AtomicBool,
    stdin: Mutex<Option<ChildStdin>>,
    stdout: Mutex<Option<Lines<BufReader<ChildStdout>>>>,
    child: Mutex<Option<Child>>,
}

impl StdioTransport {
    pub fn from_config(config: &McpServerConfig) -> Result<Self, McpError> {
        let command = config.command.clone().ok_or_else(|| {
            McpError::Config("MCP command is required for stdio transport.".to_string())
        })?;
        Ok(Self::new(
            config.id.clone(),
            command,
            config.args.clone().unwrap_or_default(),
            config.env.clone().unwrap_or_default(),
        ))
    }

    pub fn new(
        server_id: String,
        command: String,
        args: Vec<String>,
        env: HashMap<String, String>,
    ) -> Self {
        Self {
            server_id,
            command,
            args,
            env,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            connected: AtomicBool::new(false),
            stdin: Mutex::new(None),
            stdout: Mutex::new(None),
            child: Mutex::new(None),
        }
    }

    fn spawn_stderr_drain(server_id: String, stderr: ChildStderr) {
        tokio::spawn(async move {
            let mut reader = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                let trimmed = line.trim_end();
                if !trimmed.is_empty() {
                    debug!(server_id = %server_id, "mcp stderr: {trimmed}");
                }
            }
        });
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn connect(&self) -> Result<(), McpError> {
        if self.connected.swap(true, Ordering::SeqCst) {
            return Err(McpError::Connection(
                "stdio transport is already connected".to_string(),
            ));
        }

        debug!(
            server_id = %self.server_id,
            command = %self.command,
            args = ?self.args,
            "Starting MCP stdio server"
        );
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if !self.env.is_empty() {
            cmd.envs(&self.env);
        }

        let spawned = (|| -> Result<(Child, ChildStdin, ChildStdout, ChildStderr), McpError> {
            let mut child = cmd.spawn().map_err(|err| McpError::connection(err))?;
            let stdin = child
                .stdin
                .take()
                .ok_or_else(|| McpError::Connection("Unable to retrieve stdin.".to_string()))?;
            let stdout = child
                .stdout
                .take()
                .ok_or_else(|| McpError::Connection("Unable to retrieve stdout.".to_string()))?;
            let stderr = child
                .stderr
                .take()
                .ok_or_else(|| McpError::Connection("Unable to retrieve stderr.".to_string()))?;
            Ok((child, stdin, stdout, stderr))
        })();

        let (child, stdin, stdout, stderr) = match spawned {
            Ok(parts) => parts,
            Err(err) => {
                self.connected.store(false, Ordering::SeqCst);
                return Err(err);
            }
        };

        Self::spawn_stderr_drain(self.server_id.clone(), stderr);
        *self.stdin.lock().await = Some(stdin);
        *self.stdout.lock().await = Some(BufReader::new(stdout).lines());
        *self.child.lock().await = Some(child);
        Ok(())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        // Dropping stdin closes the pipe, which is the graceful shutdown
        // signal for an MCP stdio server.
        self.stdin.lock().await.take();

        let child = self.child.lock().await.take();
        let Some(mut child) = child else {
            return;
        };
        match tokio::time::timeout(self.shutdown_grace, child.wait()).await {
            Ok(Ok(status)) => {
                debug!(server_id = %self.server_id, code = ?status.code(), "MCP stdio server exited");
            }
            Ok(Err(err)) => {
                warn!(server_id = %self.server_id, error = %err, "Failed to reap MCP stdio server");
            }
            Err(_) => {
                warn!(server_id = %self.server_id, "MCP stdio server ignored shutdown; killing");
                let _ = child.start_kill();
                let _ = child.wait().await;
            }
        }
        self.stdout.lock().await.take();
    }

    async fn send(&self, frame: &str) -> Result<(), McpError> {
        let mut guard = self.stdin.lock().await;
        let Some(stdin) = guard.as_mut() else {
            return Err(McpError::Connection(
                "stdio transport is not connected".to_string(),
            ));
        };
        tokio::time::timeout(WRITE_TIMEOUT, async {
            stdin.write_all(frame.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
            stdin.flush().await
        })
        .await
        .map_err(|_| McpError::Connection("Timed out writing MCP stdio frame.".to_string()))?
        .map_err(|err| McpError::connection(err))
    }

    async fn receive(&self) -> Result<String, McpError> {
        let mut guard = self.stdout.lock().await;
        let Some(lines) = guard.as_mut() else {
            return Err(McpError::ConnectionClosed);
        };
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    return Ok(trimmed.to_string());
                }
                Ok(None) => return Err(McpError::ConnectionClosed),
                Err(err) => return Err(McpError::connection(err)),
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh_transport(script: &str) -> StdioTransport {
        StdioTransport::new(
            "alpha".to_string(),
            "sh".to_string(),
            vec!["-c".to_string(), script.to_string()],
            HashMap::new(),
        )
    }

    #[tokio::test]
    async fn connect_fails_for_missing_command() {
        let transport = StdioTransport::new(
            "alpha".to_string(),
            "/definitely-missing-command".to_string(),
            Vec::new(),
            HashMap::new(),
        );
        let err = transport.connect().await.expect_err("spawn should fail");
        assert!(matches!(err, McpError::Connection(_)));
        assert!(!transport.is_connected());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn second_connect_is_an_error() {
        let transport = sh_transport("cat >/dev/null");
        transport.connect().await.expect("first connect succeeds");
        assert!(transport.connect().await.is_err());
        transport.disconnect().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn echoes_one_frame_per_line() {
        let transport = sh_transport("read line; printf '%s\\n' \"$line\"; cat >/dev/null");
        transport.connect().await.expect("connect succeeds");
        transport
            .send("{\"jsonrpc\":\"2.0\",\"id\":0,\"method\":\"ping\"}")
            .await
            .expect("send succeeds");
        let frame = transport.receive().await.expect("frame arrives");
        assert_eq!(frame, "{\"jsonrpc\":\"2.0\",\"id\":0,\"method\":\"ping\"}");
        transport.disconnect().await;
        assert!(!transport.is_connected());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stderr_flood_does_not_block_stdout() {
        // 256 KiB of stderr exceeds any default pipe buffer; without an
        // independent drain the child would stall before reaching stdout.
        let transport = sh_transport(
            "head -c 262144 /dev/zero | tr '\\0' 'x' 1>&2; \
             printf '%s\\n' '{\"jsonrpc\":\"2.0\",\"id\":0,\"result\":{}}'; \
             cat >/dev/null",
        );
        transport.connect().await.expect("connect succeeds");
        let frame = tokio::time::timeout(Duration::from_secs(10), transport.receive())
            .await
            .expect("receive should not deadlock")
            .expect("frame arrives");
        assert_eq!(frame, "{\"jsonrpc\":\"2.0\",\"id\":0,\"result\":{}}");
        transport.disconnect().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn child_exit_surfaces_as_connection_closed() {
        let transport = sh_transport("exit 0");
        transport.connect().await.expect("connect succeeds");
        let err = transport.receive().await.expect_err("stream should end");
        assert!(matches!(err, McpError::ConnectionClosed));
        transport.disconnect().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn disconnect_reaps_the_child() {
        let transport = sh_transport("cat >/dev/null");
        transport.connect().await.expect("connect succeeds");
        transport.disconnect().await;
        assert!(!transport.is_connected());
        assert!(transport.child.lock().await.is_none());
    }
}
