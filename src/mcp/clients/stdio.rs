//! Stdio child-process transport
//!
//! Spawns the configured command with a deterministically computed
//! environment. stdout/stdin carry the MCP wire protocol line by line;
//! stderr is bridged into the gateway log at `warn`. Exits are reported on
//! the event channel with an abnormal flag; the restart policy itself lives
//! with the connection manager.

use crate::config::{compute_environment, OutboundServerSpec};
use crate::error::{GatewayError, Result};
use crate::mcp::clients::{Transport, TransportEvent};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::{timeout, Duration};
use tracing::{debug, error, info, warn};

/// Bounded wait for a killed child to exit
const KILL_WAIT: Duration = Duration::from_secs(5);

/// One spawned MCP server process
pub struct StdioTransport {
    spec: Arc<OutboundServerSpec>,
    stdin_tx: Mutex<Option<mpsc::UnboundedSender<String>>>,
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl StdioTransport {
    pub fn new(spec: Arc<OutboundServerSpec>) -> Self {
        Self {
            spec,
            stdin_tx: Mutex::new(None),
            kill_tx: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn start(&self) -> Result<mpsc::UnboundedReceiver<TransportEvent>> {
        let name = self.spec.name.clone();
        let command = self.spec.command.as_deref().ok_or_else(|| {
            GatewayError::config(format!("Stdio server '{}' has no command", name))
        })?;

        let parent_env: HashMap<String, String> = std::env::vars().collect();
        let env = compute_environment(
            self.spec.inherit_parent_env,
            &self.spec.env_filter,
            &self.spec.env,
            &parent_env,
        );

        let mut cmd = Command::new(command);
        cmd.args(&self.spec.args)
            .env_clear()
            .envs(&env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &self.spec.cwd {
            cmd.current_dir(cwd);
        }

        info!("Starting stdio MCP server '{}': {} {:?}", name, command, self.spec.args);
        let mut child = cmd.spawn().map_err(|e| {
            GatewayError::connection(format!("Failed to spawn MCP server '{}': {}", name, e))
        })?;

        let stdin = child.stdin.take().ok_or_else(|| {
            GatewayError::connection(format!("Failed to get stdin for MCP server '{}'", name))
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            GatewayError::connection(format!("Failed to get stdout for MCP server '{}'", name))
        })?;
        let stderr = child.stderr.take().ok_or_else(|| {
            GatewayError::connection(format!("Failed to get stderr for MCP server '{}'", name))
        })?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();

        // Stdin writer task
        let (stdin_tx, mut stdin_rx) = mpsc::unbounded_channel::<String>();
        *self.stdin_tx.lock().await = Some(stdin_tx);
        let writer_name = name.clone();
        tokio::spawn(async move {
            let mut stdin = stdin;
            while let Some(message) = stdin_rx.recv().await {
                if let Err(e) = stdin.write_all(message.as_bytes()).await {
                    error!("Failed to write to MCP server '{}' stdin: {}", writer_name, e);
                    break;
                }
                if let Err(e) = stdin.write_all(b"\n").await {
                    error!("Failed to write newline to MCP server '{}' stdin: {}", writer_name, e);
                    break;
                }
                if let Err(e) = stdin.flush().await {
                    error!("Failed to flush MCP server '{}' stdin: {}", writer_name, e);
                    break;
                }
            }
        });

        // Stdout reader task: one JSON-RPC envelope per line
        let reader_name = name.clone();
        let reader_events = events_tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let line = line.trim().to_string();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<Value>(&line) {
                    Ok(envelope) => {
                        if reader_events.send(TransportEvent::Message(envelope)).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("Non-JSON line from MCP server '{}' stdout: {} ({})", reader_name, line, e);
                    }
                }
            }
            debug!("MCP server '{}' stdout reader ended", reader_name);
        });

        // Stderr bridge task
        let stderr_name = name.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                warn!("[{}] {}", stderr_name, line);
            }
        });

        // Exit watch task: owns the child, races wait() against close()
        let (kill_tx, mut kill_rx) = oneshot::channel::<()>();
        *self.kill_tx.lock().await = Some(kill_tx);
        let watch_name = name.clone();
        tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => {
                    match status {
                        Ok(status) => {
                            let abnormal = !status.success();
                            let reason = format!("process exited with {}", status);
                            if abnormal {
                                warn!("MCP server '{}' {}", watch_name, reason);
                            } else {
                                info!("MCP server '{}' {}", watch_name, reason);
                            }
                            let _ = events_tx.send(TransportEvent::Closed { reason, abnormal });
                        }
                        Err(e) => {
                            error!("Failed to wait on MCP server '{}': {}", watch_name, e);
                            let _ = events_tx.send(TransportEvent::Closed {
                                reason: format!("wait failed: {}", e),
                                abnormal: true,
                            });
                        }
                    }
                }
                _ = &mut kill_rx => {
                    if let Err(e) = child.kill().await {
                        warn!("Failed to kill MCP server '{}': {}", watch_name, e);
                    }
                    match timeout(KILL_WAIT, child.wait()).await {
                        Ok(Ok(status)) => {
                            info!("MCP server '{}' stopped with status: {}", watch_name, status);
                        }
                        Ok(Err(e)) => {
                            error!("Error waiting for MCP server '{}' to exit: {}", watch_name, e);
                        }
                        Err(_) => {
                            warn!("MCP server '{}' did not exit within timeout", watch_name);
                        }
                    }
                    let _ = events_tx.send(TransportEvent::Closed {
                        reason: "closed by gateway".to_string(),
                        abnormal: false,
                    });
                }
            }
        });

        Ok(events_rx)
    }

    async fn send(&self, envelope: Value) -> Result<()> {
        let message = serde_json::to_string(&envelope)?;
        let guard = self.stdin_tx.lock().await;
        match guard.as_ref() {
            Some(sender) => sender.send(message).map_err(|_| {
                GatewayError::not_connected(self.spec.name.clone())
            }),
            None => Err(GatewayError::not_connected(self.spec.name.clone())),
        }
    }

    async fn close(&self) {
        self.stdin_tx.lock().await.take();
        if let Some(kill) = self.kill_tx.lock().await.take() {
            let _ = kill.send(());
        }
    }
}
