//! Child-process stdio channel.
//!
//! Spawns the configured command with piped stdio and speaks line-delimited
//! JSON-RPC 2.0: one JSON object per line on stdin, responses read from
//! stdout by a background task and routed to waiters by id. Stderr is drained
//! continuously (a full pipe would stall the child) and the last few lines are
//! kept for handshake-failure diagnostics.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::ffi::OsString;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::task::JoinHandle;

use super::errors::McpError;
use super::transport::{next_request_id, parse_response_line, JsonRpcChannel, PendingRequests};
use super::types::{JsonRpcRequest, JsonRpcResponse, SubprocessConfig};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Timeout for graceful exit after stdin is closed, before force-killing.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Stderr lines retained for diagnostics.
const STDERR_TAIL_LINES: usize = 20;

/// Max characters of stderr attached to an error message.
const STDERR_MAX_CHARS: usize = 2000;

// ─── Environment ─────────────────────────────────────────────────────────────

/// Host environment overlaid with the configured variables (configured keys win).
pub fn merged_env(configured: &BTreeMap<String, String>) -> HashMap<OsString, OsString> {
    let mut env: HashMap<OsString, OsString> = std::env::vars_os().collect();
    env.extend(
        configured
            .iter()
            .map(|(k, v)| (OsString::from(k), OsString::from(v))),
    );
    env
}

// ─── StdioChannel ────────────────────────────────────────────────────────────

/// JSON-RPC channel over a child process's stdin/stdout.
pub struct StdioChannel {
    session: String,
    process: tokio::sync::Mutex<Option<Child>>,
    writer: tokio::sync::Mutex<Option<ChildStdin>>,
    pending: PendingRequests,
    stdout_closed: Arc<AtomicBool>,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl StdioChannel {
    /// Spawn the configured process and start its reader tasks.
    pub fn spawn(session: &str, config: &SubprocessConfig) -> Result<Self, McpError> {
        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args);
        cmd.env_clear();
        cmd.envs(merged_env(&config.env));
        if let Some(dir) = config.working_dir.as_deref() {
            cmd.current_dir(dir);
        }

        // Windows: prevent console window from appearing for child processes
        #[cfg(target_os = "windows")]
        {
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.kill_on_drop(true);

        tracing::debug!(
            session,
            command = %config.command,
            args = ?config.args,
            cwd = ?config.working_dir,
            "spawning MCP stdio server"
        );

        let mut child = cmd.spawn().map_err(|e| McpError::TransportOpen {
            name: session.to_string(),
            reason: format!("failed to spawn '{}': {e}", config.command),
        })?;

        let stdin = child.stdin.take().ok_or_else(|| McpError::TransportOpen {
            name: session.to_string(),
            reason: "failed to capture stdin".into(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| McpError::TransportOpen {
            name: session.to_string(),
            reason: "failed to capture stdout".into(),
        })?;
        let stderr = child.stderr.take();

        let pending = PendingRequests::default();
        let stdout_closed = Arc::new(AtomicBool::new(false));
        let stderr_tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));

        let mut tasks = Vec::with_capacity(2);
        {
            let pending = pending.clone();
            let closed = stdout_closed.clone();
            let session = session.to_string();
            tasks.push(tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    match parse_response_line(&line) {
                        Some(resp) => {
                            if !pending.resolve(resp) {
                                tracing::debug!(session = %session, "dropping unmatched response");
                            }
                        }
                        None => tracing::trace!(session = %session, line = %line, "non-response stdout line"),
                    }
                }
                tracing::debug!(session = %session, "server stdout closed");
                closed.store(true, Ordering::SeqCst);
                pending.fail_all();
            }));
        }
        if let Some(stderr) = stderr {
            let tail = stderr_tail.clone();
            let session = session.to_string();
            tasks.push(tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(session = %session, stderr = %line, "server stderr");
                    let mut tail = tail.lock().unwrap_or_else(PoisonError::into_inner);
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
            }));
        }

        Ok(Self {
            session: session.to_string(),
            process: tokio::sync::Mutex::new(Some(child)),
            writer: tokio::sync::Mutex::new(Some(stdin)),
            pending,
            stdout_closed,
            stderr_tail,
            tasks: Mutex::new(tasks),
        })
    }

    fn transport_error(&self, reason: String) -> McpError {
        McpError::Transport {
            session: self.session.clone(),
            reason,
        }
    }

    async fn write_line(&self, value: &impl serde::Serialize) -> Result<(), McpError> {
        let mut json = serde_json::to_string(value)
            .map_err(|e| self.transport_error(format!("failed to serialize message: {e}")))?;
        json.push('\n');

        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| self.transport_error("channel is closed".into()))?;
        writer
            .write_all(json.as_bytes())
            .await
            .map_err(|e| self.transport_error(format!("failed to write to stdin: {e}")))?;
        writer
            .flush()
            .await
            .map_err(|e| self.transport_error(format!("failed to flush stdin: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl JsonRpcChannel for StdioChannel {
    fn session_name(&self) -> &str {
        &self.session
    }

    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<JsonRpcResponse, McpError> {
        let id = next_request_id();
        let rx = self.pending.register(id);
        if self.stdout_closed.load(Ordering::SeqCst) {
            self.pending.forget(id);
            return Err(self.transport_error("server stdout is closed".into()));
        }
        if let Err(e) = self.write_line(&JsonRpcRequest::new(id, method, params)).await {
            self.pending.forget(id);
            return Err(e);
        }
        rx.await.map_err(|_| {
            self.transport_error("server stdout closed (process may have exited)".into())
        })
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError> {
        let notification = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        });
        self.write_line(&notification).await
    }

    async fn shutdown(&self) -> Result<(), McpError> {
        if let Err(e) = self.notify("shutdown", None).await {
            tracing::trace!(session = %self.session, error = %e, "shutdown notification not sent");
        }
        // Closing stdin is the stdio transport's shutdown signal.
        drop(self.writer.lock().await.take());

        let child = self.process.lock().await.take();
        if let Some(mut child) = child {
            match tokio::time::timeout(SHUTDOWN_TIMEOUT, child.wait()).await {
                Ok(Ok(status)) => {
                    tracing::debug!(session = %self.session, %status, "server exited");
                }
                _ => {
                    tracing::debug!(session = %self.session, "server did not exit, killing");
                    if let Err(e) = child.kill().await {
                        return Err(self.transport_error(format!("failed to kill server: {e}")));
                    }
                }
            }
        }

        for task in self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            task.abort();
        }
        self.pending.fail_all();
        Ok(())
    }

    fn diagnostics(&self) -> String {
        let tail = self
            .stderr_tail
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut text = tail.iter().cloned().collect::<Vec<_>>().join("\n");
        if text.len() > STDERR_MAX_CHARS {
            let mut cut = STDERR_MAX_CHARS;
            while !text.is_char_boundary(cut) {
                cut -= 1;
            }
            text.truncate(cut);
            text.push_str("...(truncated)");
        }
        text
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
