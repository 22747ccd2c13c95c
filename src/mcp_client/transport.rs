//! Transport abstraction.
//!
//! A session only ever sees an [`McpTransport`]: list tools, list resources,
//! read a resource, call a tool, close. Concrete channels (child-process
//! stdio, HTTP event stream) implement [`JsonRpcChannel`] and are wrapped in
//! [`RpcTransport`], which owns the MCP method names and handshake.
//! [`Connector`] is the seam that turns a validated [`SessionConfig`] into an
//! open transport.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::oneshot;

use super::errors::McpError;
use super::sse::SseChannel;
use super::stdio::StdioChannel;
use super::types::{
    error_codes, InitializeResult, JsonRpcResponse, ListResourcesResult, ListToolsResult,
    ResourceDescriptor, SessionConfig, ToolDescriptor,
};

// ─── Constants ───────────────────────────────────────────────────────────────

/// MCP protocol revision sent in the `initialize` request.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Bound on the initialize handshake. A server that never answers counts as a
/// failed open rather than hanging the session in `loading`.
const INIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Upper bound on pages fetched for a single list call.
const MAX_LIST_PAGES: usize = 64;

// ─── Request ID Generator ────────────────────────────────────────────────────

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Generate a unique request ID.
pub fn next_request_id() -> u64 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

// ─── Traits ──────────────────────────────────────────────────────────────────

/// What a session needs from an open connection.
#[async_trait]
pub trait McpTransport: Send + Sync {
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, McpError>;

    async fn list_resources(&self) -> Result<Vec<ResourceDescriptor>, McpError>;

    /// `Ok(None)` means the server answered without a result payload.
    async fn read_resource(&self, uri: &str) -> Result<Option<Value>, McpError>;

    /// `Ok(None)` means the server answered without a result payload.
    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Option<Value>, McpError>;

    async fn close(&self) -> Result<(), McpError>;
}

/// Opens transports from session configs.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(
        &self,
        name: &str,
        config: &SessionConfig,
    ) -> Result<Arc<dyn McpTransport>, McpError>;
}

/// A bidirectional JSON-RPC message channel.
#[async_trait]
pub trait JsonRpcChannel: Send + Sync {
    /// Name of the session the channel belongs to (for error context).
    fn session_name(&self) -> &str;

    /// Send a request and wait for the response with the same id.
    async fn request(&self, method: &str, params: Option<Value>)
        -> Result<JsonRpcResponse, McpError>;

    /// Send a notification (no response expected).
    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError>;

    /// Tear the channel down. Must be safe to call more than once.
    async fn shutdown(&self) -> Result<(), McpError>;

    /// Extra diagnostic text to append to handshake failures.
    fn diagnostics(&self) -> String {
        String::new()
    }
}

// ─── Pending Requests ────────────────────────────────────────────────────────

/// Response routing table shared between a channel's writer and its reader
/// task. Dropping the senders (via `fail_all`) wakes every waiter with an
/// error.
#[derive(Debug, Clone, Default)]
pub struct PendingRequests {
    inner: Arc<Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>>,
}

impl PendingRequests {
    pub fn register(&self, id: u64) -> oneshot::Receiver<JsonRpcResponse> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, tx);
        rx
    }

    /// Hand a response to its waiter. Returns false if nobody was waiting.
    pub fn resolve(&self, response: JsonRpcResponse) -> bool {
        let tx = self
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&response.id);
        match tx {
            Some(tx) => tx.send(response).is_ok(),
            None => false,
        }
    }

    pub fn forget(&self, id: u64) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }

    pub fn fail_all(&self) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Parse one line of channel output as a JSON-RPC response.
///
/// Server-initiated requests, notifications, and log noise yield `None`.
/// A response must carry `result` or `error` and no `method`, so a server
/// request that reuses one of our ids is never mistaken for its answer.
pub fn parse_response_line(line: &str) -> Option<JsonRpcResponse> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    let value: Value = serde_json::from_str(trimmed).ok()?;
    let message = value.as_object()?;
    if message.contains_key("method")
        || !(message.contains_key("result") || message.contains_key("error"))
    {
        return None;
    }
    serde_json::from_value(value).ok()
}

// ─── Response Helpers ────────────────────────────────────────────────────────

/// Extract the result from a JSON-RPC response, converting errors to `McpError`.
///
/// A response with neither `result` nor `error`, or with `"result": null`,
/// is `Ok(None)`; callers decide whether that is acceptable.
pub fn extract_result(response: JsonRpcResponse) -> Result<Option<Value>, McpError> {
    if let Some(err) = response.error {
        return Err(McpError::Server {
            code: err.code,
            message: err.message,
            data: err.data,
        });
    }
    Ok(response.result.filter(|v| !v.is_null()))
}

// ─── RpcTransport ────────────────────────────────────────────────────────────

/// MCP method layer over any [`JsonRpcChannel`].
pub struct RpcTransport<C> {
    channel: C,
}

impl<C: JsonRpcChannel> RpcTransport<C> {
    pub fn new(channel: C) -> Self {
        Self { channel }
    }

    /// Run the initialize handshake. On failure the channel is shut down and
    /// the error is reported as a failed open.
    pub async fn initialize(channel: C) -> Result<Self, McpError> {
        let name = channel.session_name().to_string();
        let params = serde_json::json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
            },
        });

        let handshake = async {
            let response = channel.request("initialize", Some(params)).await?;
            let result = extract_result(response)?.unwrap_or(Value::Null);
            let init: InitializeResult =
                serde_json::from_value(result).map_err(|e| McpError::Transport {
                    session: name.clone(),
                    reason: format!("failed to parse initialize response: {e}"),
                })?;
            channel.notify("notifications/initialized", None).await?;
            Ok::<_, McpError>(init)
        };

        let outcome = tokio::time::timeout(INIT_TIMEOUT, handshake).await;
        let reason = match outcome {
            Ok(Ok(init)) => {
                tracing::debug!(
                    session = %name,
                    protocol = ?init.protocol_version,
                    server = ?init.server_info.as_ref().and_then(|s| s.name.as_deref()),
                    "MCP handshake complete"
                );
                return Ok(Self { channel });
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("initialization timed out after {}s", INIT_TIMEOUT.as_secs()),
        };

        let diagnostics = channel.diagnostics();
        if let Err(e) = channel.shutdown().await {
            tracing::debug!(session = %name, error = %e, "shutdown after failed handshake");
        }
        Err(McpError::TransportOpen {
            name,
            reason: format!("{reason}{}", format_diagnostics_suffix(&diagnostics)),
        })
    }

    async fn call(&self, method: &str, params: Option<Value>) -> Result<Option<Value>, McpError> {
        let response = self.channel.request(method, params).await?;
        extract_result(response)
    }

    /// Fetch every page of a cursor-paginated list method.
    async fn list_all<T>(
        &self,
        method: &str,
        mut parse: impl FnMut(Value) -> Result<(Vec<T>, Option<String>), serde_json::Error>,
    ) -> Result<Vec<T>, McpError> {
        let mut items = Vec::new();
        let mut cursor: Option<String> = None;
        for _ in 0..MAX_LIST_PAGES {
            let params = cursor.as_ref().map(|c| serde_json::json!({ "cursor": c }));
            let result = self
                .call(method, params)
                .await?
                .ok_or_else(|| McpError::Transport {
                    session: self.channel.session_name().to_string(),
                    reason: format!("{method} returned no result"),
                })?;
            let (page, next) = parse(result).map_err(|e| McpError::Transport {
                session: self.channel.session_name().to_string(),
                reason: format!("malformed {method} response: {e}"),
            })?;
            items.extend(page);
            match next {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => return Ok(items),
            }
        }
        tracing::warn!(
            session = %self.channel.session_name(),
            method,
            pages = MAX_LIST_PAGES,
            "list pagination limit reached, truncating"
        );
        Ok(items)
    }
}

#[async_trait]
impl<C: JsonRpcChannel> McpTransport for RpcTransport<C> {
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, McpError> {
        self.list_all("tools/list", |value| {
            let next = next_cursor(&value);
            let page: ListToolsResult = serde_json::from_value(value)?;
            Ok((page.tools, next))
        })
        .await
    }

    async fn list_resources(&self) -> Result<Vec<ResourceDescriptor>, McpError> {
        let listed = self
            .list_all("resources/list", |value| {
                let next = next_cursor(&value);
                let page: ListResourcesResult = serde_json::from_value(value)?;
                Ok((page.resources, next))
            })
            .await;
        match listed {
            // Servers without resource support are not broken.
            Err(McpError::Server { code, .. }) if code == error_codes::METHOD_NOT_FOUND => {
                Ok(Vec::new())
            }
            other => other,
        }
    }

    async fn read_resource(&self, uri: &str) -> Result<Option<Value>, McpError> {
        self.call("resources/read", Some(serde_json::json!({ "uri": uri })))
            .await
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Option<Value>, McpError> {
        let params = serde_json::json!({
            "name": name,
            "arguments": arguments,
        });
        self.call("tools/call", Some(params)).await
    }

    async fn close(&self) -> Result<(), McpError> {
        self.channel.shutdown().await
    }
}

fn next_cursor(value: &Value) -> Option<String> {
    value
        .get("nextCursor")
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Format a diagnostics suffix for error messages (empty string if none).
fn format_diagnostics_suffix(diagnostics: &str) -> String {
    if diagnostics.trim().is_empty() {
        String::new()
    } else {
        format!(" | stderr: {}", diagnostics.trim())
    }
}

// ─── DefaultConnector ────────────────────────────────────────────────────────

/// Opens stdio transports for subprocess configs and SSE transports for
/// stream configs.
#[derive(Debug, Clone, Default)]
pub struct DefaultConnector {
    probe_streams: bool,
}

impl DefaultConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Probe stream endpoints for reachability before connecting. A failed
    /// probe is logged and the connection is attempted anyway.
    pub fn with_stream_probe(mut self, enabled: bool) -> Self {
        self.probe_streams = enabled;
        self
    }
}

#[async_trait]
impl Connector for DefaultConnector {
    async fn open(
        &self,
        name: &str,
        config: &SessionConfig,
    ) -> Result<Arc<dyn McpTransport>, McpError> {
        match config {
            SessionConfig::Subprocess(c) => {
                let channel = StdioChannel::spawn(name, c)?;
                Ok(Arc::new(RpcTransport::initialize(channel).await?))
            }
            SessionConfig::Stream(c) => {
                let channel = SseChannel::connect(name, c, self.probe_streams).await?;
                Ok(Arc::new(RpcTransport::initialize(channel).await?))
            }
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
