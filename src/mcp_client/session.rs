//! One named connection to one MCP server.
//!
//! State machine:
//!
//! ```text
//! disconnected --connect--> loading --ok--> connected
//!                              \--err--> disconnected (error kept)
//! connected --disconnect / idle timeout / failed call--> disconnected
//! ```
//!
//! `loading` is never stored: it is read off the session's [`Locker`]. All
//! transport opens and closes for a session happen while holding that locker,
//! so at most one transport is ever live per session and a close never races
//! an open.
//!
//! Invocations are counted while they run. The idle close and the
//! always-reconnect close both leave a transport alone while another call is
//! still using it.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::errors::McpError;
use super::idle::DebounceTimer;
use super::locker::Locker;
use super::transport::{Connector, McpTransport};
use super::types::{
    ResourceDescriptor, SessionConfig, SessionSnapshot, SessionStatus, ToolDescriptor,
};

// ─── Options ─────────────────────────────────────────────────────────────────

/// Connection policy shared by the sessions of a registry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionOptions {
    /// Disconnect after this long with no invocation running.
    pub idle_timeout: Option<Duration>,
    /// Drop any cached connection and reconnect before every invocation.
    /// For hosts whose connections do not survive between requests.
    pub always_reconnect: bool,
}

impl SessionOptions {
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    pub fn with_always_reconnect(mut self, enabled: bool) -> Self {
        self.always_reconnect = enabled;
        self
    }
}

// ─── Session ─────────────────────────────────────────────────────────────────

#[derive(Default)]
struct SessionState {
    transport: Option<Arc<dyn McpTransport>>,
    connected: bool,
    error: Option<String>,
    tools: Vec<ToolDescriptor>,
    resources: Vec<ResourceDescriptor>,
    in_flight: usize,
}

/// Which closes `close_transport` should go through with.
#[derive(Clone, Copy)]
enum CloseWhen<'a> {
    Always,
    /// Only if the live transport is still this one.
    Current(&'a Arc<dyn McpTransport>),
    /// Only if no more than this many invocations are running.
    InFlightAtMost(usize),
}

/// A managed connection to one MCP server.
pub struct Session {
    name: String,
    config: SessionConfig,
    options: SessionOptions,
    connector: Arc<dyn Connector>,
    locker: Locker,
    idle: DebounceTimer,
    state: Mutex<SessionState>,
    retired: AtomicBool,
    /// Finished connect attempts. Tells a waiter whether the lock it waited
    /// on was held by a connect or by a close.
    attempts: AtomicU64,
    this: Weak<Session>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("name", &self.name)
            .field("transport", &self.config.transport_label())
            .field("status", &self.status())
            .finish()
    }
}

fn same_transport(a: &Arc<dyn McpTransport>, b: &Arc<dyn McpTransport>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

impl Session {
    /// Create a disconnected session. Nothing is opened until `connect()`.
    pub fn new(
        name: &str,
        config: SessionConfig,
        options: SessionOptions,
        connector: Arc<dyn Connector>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            name: name.to_string(),
            config,
            options,
            connector,
            locker: Locker::new(),
            idle: DebounceTimer::new(),
            state: Mutex::new(SessionState::default()),
            retired: AtomicBool::new(false),
            attempts: AtomicU64::new(0),
            this: this.clone(),
        })
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    // ─── Status ──────────────────────────────────────────────────────────

    pub fn status(&self) -> SessionStatus {
        if self.locker.is_locked() {
            SessionStatus::Loading
        } else if self.state().connected {
            SessionStatus::Connected
        } else {
            SessionStatus::Disconnected
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state().connected
    }

    /// Message of the last connect or invocation failure, cleared on connect.
    pub fn last_error(&self) -> Option<String> {
        self.state().error.clone()
    }

    /// Tools found by the last successful discovery.
    pub fn tools(&self) -> Vec<ToolDescriptor> {
        self.state().tools.clone()
    }

    /// Resources found by the last successful discovery.
    pub fn resources(&self) -> Vec<ResourceDescriptor> {
        self.state().resources.clone()
    }

    /// Side-effect-free view of the session for status displays.
    pub fn snapshot(&self) -> SessionSnapshot {
        let status = self.status();
        let state = self.state();
        SessionSnapshot {
            name: self.name.clone(),
            transport: self.config.transport_label().to_string(),
            status,
            error: state.error.clone(),
            tools: state.tools.clone(),
            resources: state.resources.clone(),
            checked_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// Invokable handles for each discovered tool, keyed by bare tool name.
    pub fn tool_map(&self) -> BTreeMap<String, SessionTool> {
        let Some(session) = self.this.upgrade() else {
            return BTreeMap::new();
        };
        self.state()
            .tools
            .iter()
            .map(|descriptor| {
                (
                    descriptor.name.clone(),
                    SessionTool {
                        session: session.clone(),
                        descriptor: descriptor.clone(),
                    },
                )
            })
            .collect()
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Connect if not already connected, and return the resulting status.
    ///
    /// Concurrent callers share a single attempt: whoever loses the race waits
    /// for the winner to finish instead of opening a second transport.
    /// Failures are never returned; they are stored and visible through
    /// `status()` and `last_error()`.
    pub async fn connect(&self) -> SessionStatus {
        loop {
            if !self.locker.is_locked() && self.is_connected() {
                return SessionStatus::Connected;
            }
            let seen = self.attempts.load(Ordering::SeqCst);
            let Some(guard) = self.locker.try_lock() else {
                self.locker.wait().await;
                if self.attempts.load(Ordering::SeqCst) == seen {
                    // The holder was closing, not connecting.
                    continue;
                }
                return self.status();
            };
            // Another attempt may have completed between the checks above.
            if self.is_connected() {
                return SessionStatus::Connected;
            }
            if self.is_retired() {
                self.state().error = Some("session was removed".to_string());
                return SessionStatus::Disconnected;
            }

            tracing::info!(
                session = %self.name,
                transport = self.config.transport_label(),
                "connecting MCP session"
            );
            let connected = match self.open_and_discover().await {
                Ok((transport, tools, resources)) => {
                    tracing::info!(
                        session = %self.name,
                        tools = tools.len(),
                        resources = resources.len(),
                        "MCP session connected"
                    );
                    let mut state = self.state();
                    state.transport = Some(transport);
                    state.connected = true;
                    state.error = None;
                    state.tools = tools;
                    state.resources = resources;
                    true
                }
                Err(e) => {
                    tracing::warn!(session = %self.name, error = %e, "MCP session failed to connect");
                    let mut state = self.state();
                    state.transport = None;
                    state.connected = false;
                    state.error = Some(e.to_string());
                    state.tools.clear();
                    state.resources.clear();
                    false
                }
            };
            self.attempts.fetch_add(1, Ordering::SeqCst);
            drop(guard);

            return if connected {
                self.schedule_idle_disconnect();
                SessionStatus::Connected
            } else {
                SessionStatus::Disconnected
            };
        }
    }

    /// Open a transport and run discovery. Tool discovery failure is fatal
    /// (and closes the fresh transport); resource discovery failure is not.
    async fn open_and_discover(
        &self,
    ) -> Result<
        (
            Arc<dyn McpTransport>,
            Vec<ToolDescriptor>,
            Vec<ResourceDescriptor>,
        ),
        McpError,
    > {
        let transport = self.connector.open(&self.name, &self.config).await?;

        let tools = match transport.list_tools().await {
            Ok(tools) => tools,
            Err(e) => {
                if let Err(close_err) = transport.close().await {
                    tracing::warn!(session = %self.name, error = %close_err, "close after failed discovery");
                }
                return Err(McpError::Discovery {
                    name: self.name.clone(),
                    reason: e.to_string(),
                });
            }
        };

        let resources = match transport.list_resources().await {
            Ok(resources) => resources,
            Err(e) => {
                let err = McpError::ResourceDiscovery {
                    name: self.name.clone(),
                    reason: e.to_string(),
                };
                tracing::warn!(session = %self.name, error = %err, "continuing without resources");
                Vec::new()
            }
        };

        Ok((transport, tools, resources))
    }

    /// Close the transport, after any in-flight connect has finished.
    /// Close errors are logged, never returned.
    pub async fn disconnect(&self) {
        self.idle.cancel();
        self.close_transport(CloseWhen::Always).await;
    }

    /// Disconnect for good: later `connect()` calls do nothing. Used when the
    /// session leaves its registry, so handles held elsewhere cannot reopen it.
    pub async fn retire(&self) {
        self.retired.store(true, Ordering::SeqCst);
        self.disconnect().await;
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }

    /// Close the current transport if `when` still holds once any in-flight
    /// connect has finished. Returns whether it went ahead.
    async fn close_transport(&self, when: CloseWhen<'_>) -> bool {
        let _guard = self.locker.lock().await;
        let transport = {
            let mut state = self.state();
            let applies = match when {
                CloseWhen::Always => true,
                CloseWhen::Current(expected) => state
                    .transport
                    .as_ref()
                    .is_some_and(|current| same_transport(expected, current)),
                CloseWhen::InFlightAtMost(limit) => state.in_flight <= limit,
            };
            if !applies {
                return false;
            }
            state.connected = false;
            state.transport.take()
        };
        if let Some(transport) = transport {
            tracing::info!(session = %self.name, "closing MCP session");
            if let Err(e) = transport.close().await {
                tracing::warn!(session = %self.name, error = %e, "error closing MCP transport");
            }
        }
        true
    }

    fn schedule_idle_disconnect(&self) {
        let Some(timeout) = self.options.idle_timeout else {
            return;
        };
        let this = self.this.clone();
        self.idle.schedule(timeout, async move {
            let Some(session) = this.upgrade() else {
                return;
            };
            // Not `disconnect()`: that would cancel this very task. A running
            // call reschedules the timer when it finishes.
            if session.close_transport(CloseWhen::InFlightAtMost(0)).await {
                tracing::info!(
                    session = %session.name,
                    idle_secs = timeout.as_secs_f64(),
                    "MCP session idle, disconnected"
                );
            } else {
                tracing::debug!(session = %session.name, "idle timer fired during a call");
            }
        });
    }

    // ─── Invocation ──────────────────────────────────────────────────────

    /// Connect (or reuse the live connection) and return its transport,
    /// with the call counted as in flight until the marker drops.
    async fn ensure_transport(
        &self,
    ) -> Result<(Arc<dyn McpTransport>, InFlight<'_>), McpError> {
        let in_flight = InFlight::enter(self);
        if self.options.always_reconnect {
            // Calls that overlap share one connection.
            self.close_transport(CloseWhen::InFlightAtMost(1)).await;
        }
        self.connect().await;

        let transport = {
            let state = self.state();
            match (&state.transport, state.connected) {
                (Some(transport), true) => Ok(transport.clone()),
                _ => Err(McpError::SessionUnavailable {
                    session: self.name.clone(),
                    reason: state
                        .error
                        .clone()
                        .unwrap_or_else(|| "not connected".to_string()),
                }),
            }
        };
        Ok((transport?, in_flight))
    }

    /// After a failed call, drop the connection so the next call starts clean.
    async fn mark_failed(&self, transport: &Arc<dyn McpTransport>, err: &McpError) {
        tracing::warn!(session = %self.name, error = %err, "MCP call failed, dropping connection");
        self.state().error = Some(err.to_string());
        self.idle.cancel();
        self.close_transport(CloseWhen::Current(transport)).await;
    }

    /// Call a tool on this session.
    ///
    /// If `cancel` is already triggered when the call is about to be sent,
    /// nothing is sent. Any failure disconnects the session; there is no
    /// retry here, the next call reconnects.
    pub async fn invoke(
        &self,
        tool: &str,
        input: Value,
        cancel: Option<&CancellationToken>,
    ) -> Result<Value, McpError> {
        let (transport, _in_flight) = self.ensure_transport().await?;

        let known = {
            let state = self.state();
            state.tools.iter().any(|t| t.name == tool)
        };
        if !known {
            return Err(McpError::UnknownTool {
                session: self.name.clone(),
                tool: tool.to_string(),
            });
        }

        if cancel.is_some_and(CancellationToken::is_cancelled) {
            return Err(McpError::Cancelled {
                session: self.name.clone(),
                tool: tool.to_string(),
            });
        }

        tracing::debug!(session = %self.name, tool, "invoking MCP tool");
        let err = match transport.call_tool(tool, input).await {
            Ok(Some(result)) => return Ok(result),
            Ok(None) => McpError::EmptyResult {
                session: self.name.clone(),
                tool: tool.to_string(),
            },
            Err(e) => McpError::Invocation {
                session: self.name.clone(),
                tool: tool.to_string(),
                reason: e.to_string(),
            },
        };
        self.mark_failed(&transport, &err).await;
        Err(err)
    }

    /// Read a resource by URI, with the same connection policy as `invoke`.
    pub async fn read_resource(
        &self,
        uri: &str,
        cancel: Option<&CancellationToken>,
    ) -> Result<Value, McpError> {
        let (transport, _in_flight) = self.ensure_transport().await?;

        if cancel.is_some_and(CancellationToken::is_cancelled) {
            return Err(McpError::Cancelled {
                session: self.name.clone(),
                tool: uri.to_string(),
            });
        }

        let err = match transport.read_resource(uri).await {
            Ok(Some(result)) => return Ok(result),
            Ok(None) => McpError::EmptyResult {
                session: self.name.clone(),
                tool: uri.to_string(),
            },
            Err(e) => McpError::Invocation {
                session: self.name.clone(),
                tool: uri.to_string(),
                reason: e.to_string(),
            },
        };
        self.mark_failed(&transport, &err).await;
        Err(err)
    }
}

/// Counts one running invocation. When the last one finishes on a live
/// connection, the idle countdown restarts.
struct InFlight<'a> {
    session: &'a Session,
}

impl<'a> InFlight<'a> {
    fn enter(session: &'a Session) -> Self {
        session.state().in_flight += 1;
        Self { session }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let idle = {
            let mut state = self.session.state();
            state.in_flight -= 1;
            state.in_flight == 0 && state.connected
        };
        if idle {
            self.session.schedule_idle_disconnect();
        }
    }
}

// ─── SessionTool ─────────────────────────────────────────────────────────────

/// A discovered tool bound to the session that serves it.
#[derive(Debug, Clone)]
pub struct SessionTool {
    session: Arc<Session>,
    descriptor: ToolDescriptor,
}

impl SessionTool {
    pub fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub async fn call(
        &self,
        input: Value,
        cancel: Option<&CancellationToken>,
    ) -> Result<Value, McpError> {
        self.session
            .invoke(&self.descriptor.name, input, cancel)
            .await
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
