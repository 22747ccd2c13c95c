//! MCP session error types.
//!
//! `connect()` and `disconnect()` never return these to their callers; they
//! are stored on the session as its last error. Only invocation paths and
//! registry/store mutations surface them.

use thiserror::Error;

/// Errors that can occur while managing MCP client sessions.
#[derive(Debug, Error)]
pub enum McpError {
    /// A session configuration (or session name) is malformed.
    #[error("invalid config for '{name}': {reason}")]
    ConfigValidation { name: String, reason: String },

    /// The transport could not be opened (spawn failure, unreachable endpoint,
    /// failed handshake).
    #[error("failed to open transport for '{name}': {reason}")]
    TransportOpen { name: String, reason: String },

    /// Listing the session's tools failed. Fatal to the connect attempt.
    #[error("tool discovery failed for '{name}': {reason}")]
    Discovery { name: String, reason: String },

    /// Listing the session's resources failed. Logged, never fatal.
    #[error("resource discovery failed for '{name}': {reason}")]
    ResourceDiscovery { name: String, reason: String },

    /// An invocation found no live transport after a connect attempt.
    #[error("session '{session}' is unavailable: {reason}")]
    SessionUnavailable { session: String, reason: String },

    /// The remote call completed without a result payload.
    #[error("tool '{tool}' on '{session}' returned no result")]
    EmptyResult { session: String, tool: String },

    /// The remote call failed or was rejected.
    #[error("tool '{tool}' on '{session}' failed: {reason}")]
    Invocation {
        session: String,
        tool: String,
        reason: String,
    },

    /// The invocation was cancelled before it was dispatched.
    #[error("call to '{tool}' on '{session}' was cancelled")]
    Cancelled { session: String, tool: String },

    /// I/O or framing error on an open channel.
    #[error("transport error for '{session}': {reason}")]
    Transport { session: String, reason: String },

    /// Server returned a JSON-RPC error response.
    #[error("server error [{code}]: {message}")]
    Server {
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// No session registered under this name.
    #[error("unknown session: '{name}'")]
    UnknownSession { name: String },

    /// The session is connected but does not expose this tool.
    #[error("unknown tool '{tool}' on '{session}'")]
    UnknownTool { session: String, tool: String },

    /// A flattened tool key is not of the form `session::tool`.
    #[error("invalid tool key '{key}'")]
    InvalidToolKey { key: String },

    /// The config store failed to read or write.
    #[error("config store error: {reason}")]
    Store { reason: String },
}

impl McpError {
    /// Name of the session this error concerns, when it carries one.
    pub fn session_name(&self) -> Option<&str> {
        match self {
            Self::ConfigValidation { name, .. }
            | Self::TransportOpen { name, .. }
            | Self::Discovery { name, .. }
            | Self::ResourceDiscovery { name, .. }
            | Self::UnknownSession { name } => Some(name),
            Self::SessionUnavailable { session, .. }
            | Self::EmptyResult { session, .. }
            | Self::Invocation { session, .. }
            | Self::Cancelled { session, .. }
            | Self::Transport { session, .. }
            | Self::UnknownTool { session, .. } => Some(session),
            Self::Server { .. } | Self::InvalidToolKey { .. } | Self::Store { .. } => None,
        }
    }
}

impl From<rusqlite::Error> for McpError {
    fn from(e: rusqlite::Error) -> Self {
        McpError::Store {
            reason: e.to_string(),
        }
    }
}

impl From<std::io::Error> for McpError {
    fn from(e: std::io::Error) -> Self {
        McpError::Store {
            reason: e.to_string(),
        }
    }
}

impl From<serde_json::Error> for McpError {
    fn from(e: serde_json::Error) -> Self {
        McpError::Store {
            reason: format!("serialization failed: {e}"),
        }
    }
}
