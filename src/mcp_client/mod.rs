//! MCP Client: named sessions over stdio or HTTP event streams.
//!
//! This module handles:
//! - Opening transports (child process stdio, SSE) and the JSON-RPC handshake
//! - Per-session lifecycle: single-flight connect, idle disconnect, fail-fast calls
//! - Tool and resource discovery, flattened into `session::tool` keys
//! - Reconciling a desired set of session configs against the live registry
//! - Persisting session configs (JSON file, SQLite)

pub mod diff;
pub mod errors;
pub mod idle;
pub mod locker;
pub mod registry;
pub mod session;
pub mod sse;
pub mod stdio;
pub mod store;
pub mod transport;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports for convenience
pub use diff::ConfigChange;
pub use errors::McpError;
pub use registry::{parse_tool_key, tool_key, ReconcileReport, Registry};
pub use session::{Session, SessionOptions, SessionTool};
pub use store::{ConfigStore, JsonFileStore, MemoryStore, SqliteStore};
pub use transport::{Connector, DefaultConnector, McpTransport};
pub use types::{
    McpServersConfig, SessionConfig, SessionSnapshot, SessionStatus, StreamConfig,
    SubprocessConfig, ToolDescriptor,
};
