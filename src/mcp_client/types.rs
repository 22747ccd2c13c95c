//! Shared types for the MCP client.
//!
//! JSON-RPC 2.0 message types, session configuration, and the descriptors
//! produced by capability discovery.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use reqwest::Url;
use serde::{Deserialize, Serialize};

use super::errors::McpError;

/// Separator between session name and tool name in flattened tool keys.
pub const TOOL_KEY_SEPARATOR: &str = "::";

// ─── JSON-RPC 2.0 ───────────────────────────────────────────────────────────

/// JSON-RPC 2.0 request message.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcRequest {
    /// Create a new JSON-RPC request.
    pub fn new(id: u64, method: &str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 response message (success or error).
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcResponse {
    #[allow(dead_code)]
    pub jsonrpc: String,
    pub id: u64,
    pub result: Option<serde_json::Value>,
    pub error: Option<JsonRpcError>,
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    pub data: Option<serde_json::Value>,
}

/// Well-known JSON-RPC error codes.
pub mod error_codes {
    /// The method does not exist or is not available.
    pub const METHOD_NOT_FOUND: i64 = -32601;
}

// ─── MCP Protocol Types ──────────────────────────────────────────────────────

/// A tool discovered on a session, as returned by `tools/list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, rename = "inputSchema", alias = "input_schema")]
    pub input_schema: serde_json::Value,
}

/// A resource discovered on a session, as returned by `resources/list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    pub uri: String,
    pub name: String,
    #[serde(default, rename = "mimeType", skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// `tools/list` response payload.
#[derive(Debug, Clone, Deserialize)]
pub struct ListToolsResult {
    #[serde(default)]
    pub tools: Vec<ToolDescriptor>,
}

/// `resources/list` response payload.
#[derive(Debug, Clone, Deserialize)]
pub struct ListResourcesResult {
    #[serde(default)]
    pub resources: Vec<ResourceDescriptor>,
}

/// MCP initialize response payload.
#[derive(Debug, Clone, Deserialize)]
pub struct InitializeResult {
    #[serde(default, alias = "protocolVersion")]
    pub protocol_version: Option<String>,
    #[serde(default)]
    pub capabilities: serde_json::Value,
    #[serde(default, alias = "serverInfo")]
    pub server_info: Option<ServerInfo>,
}

/// Server info returned in the initialize response.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerInfo {
    pub name: Option<String>,
    pub version: Option<String>,
}

// ─── Session Configuration ──────────────────────────────────────────────────

/// Spawn a child process and speak JSON-RPC over its stdio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubprocessConfig {
    pub command: String,
    pub args: Vec<String>,
    /// Overlaid on the host environment; configured keys win.
    pub env: BTreeMap<String, String>,
    pub working_dir: Option<String>,
}

/// Connect to a long-lived HTTP event stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    pub url: Url,
    /// Attached to every request made on this session.
    pub headers: BTreeMap<String, String>,
}

/// Validated configuration for one session.
///
/// The variant is decided once, when the config is parsed, and never
/// re-inferred afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawSessionConfig", into = "RawSessionConfig")]
pub enum SessionConfig {
    Subprocess(SubprocessConfig),
    Stream(StreamConfig),
}

impl SessionConfig {
    /// Parse and validate a config from JSON, attributing errors to `name`.
    pub fn from_value(name: &str, value: serde_json::Value) -> Result<Self, McpError> {
        let raw: RawSessionConfig =
            serde_json::from_value(value).map_err(|e| McpError::ConfigValidation {
                name: name.to_string(),
                reason: e.to_string(),
            })?;
        Self::try_from(raw).map_err(|reason| McpError::ConfigValidation {
            name: name.to_string(),
            reason,
        })
    }

    /// Short transport label for logs and status output.
    pub fn transport_label(&self) -> &'static str {
        match self {
            Self::Subprocess(_) => "stdio",
            Self::Stream(_) => "sse",
        }
    }
}

/// On-the-wire shape of a session config, before the variant is decided.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawSessionConfig {
    #[serde(default, rename = "type", alias = "transport", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// `null` values are dropped so they never shadow inherited variables.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, Option<String>>,
    #[serde(default, alias = "workingDir", skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConfigShape {
    Subprocess,
    Stream,
}

impl RawSessionConfig {
    fn shape(&self) -> Result<ConfigShape, String> {
        if let Some(kind) = self.kind.as_deref() {
            return match kind.to_ascii_lowercase().as_str() {
                "stdio" => Ok(ConfigShape::Subprocess),
                "sse" => Ok(ConfigShape::Stream),
                "http" | "streamable-http" | "streamable_http" => Err(format!(
                    "transport type '{kind}' is not supported; only the 'sse' event-stream flavour is"
                )),
                other => Err(format!("unsupported transport type '{other}'")),
            };
        }
        match (self.command.is_some(), self.url.is_some()) {
            (true, false) => Ok(ConfigShape::Subprocess),
            (false, true) => Ok(ConfigShape::Stream),
            (true, true) => Err("config has both 'command' and 'url'; set 'type' to pick one".into()),
            (false, false) => Err("config needs either 'command' or 'url'".into()),
        }
    }
}

impl TryFrom<RawSessionConfig> for SessionConfig {
    type Error = String;

    fn try_from(raw: RawSessionConfig) -> Result<Self, Self::Error> {
        match raw.shape()? {
            ConfigShape::Subprocess => {
                let command = raw
                    .command
                    .map(|c| c.trim().to_string())
                    .filter(|c| !c.is_empty())
                    .ok_or_else(|| "stdio config requires a non-empty 'command'".to_string())?;
                let env = raw
                    .env
                    .into_iter()
                    .filter_map(|(k, v)| v.map(|v| (k, v)))
                    .collect();
                Ok(SessionConfig::Subprocess(SubprocessConfig {
                    command,
                    args: raw.args,
                    env,
                    working_dir: raw.cwd.filter(|d| !d.is_empty()),
                }))
            }
            ConfigShape::Stream => {
                let url = raw
                    .url
                    .ok_or_else(|| "stream config requires a 'url'".to_string())?;
                let url = Url::parse(&url).map_err(|e| format!("invalid url '{url}': {e}"))?;
                if !matches!(url.scheme(), "http" | "https") {
                    return Err(format!("unsupported url scheme '{}'", url.scheme()));
                }
                Ok(SessionConfig::Stream(StreamConfig {
                    url,
                    headers: raw.headers,
                }))
            }
        }
    }
}

impl From<SessionConfig> for RawSessionConfig {
    fn from(config: SessionConfig) -> Self {
        match config {
            SessionConfig::Subprocess(c) => RawSessionConfig {
                kind: None,
                command: Some(c.command),
                args: c.args,
                env: c.env.into_iter().map(|(k, v)| (k, Some(v))).collect(),
                cwd: c.working_dir,
                ..Default::default()
            },
            SessionConfig::Stream(c) => RawSessionConfig {
                url: Some(c.url.to_string()),
                headers: c.headers,
                ..Default::default()
            },
        }
    }
}

/// Check that a session name can be used as the first half of a tool key.
pub fn validate_session_name(name: &str) -> Result<(), McpError> {
    let reason = if name.trim().is_empty() {
        "session name must not be empty".to_string()
    } else if name.contains(TOOL_KEY_SEPARATOR) {
        format!("session name must not contain '{TOOL_KEY_SEPARATOR}'")
    } else {
        return Ok(());
    };
    Err(McpError::ConfigValidation {
        name: name.to_string(),
        reason,
    })
}

/// Top-level servers document (`{"mcpServers": {...}}`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct McpServersConfig {
    #[serde(rename = "mcpServers", alias = "servers", default)]
    pub servers: BTreeMap<String, SessionConfig>,
}

impl McpServersConfig {
    /// Parse a servers document from JSON text.
    pub fn from_json_str(content: &str) -> Result<Self, McpError> {
        serde_json::from_str(content).map_err(|e| McpError::ConfigValidation {
            name: "mcpServers".to_string(),
            reason: e.to_string(),
        })
    }

    /// Read and parse a servers document from disk.
    pub fn load(path: &Path) -> Result<Self, McpError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }
}

// ─── Status ─────────────────────────────────────────────────────────────────

/// Connection status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Disconnected,
    /// A connect attempt currently holds the session's locker.
    Loading,
    Connected,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Loading => "loading",
            Self::Connected => "connected",
        };
        f.write_str(s)
    }
}

/// Point-in-time view of a session, for status displays.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub name: String,
    pub transport: String,
    pub status: SessionStatus,
    pub error: Option<String>,
    pub tools: Vec<ToolDescriptor>,
    pub resources: Vec<ResourceDescriptor>,
    pub checked_at: String,
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_rpc_request_serialization() {
        let req = JsonRpcRequest::new(1, "tools/list", None);
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"jsonrpc\":\"2.0\""));
        assert!(json.contains("\"id\":1"));
        assert!(!json.contains("params"));
    }

    #[test]
    fn test_json_rpc_error_response() {
        let json = r#"{
            "jsonrpc": "2.0",
            "id": 2,
            "result": null,
            "error": {"code": -32601, "message": "Method not found"}
        }"#;
        let resp: JsonRpcResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.error.unwrap().code, error_codes::METHOD_NOT_FOUND);
    }

    #[test]
    fn test_subprocess_config_inferred_from_command() {
        let config = SessionConfig::from_value(
            "files",
            serde_json::json!({
                "command": "npx",
                "args": ["-y", "server-files"],
                "env": {"TOKEN": "abc", "UNSET": null},
                "workingDir": "/srv"
            }),
        )
        .unwrap();

        let SessionConfig::Subprocess(c) = config else {
            panic!("expected subprocess config");
        };
        assert_eq!(c.command, "npx");
        assert_eq!(c.args, vec!["-y", "server-files"]);
        assert_eq!(c.env.get("TOKEN").map(String::as_str), Some("abc"));
        assert!(!c.env.contains_key("UNSET"));
        assert_eq!(c.working_dir.as_deref(), Some("/srv"));
    }

    #[test]
    fn test_stream_config_inferred_from_url() {
        let config = SessionConfig::from_value(
            "weather",
            serde_json::json!({"url": "https://example.com/sse", "headers": {"X-Key": "k"}}),
        )
        .unwrap();
        let SessionConfig::Stream(c) = config else {
            panic!("expected stream config");
        };
        assert_eq!(c.url.as_str(), "https://example.com/sse");
        assert_eq!(c.headers["X-Key"], "k");
    }

    #[test]
    fn test_ambiguous_config_rejected_without_type() {
        let err = SessionConfig::from_value(
            "x",
            serde_json::json!({"command": "node", "url": "http://localhost/sse"}),
        )
        .unwrap_err();
        assert!(matches!(err, McpError::ConfigValidation { .. }));

        let ok = SessionConfig::from_value(
            "x",
            serde_json::json!({"type": "stdio", "command": "node", "url": "http://localhost/sse"}),
        )
        .unwrap();
        assert_eq!(ok.transport_label(), "stdio");
    }

    #[test]
    fn test_streamable_http_tag_rejected() {
        for kind in ["http", "streamable-http"] {
            let err = SessionConfig::from_value(
                "remote",
                serde_json::json!({"type": kind, "url": "https://example.com/mcp"}),
            )
            .unwrap_err();
            assert!(err.to_string().contains("not supported"), "{kind}: {err}");
        }
        let sse = SessionConfig::from_value(
            "remote",
            serde_json::json!({"type": "sse", "url": "https://example.com/sse"}),
        )
        .unwrap();
        assert!(matches!(sse, SessionConfig::Stream(_)));
    }

    #[test]
    fn test_invalid_configs_rejected() {
        for value in [
            serde_json::json!({}),
            serde_json::json!({"command": "   "}),
            serde_json::json!({"url": "not a url"}),
            serde_json::json!({"url": "ftp://example.com/"}),
            serde_json::json!({"type": "carrier-pigeon", "command": "x"}),
        ] {
            assert!(
                SessionConfig::from_value("bad", value.clone()).is_err(),
                "accepted {value}"
            );
        }
    }

    #[test]
    fn test_config_serializes_back_to_host_shape() {
        let config = SessionConfig::from_value(
            "files",
            serde_json::json!({"command": "npx", "args": ["a"], "cwd": "/tmp"}),
        )
        .unwrap();
        let value = serde_json::to_value(&config).unwrap();
        assert_eq!(value["command"], "npx");
        assert_eq!(value["cwd"], "/tmp");
        assert!(value.get("url").is_none());
        let reparsed: SessionConfig = serde_json::from_value(value).unwrap();
        assert_eq!(reparsed, config);
    }

    #[test]
    fn test_session_name_validation() {
        assert!(validate_session_name("files").is_ok());
        assert!(validate_session_name("").is_err());
        assert!(validate_session_name("a::b").is_err());
    }

    #[test]
    fn test_servers_document_accepts_both_keys() {
        let a = McpServersConfig::from_json_str(
            r#"{"mcpServers": {"files": {"command": "npx"}}}"#,
        )
        .unwrap();
        let b = McpServersConfig::from_json_str(r#"{"servers": {"files": {"command": "npx"}}}"#)
            .unwrap();
        assert_eq!(a, b);
        assert!(McpServersConfig::from_json_str(r#"{"servers": {"x": {}}}"#).is_err());
    }

    #[test]
    fn test_tool_descriptor_defaults() {
        let tool: ToolDescriptor = serde_json::from_str(r#"{"name": "list"}"#).unwrap();
        assert_eq!(tool.description, "");
        assert!(tool.input_schema.is_null());
    }

    #[test]
    fn test_status_display() {
        assert_eq!(SessionStatus::Loading.to_string(), "loading");
    }
}
