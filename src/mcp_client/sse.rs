//! HTTP event-stream channel.
//!
//! Opens a long-lived `GET` with `Accept: text/event-stream`. The server first
//! sends an `endpoint` event naming the URL to `POST` client messages to;
//! responses then arrive as `message` events on the stream and are routed to
//! waiters by id. Configured headers go on every request.
//!
//! This is the HTTP+SSE flavour only. Servers that speak Streamable HTTP
//! (single endpoint, responses in the POST reply) never send `endpoint`, and
//! configs tagged for it are rejected when parsed.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::Url;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::errors::McpError;
use super::transport::{next_request_id, parse_response_line, JsonRpcChannel, PendingRequests};
use super::types::{JsonRpcRequest, JsonRpcResponse, StreamConfig};

/// How long to wait for the server's `endpoint` event after the stream opens.
const ENDPOINT_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-request bound on the optional reachability probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

// ─── SSE Decoding ────────────────────────────────────────────────────────────

/// One dispatched server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

/// Incremental `text/event-stream` decoder. Chunks may split lines anywhere.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();
        let mut start = 0;
        while let Some(pos) = self.buffer[start..].iter().position(|b| *b == b'\n') {
            let end = start + pos;
            let line_end = if end > start && self.buffer[end - 1] == b'\r' {
                end - 1
            } else {
                end
            };
            let line = String::from_utf8_lossy(&self.buffer[start..line_end]).into_owned();
            self.feed_line(&line, &mut events);
            start = end + 1;
        }
        self.buffer.drain(..start);
        events
    }

    /// Flush a trailing partial line and any undispatched event.
    pub fn finish(&mut self) -> Vec<SseEvent> {
        let mut events = Vec::new();
        if !self.buffer.is_empty() {
            let line = String::from_utf8_lossy(&self.buffer).into_owned();
            self.buffer.clear();
            self.feed_line(line.trim_end_matches('\r'), &mut events);
        }
        self.dispatch(&mut events);
        events
    }

    fn feed_line(&mut self, line: &str, events: &mut Vec<SseEvent>) {
        if line.is_empty() {
            self.dispatch(events);
            return;
        }
        if line.starts_with(':') {
            return;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            _ => {}
        }
    }

    fn dispatch(&mut self, events: &mut Vec<SseEvent>) {
        let event = self.event.take();
        if self.data.is_empty() {
            return;
        }
        events.push(SseEvent {
            event,
            data: std::mem::take(&mut self.data).join("\n"),
        });
    }
}

pub fn is_event_stream_content_type(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .map(str::trim)
        .is_some_and(|value| value.eq_ignore_ascii_case("text/event-stream"))
}

fn header_map(session: &str, headers: &BTreeMap<String, String>) -> Result<HeaderMap, McpError> {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| McpError::TransportOpen {
            name: session.to_string(),
            reason: format!("invalid header name '{name}': {e}"),
        })?;
        let value = HeaderValue::from_str(value).map_err(|e| McpError::TransportOpen {
            name: session.to_string(),
            reason: format!("invalid value for header '{name}': {e}"),
        })?;
        map.insert(name, value);
    }
    Ok(map)
}

// ─── SseChannel ──────────────────────────────────────────────────────────────

/// JSON-RPC channel over an HTTP event stream plus a POST endpoint.
pub struct SseChannel {
    session: String,
    client: reqwest::Client,
    headers: HeaderMap,
    endpoint: Url,
    pending: PendingRequests,
    closed: Arc<AtomicBool>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl SseChannel {
    /// Open the event stream and wait for the server to announce its endpoint.
    pub async fn connect(
        session: &str,
        config: &StreamConfig,
        probe: bool,
    ) -> Result<Self, McpError> {
        let open_error = |reason: String| McpError::TransportOpen {
            name: session.to_string(),
            reason,
        };

        let headers = header_map(session, &config.headers)?;
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| open_error(format!("failed to build HTTP client: {e}")))?;

        if probe {
            probe_endpoint(session, &client, &config.url, &headers).await;
        }

        tracing::debug!(session, url = %config.url, "opening MCP event stream");
        let response = client
            .get(config.url.clone())
            .headers(headers.clone())
            .header(ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| open_error(format!("failed to connect to {}: {e}", config.url)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(open_error(format!("HTTP {status} from {}", config.url)));
        }
        if let Some(content_type) = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
        {
            if !is_event_stream_content_type(content_type) {
                return Err(open_error(format!(
                    "expected text/event-stream, got '{content_type}'"
                )));
            }
        }

        let pending = PendingRequests::default();
        let closed = Arc::new(AtomicBool::new(false));
        let (endpoint_tx, endpoint_rx) = oneshot::channel::<String>();

        let reader = {
            let pending = pending.clone();
            let closed = closed.clone();
            let session = session.to_string();
            tokio::spawn(async move {
                let mut endpoint_tx = Some(endpoint_tx);
                let mut decoder = SseDecoder::default();
                let mut stream = response.bytes_stream();
                let mut handle = |events: Vec<SseEvent>| {
                    for event in events {
                        match event.event.as_deref() {
                            Some("endpoint") => {
                                if let Some(tx) = endpoint_tx.take() {
                                    let _ = tx.send(event.data);
                                }
                            }
                            None | Some("message") => match parse_response_line(&event.data) {
                                Some(resp) => {
                                    pending.resolve(resp);
                                }
                                None => tracing::trace!(session = %session, "non-response event"),
                            },
                            Some(other) => {
                                tracing::trace!(session = %session, event = other, "ignoring event")
                            }
                        }
                    }
                };
                while let Some(chunk) = stream.next().await {
                    match chunk {
                        Ok(bytes) => handle(decoder.push(&bytes)),
                        Err(e) => {
                            tracing::debug!(session = %session, error = %e, "event stream error");
                            break;
                        }
                    }
                }
                handle(decoder.finish());
                tracing::debug!(session = %session, "event stream closed");
                closed.store(true, Ordering::SeqCst);
                pending.fail_all();
            })
        };

        let endpoint = match tokio::time::timeout(ENDPOINT_TIMEOUT, endpoint_rx).await {
            Ok(Ok(endpoint)) => endpoint,
            Ok(Err(_)) => {
                reader.abort();
                return Err(open_error("stream closed before endpoint event".into()));
            }
            Err(_) => {
                reader.abort();
                return Err(open_error(format!(
                    "no endpoint event within {}s",
                    ENDPOINT_TIMEOUT.as_secs()
                )));
            }
        };
        let endpoint = match config.url.join(endpoint.trim()) {
            Ok(url) => url,
            Err(e) => {
                reader.abort();
                return Err(open_error(format!("invalid endpoint '{endpoint}': {e}")));
            }
        };
        tracing::debug!(session, endpoint = %endpoint, "MCP event stream ready");

        Ok(Self {
            session: session.to_string(),
            client,
            headers,
            endpoint,
            pending,
            closed,
            reader: Mutex::new(Some(reader)),
        })
    }

    fn transport_error(&self, reason: String) -> McpError {
        McpError::Transport {
            session: self.session.clone(),
            reason,
        }
    }

    async fn post(&self, body: &impl serde::Serialize) -> Result<(), McpError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(self.transport_error("event stream is closed".into()));
        }
        let response = self
            .client
            .post(self.endpoint.clone())
            .headers(self.headers.clone())
            .json(body)
            .send()
            .await
            .map_err(|e| self.transport_error(format!("POST {} failed: {e}", self.endpoint)))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(self.transport_error(format!("HTTP {status}: {body}")));
        }
        Ok(())
    }
}

/// Best-effort reachability check; the real connection attempt is authoritative.
async fn probe_endpoint(session: &str, client: &reqwest::Client, url: &Url, headers: &HeaderMap) {
    let probe = client
        .head(url.clone())
        .headers(headers.clone())
        .timeout(PROBE_TIMEOUT)
        .send()
        .await;
    match probe {
        Ok(resp) => tracing::debug!(session, status = %resp.status(), "stream endpoint reachable"),
        Err(e) => tracing::warn!(session, url = %url, error = %e, "stream endpoint probe failed"),
    }
}

#[async_trait]
impl JsonRpcChannel for SseChannel {
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
        if let Err(e) = self.post(&JsonRpcRequest::new(id, method, params)).await {
            self.pending.forget(id);
            return Err(e);
        }
        rx.await
            .map_err(|_| self.transport_error("event stream closed before response".into()))
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError> {
        let notification = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        });
        self.post(&notification).await
    }

    async fn shutdown(&self) -> Result<(), McpError> {
        self.closed.store(true, Ordering::SeqCst);
        let reader = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(reader) = reader {
            reader.abort();
        }
        self.pending.fail_all();
        Ok(())
    }
}

impl Drop for SseChannel {
    fn drop(&mut self) {
        if let Some(reader) = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            reader.abort();
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp_client::transport::{McpTransport, RpcTransport};
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::mpsc;

    #[test]
    fn test_decoder_handles_partial_lines() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.push(b"event: endpoint\r\ndata: /mess").is_empty());
        let events = decoder.push(b"ages?id=1\r\n\r\n");
        assert_eq!(
            events,
            vec![SseEvent {
                event: Some("endpoint".into()),
                data: "/messages?id=1".into(),
            }]
        );
        assert!(decoder.finish().is_empty());
    }

    #[test]
    fn test_decoder_joins_multiline_data_and_skips_comments() {
        let mut decoder = SseDecoder::default();
        let events = decoder.push(b": keepalive\n\ndata: {\"a\":\ndata: 1}\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, None);
        assert_eq!(events[0].data, "{\"a\":\n1}");
    }

    #[test]
    fn test_decoder_finish_flushes_trailing_event() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.push(b"data: tail").is_empty());
        assert_eq!(decoder.finish()[0].data, "tail");
    }

    #[test]
    fn test_detects_event_stream_content_type() {
        assert!(is_event_stream_content_type("text/event-stream; charset=utf-8"));
        assert!(!is_event_stream_content_type("application/json"));
    }

    #[test]
    fn test_invalid_header_is_transport_open() {
        let mut headers = BTreeMap::new();
        headers.insert("bad header".to_string(), "v".to_string());
        assert!(matches!(
            header_map("s", &headers),
            Err(McpError::TransportOpen { .. })
        ));
    }

    /// Read one HTTP/1.1 request: returns (request line, headers, body).
    async fn read_request(
        reader: &mut BufReader<TcpStream>,
    ) -> Option<(String, Vec<String>, Vec<u8>)> {
        let mut request_line = String::new();
        if reader.read_line(&mut request_line).await.ok()? == 0 {
            return None;
        }
        let mut headers = Vec::new();
        let mut content_length = 0usize;
        loop {
            let mut line = String::new();
            reader.read_line(&mut line).await.ok()?;
            let line = line.trim_end().to_string();
            if line.is_empty() {
                break;
            }
            if let Some(v) = line.to_ascii_lowercase().strip_prefix("content-length:") {
                content_length = v.trim().parse().ok()?;
            }
            headers.push(line);
        }
        let mut body = vec![0u8; content_length];
        reader.read_exact(&mut body).await.ok()?;
        Some((request_line, headers, body))
    }

    /// Minimal MCP SSE server: one event stream, answers every POSTed request
    /// on it. Every non-stream response closes its connection.
    async fn spawn_sse_server() -> (Url, mpsc::UnboundedReceiver<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (events_tx, events_rx) = mpsc::unbounded_channel::<String>();
        let (headers_tx, headers_rx) = mpsc::unbounded_channel::<Vec<String>>();
        let mut events_rx = Some(events_rx);

        tokio::spawn(async move {
            loop {
                let (socket, _) = listener.accept().await.unwrap();
                let mut reader = BufReader::new(socket);
                let Some((line, headers, body)) = read_request(&mut reader).await else {
                    continue;
                };

                if line.starts_with("GET") {
                    let _ = headers_tx.send(headers);
                    let Some(mut rx) = events_rx.take() else {
                        continue;
                    };
                    tokio::spawn(async move {
                        let socket = reader.get_mut();
                        let head = b"HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nConnection: close\r\n\r\n";
                        socket.write_all(head).await.unwrap();
                        socket
                            .write_all(b"event: endpoint\ndata: /messages?session=1\n\n")
                            .await
                            .unwrap();
                        while let Some(data) = rx.recv().await {
                            let frame = format!("event: message\ndata: {data}\n\n");
                            if socket.write_all(frame.as_bytes()).await.is_err() {
                                break;
                            }
                        }
                    });
                    continue;
                }

                if let Ok(msg) = serde_json::from_slice::<Value>(&body) {
                    if let Some(id) = msg.get("id").and_then(Value::as_u64) {
                        let result = match msg["method"].as_str() {
                            Some("initialize") => serde_json::json!({
                                "protocolVersion": "2024-11-05",
                                "serverInfo": {"name": "test"}
                            }),
                            Some("tools/list") => serde_json::json!({"tools": [{"name": "forecast"}]}),
                            _ => serde_json::json!({"content": []}),
                        };
                        let reply = serde_json::json!({"jsonrpc": "2.0", "id": id, "result": result});
                        let _ = events_tx.send(reply.to_string());
                    }
                }
                let _ = reader
                    .get_mut()
                    .write_all(b"HTTP/1.1 202 Accepted\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                    .await;
            }
        });

        let url = Url::parse(&format!("http://{addr}/sse")).unwrap();
        (url, headers_rx)
    }

    #[tokio::test]
    async fn test_connect_initialize_and_list_over_event_stream() {
        let (url, mut seen_headers) = spawn_sse_server().await;
        let mut headers = BTreeMap::new();
        headers.insert("X-Api-Key".to_string(), "secret".to_string());
        let config = StreamConfig { url, headers };

        let channel = SseChannel::connect("weather", &config, true).await.unwrap();
        assert_eq!(channel.endpoint.path(), "/messages");

        let get_headers = seen_headers.recv().await.unwrap();
        assert!(get_headers
            .iter()
            .any(|h| h.to_ascii_lowercase() == "x-api-key: secret"));

        let transport = RpcTransport::initialize(channel).await.unwrap();
        let tools = transport.list_tools().await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "forecast");
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_refused_is_transport_open() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let config = StreamConfig {
            url: Url::parse(&format!("http://{addr}/sse")).unwrap(),
            headers: BTreeMap::new(),
        };
        let err = SseChannel::connect("down", &config, false).await.err().unwrap();
        assert!(matches!(err, McpError::TransportOpen { ref name, .. } if name == "down"));
    }
}
