//! Scripted connector and transport for session/registry tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use super::errors::McpError;
use super::transport::{Connector, McpTransport};
use super::types::{ResourceDescriptor, SessionConfig, ToolDescriptor};

/// How the mock answers `call_tool`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallBehavior {
    /// Return `{"tool": name, "input": arguments}`.
    Echo,
    /// Return no result payload.
    Empty,
    /// Fail with a server error.
    Fail,
}

/// Shared knobs and counters.
#[derive(Debug)]
pub struct MockState {
    pub opens: AtomicUsize,
    pub closes: AtomicUsize,
    pub double_closes: AtomicUsize,
    pub calls: AtomicUsize,
    pub live: AtomicUsize,
    pub max_live: AtomicUsize,
    pub open_delay: Mutex<Duration>,
    pub call_delay: Mutex<Duration>,
    pub close_delay: Mutex<Duration>,
    pub fail_open: AtomicBool,
    pub fail_tools: AtomicBool,
    pub fail_resources: AtomicBool,
    pub tools: Mutex<Vec<String>>,
    pub call_behavior: Mutex<CallBehavior>,
    pub opened_configs: Mutex<Vec<SessionConfig>>,
}

impl MockState {
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn set_open_delay(&self, delay: Duration) {
        *self.open_delay.lock().unwrap() = delay;
    }

    pub fn set_call_delay(&self, delay: Duration) {
        *self.call_delay.lock().unwrap() = delay;
    }

    pub fn set_close_delay(&self, delay: Duration) {
        *self.close_delay.lock().unwrap() = delay;
    }

    pub fn set_call_behavior(&self, behavior: CallBehavior) {
        *self.call_behavior.lock().unwrap() = behavior;
    }
}

#[derive(Debug, Clone)]
pub struct MockConnector {
    pub state: Arc<MockState>,
}

impl MockConnector {
    pub fn new(tools: &[&str]) -> Self {
        let state = MockState {
            opens: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            double_closes: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
            live: AtomicUsize::new(0),
            max_live: AtomicUsize::new(0),
            open_delay: Mutex::new(Duration::ZERO),
            call_delay: Mutex::new(Duration::ZERO),
            close_delay: Mutex::new(Duration::ZERO),
            fail_open: AtomicBool::new(false),
            fail_tools: AtomicBool::new(false),
            fail_resources: AtomicBool::new(false),
            tools: Mutex::new(tools.iter().map(|t| t.to_string()).collect()),
            call_behavior: Mutex::new(CallBehavior::Echo),
            opened_configs: Mutex::new(Vec::new()),
        };
        Self {
            state: Arc::new(state),
        }
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn open(
        &self,
        name: &str,
        config: &SessionConfig,
    ) -> Result<Arc<dyn McpTransport>, McpError> {
        self.state.opens.fetch_add(1, Ordering::SeqCst);
        self.state.opened_configs.lock().unwrap().push(config.clone());
        let delay = *self.state.open_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.state.fail_open.load(Ordering::SeqCst) {
            return Err(McpError::TransportOpen {
                name: name.to_string(),
                reason: "connection refused".into(),
            });
        }
        let live = self.state.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.max_live.fetch_max(live, Ordering::SeqCst);
        Ok(Arc::new(MockTransport {
            state: self.state.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

#[derive(Debug)]
pub struct MockTransport {
    state: Arc<MockState>,
    closed: AtomicBool,
}

fn server_error(message: &str) -> McpError {
    McpError::Server {
        code: -32000,
        message: message.to_string(),
        data: None,
    }
}

#[async_trait]
impl McpTransport for MockTransport {
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, McpError> {
        if self.state.fail_tools.load(Ordering::SeqCst) {
            return Err(server_error("tools/list exploded"));
        }
        let names = self.state.tools.lock().unwrap().clone();
        Ok(names
            .into_iter()
            .map(|name| ToolDescriptor {
                description: format!("{name} tool"),
                input_schema: serde_json::json!({"type": "object"}),
                name,
            })
            .collect())
    }

    async fn list_resources(&self) -> Result<Vec<ResourceDescriptor>, McpError> {
        if self.state.fail_resources.load(Ordering::SeqCst) {
            return Err(server_error("resources/list exploded"));
        }
        Ok(vec![ResourceDescriptor {
            uri: "mock://readme".into(),
            name: "readme".into(),
            mime_type: Some("text/plain".into()),
        }])
    }

    async fn read_resource(&self, uri: &str) -> Result<Option<Value>, McpError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(server_error("transport closed"));
        }
        Ok(Some(serde_json::json!({"contents": [{"uri": uri, "text": "hello"}]})))
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Option<Value>, McpError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(server_error("transport closed"));
        }
        self.state.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.state.call_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
            if self.closed.load(Ordering::SeqCst) {
                return Err(server_error("closed mid-call"));
            }
        }
        let behavior = *self.state.call_behavior.lock().unwrap();
        match behavior {
            CallBehavior::Echo => Ok(Some(serde_json::json!({"tool": name, "input": arguments}))),
            CallBehavior::Empty => Ok(None),
            CallBehavior::Fail => Err(server_error("tool blew up")),
        }
    }

    async fn close(&self) -> Result<(), McpError> {
        let delay = *self.state.close_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.closed.swap(true, Ordering::SeqCst) {
            self.state.double_closes.fetch_add(1, Ordering::SeqCst);
        } else {
            self.state.live.fetch_sub(1, Ordering::SeqCst);
        }
        self.state.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub fn stdio_config(command: &str) -> SessionConfig {
    SessionConfig::from_value("test", serde_json::json!({ "command": command }))
        .expect("valid test config")
}
