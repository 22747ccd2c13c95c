//! Session registry: owns every session by name, flattens their tools into
//! one namespace, and reconciles a desired config set against the live one.
//!
//! Tool keys are `"session::tool"`. Session names may not contain `::`, so
//! the first separator always splits a key unambiguously even when the tool
//! name itself contains one.
//!
//! The registry is driven from a single coordinating context (`&mut self`
//! for every mutation); sessions themselves are shared and safe to use from
//! any task.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::diff::{diff, ConfigChange};
use super::errors::McpError;
use super::session::{Session, SessionOptions, SessionTool};
use super::store::ConfigStore;
use super::transport::Connector;
use super::types::{
    validate_session_name, SessionConfig, SessionSnapshot, SessionStatus, TOOL_KEY_SEPARATOR,
};

// ─── Tool keys ───────────────────────────────────────────────────────────────

/// Build the registry-wide key for a session's tool.
pub fn tool_key(session: &str, tool: &str) -> String {
    format!("{session}{TOOL_KEY_SEPARATOR}{tool}")
}

/// Split a tool key at the first separator.
pub fn parse_tool_key(key: &str) -> Result<(&str, &str), McpError> {
    match key.split_once(TOOL_KEY_SEPARATOR) {
        Some((session, tool)) if !session.is_empty() && !tool.is_empty() => Ok((session, tool)),
        _ => Err(McpError::InvalidToolKey {
            key: key.to_string(),
        }),
    }
}

// ─── Reconcile report ────────────────────────────────────────────────────────

/// What a `reconcile()` call did.
#[derive(Debug, Default)]
pub struct ReconcileReport {
    /// Every change that was attempted, in application order.
    pub changes: Vec<ConfigChange<SessionConfig>>,
    /// Changes that failed, by session name. Other changes still applied.
    pub failures: Vec<(String, McpError)>,
}

impl ReconcileReport {
    pub fn is_noop(&self) -> bool {
        self.changes.is_empty()
    }

    fn count(&self, kind: &str) -> usize {
        self.changes.iter().filter(|c| c.kind() == kind).count()
    }
}

// ─── Registry ────────────────────────────────────────────────────────────────

/// Owner of all sessions.
pub struct Registry {
    sessions: HashMap<String, Arc<Session>>,
    store: Option<Box<dyn ConfigStore>>,
    connector: Arc<dyn Connector>,
    options: SessionOptions,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("sessions", &self.sessions.len())
            .field("has_store", &self.store.is_some())
            .field("options", &self.options)
            .finish()
    }
}

impl Registry {
    /// An empty registry without persistence.
    pub fn new(connector: Arc<dyn Connector>, options: SessionOptions) -> Self {
        Self {
            sessions: HashMap::new(),
            store: None,
            connector,
            options,
        }
    }

    /// A registry backed by `store`, populated with every config it holds.
    ///
    /// Stored sessions that fail to connect are still registered.
    pub async fn with_store(
        store: Box<dyn ConfigStore>,
        connector: Arc<dyn Connector>,
        options: SessionOptions,
    ) -> Result<Self, McpError> {
        let stored = store.load_all()?;
        let mut registry = Self {
            sessions: HashMap::new(),
            store: Some(store),
            connector,
            options,
        };
        registry.add_all(stored).await;
        Ok(registry)
    }

    /// Add several sessions, connecting them concurrently.
    async fn add_all(&mut self, configs: BTreeMap<String, SessionConfig>) {
        let mut added = Vec::with_capacity(configs.len());
        for (name, config) in configs {
            match self.insert_session(&name, config) {
                Ok(session) => added.push(session),
                Err(e) => tracing::warn!(session = %name, error = %e, "skipping stored session"),
            }
        }
        futures::future::join_all(added.iter().map(|s| s.connect())).await;
        tracing::info!(count = added.len(), "loaded stored MCP sessions");
    }

    // ─── Mutations ───────────────────────────────────────────────────────

    /// Validate, persist if new to the store, register, then build the session.
    fn insert_session(&mut self, name: &str, config: SessionConfig) -> Result<Arc<Session>, McpError> {
        validate_session_name(name)?;
        if let Some(store) = &self.store {
            if !store.has(name)? {
                store.save(name, &config)?;
                tracing::debug!(session = name, "persisted new session config");
            }
        }
        let session = Session::new(name, config, self.options.clone(), self.connector.clone());
        if let Some(previous) = self.sessions.insert(name.to_string(), session.clone()) {
            // Replaced without going through remove; close it in the background.
            tokio::spawn(async move { previous.retire().await });
        }
        Ok(session)
    }

    /// Register a session and try to connect it.
    ///
    /// A failed connect still leaves the session registered, with its error
    /// visible in `statuses()`. Errors are only returned for invalid names
    /// and store failures, before anything is registered.
    pub async fn add_session(
        &mut self,
        name: &str,
        config: SessionConfig,
    ) -> Result<Arc<Session>, McpError> {
        let session = self.insert_session(name, config)?;
        let status = session.connect().await;
        tracing::info!(session = name, %status, "MCP session added");
        Ok(session)
    }

    /// Forget a session and close it. Unknown names are a no-op.
    pub async fn remove_session(&mut self, name: &str) -> Result<(), McpError> {
        if let Some(store) = &self.store {
            if store.has(name)? {
                store.delete(name)?;
            }
        }
        if let Some(session) = self.sessions.remove(name) {
            session.retire().await;
            tracing::info!(session = name, "MCP session removed");
        }
        Ok(())
    }

    /// Reconnect a session, optionally with a new config.
    ///
    /// Equivalent to remove-then-add with the config carried over.
    pub async fn refresh_session(
        &mut self,
        name: &str,
        config: Option<SessionConfig>,
    ) -> Result<Arc<Session>, McpError> {
        let existing = self
            .sessions
            .get(name)
            .cloned()
            .ok_or_else(|| McpError::UnknownSession {
                name: name.to_string(),
            })?;
        let effective = config.unwrap_or_else(|| existing.config().clone());

        if let Some(store) = &self.store {
            if store.get(name)?.as_ref() != Some(&effective) {
                store.save(name, &effective)?;
                tracing::debug!(session = name, "persisted updated session config");
            }
        }

        existing.retire().await;
        self.sessions.remove(name);
        self.add_session(name, effective).await
    }

    /// Bring the registry in line with `desired`.
    ///
    /// Changes are applied one by one; a failing change is recorded in the
    /// report and does not stop the rest.
    pub async fn reconcile(&mut self, desired: &BTreeMap<String, SessionConfig>) -> ReconcileReport {
        let changes = diff(&self.configs(), desired);
        let mut report = ReconcileReport::default();

        for change in &changes {
            let outcome = match change {
                ConfigChange::Add { key, value } => {
                    self.add_session(key, value.clone()).await.map(|_| ())
                }
                ConfigChange::Remove { key } => self.remove_session(key).await,
                ConfigChange::Update { key, value } => self
                    .refresh_session(key, Some(value.clone()))
                    .await
                    .map(|_| ()),
            };
            if let Err(e) = outcome {
                tracing::warn!(session = change.key(), change = change.kind(), error = %e, "reconcile change failed");
                report.failures.push((change.key().to_string(), e));
            }
        }
        report.changes = changes;

        tracing::info!(
            added = report.count("add"),
            removed = report.count("remove"),
            updated = report.count("update"),
            failed = report.failures.len(),
            "reconciled MCP sessions"
        );
        report
    }

    /// Drop every session and close them all concurrently.
    pub async fn shutdown(&mut self) {
        let sessions: Vec<_> = self.sessions.drain().map(|(_, s)| s).collect();
        if sessions.is_empty() {
            return;
        }
        tracing::info!(count = sessions.len(), "shutting down MCP sessions");
        futures::future::join_all(sessions.iter().map(|s| s.retire())).await;
    }

    // ─── Queries ─────────────────────────────────────────────────────────

    pub fn get_session(&self, name: &str) -> Option<Arc<Session>> {
        self.sessions.get(name).cloned()
    }

    /// All sessions, sorted by name.
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        let mut sessions: Vec<_> = self.sessions.values().cloned().collect();
        sessions.sort_by(|a, b| a.name().cmp(b.name()));
        sessions
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// The config of every registered session.
    pub fn configs(&self) -> BTreeMap<String, SessionConfig> {
        self.sessions
            .iter()
            .map(|(name, session)| (name.clone(), session.config().clone()))
            .collect()
    }

    /// Tools of every connected session, keyed `"session::tool"`.
    /// Sessions that are not connected contribute nothing.
    pub fn tools(&self) -> BTreeMap<String, SessionTool> {
        self.sessions
            .iter()
            .filter(|(_, session)| session.status() == SessionStatus::Connected)
            .flat_map(|(name, session)| {
                session
                    .tool_map()
                    .into_iter()
                    .map(move |(tool, handle)| (tool_key(name, &tool), handle))
            })
            .collect()
    }

    /// Snapshot of every session, sorted by name.
    pub fn statuses(&self) -> Vec<SessionSnapshot> {
        self.sessions().iter().map(|s| s.snapshot()).collect()
    }

    /// Invoke a tool by its registry key.
    pub async fn call_tool(
        &self,
        key: &str,
        input: Value,
        cancel: Option<&CancellationToken>,
    ) -> Result<Value, McpError> {
        let (session_name, tool) = parse_tool_key(key)?;
        let session = self
            .get_session(session_name)
            .ok_or_else(|| McpError::UnknownSession {
                name: session_name.to_string(),
            })?;
        session.invoke(tool, input, cancel).await
    }

    /// Tools in function-calling format, named by registry key.
    pub fn to_openai_tools(&self) -> Vec<Value> {
        self.tools()
            .iter()
            .map(|(key, tool)| {
                let def = tool.descriptor();
                serde_json::json!({
                    "type": "function",
                    "function": {
                        "name": key,
                        "description": def.description,
                        "parameters": def.input_schema,
                    }
                })
            })
            .collect()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
