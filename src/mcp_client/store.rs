//! Persistent session configs.
//!
//! A registry with a store writes every added config before connecting it and
//! deletes it on removal, so the configured set survives restarts. Three
//! backends: a JSON file in the `mcpServers` layout hosts already hand-edit,
//! a SQLite table, and an in-memory map.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::errors::McpError;
use super::types::SessionConfig;

/// Keyed storage of session configs.
pub trait ConfigStore: Send + Sync {
    /// Every stored config. Entries that no longer parse are skipped.
    fn load_all(&self) -> Result<BTreeMap<String, SessionConfig>, McpError>;

    fn get(&self, name: &str) -> Result<Option<SessionConfig>, McpError>;

    /// Insert or replace.
    fn save(&self, name: &str, config: &SessionConfig) -> Result<(), McpError>;

    /// Removing an absent name is not an error.
    fn delete(&self, name: &str) -> Result<(), McpError>;

    fn has(&self, name: &str) -> Result<bool, McpError> {
        Ok(self.get(name)?.is_some())
    }
}

fn parse_entry(name: &str, value: Value) -> Option<SessionConfig> {
    match SessionConfig::from_value(name, value) {
        Ok(config) => Some(config),
        Err(e) => {
            tracing::warn!(session = name, error = %e, "skipping invalid stored config");
            None
        }
    }
}

// ─── JSON file ──────────────────────────────────────────────────────────────

#[derive(Debug, Default, Serialize, Deserialize)]
struct ServersFile {
    #[serde(default = "default_version")]
    version: u32,
    #[serde(rename = "mcpServers", alias = "servers", default)]
    servers: BTreeMap<String, Value>,
}

fn default_version() -> u32 {
    1
}

/// Configs kept in a JSON document: `{"version": 1, "mcpServers": {...}}`.
///
/// The file is re-read on every operation so edits made by hand between calls
/// are picked up. Entries are kept as raw JSON, so an entry this version
/// cannot parse is preserved when other entries are written.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `mcp-servers.json` in the platform data directory.
    pub fn default_path() -> PathBuf {
        crate::data_dir().join("mcp-servers.json")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<ServersFile, McpError> {
        if !self.path.exists() {
            return Ok(ServersFile {
                version: default_version(),
                servers: BTreeMap::new(),
            });
        }
        let content = std::fs::read_to_string(&self.path)?;
        if content.trim().is_empty() {
            return Ok(ServersFile {
                version: default_version(),
                servers: BTreeMap::new(),
            });
        }
        serde_json::from_str(&content).map_err(|e| McpError::Store {
            reason: format!("{}: {e}", self.path.display()),
        })
    }

    /// Write to a temp file, then rename over the original.
    fn write(&self, file: &ServersFile) -> Result<(), McpError> {
        let content = serde_json::to_string_pretty(file)?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp_path = self.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, content)?;
        std::fs::rename(&tmp_path, &self.path)?;
        tracing::debug!(
            count = file.servers.len(),
            path = %self.path.display(),
            "saved MCP server configs"
        );
        Ok(())
    }
}

impl ConfigStore for JsonFileStore {
    fn load_all(&self) -> Result<BTreeMap<String, SessionConfig>, McpError> {
        let file = self.read()?;
        let configs: BTreeMap<_, _> = file
            .servers
            .into_iter()
            .filter_map(|(name, value)| parse_entry(&name, value).map(|c| (name, c)))
            .collect();
        tracing::info!(
            count = configs.len(),
            path = %self.path.display(),
            "loaded MCP server configs"
        );
        Ok(configs)
    }

    fn get(&self, name: &str) -> Result<Option<SessionConfig>, McpError> {
        let mut file = self.read()?;
        Ok(file
            .servers
            .remove(name)
            .and_then(|value| parse_entry(name, value)))
    }

    fn save(&self, name: &str, config: &SessionConfig) -> Result<(), McpError> {
        let mut file = self.read()?;
        file.servers
            .insert(name.to_string(), serde_json::to_value(config)?);
        self.write(&file)
    }

    fn delete(&self, name: &str) -> Result<(), McpError> {
        let mut file = self.read()?;
        if file.servers.remove(name).is_some() {
            self.write(&file)?;
        }
        Ok(())
    }

    fn has(&self, name: &str) -> Result<bool, McpError> {
        Ok(self.read()?.servers.contains_key(name))
    }
}

// ─── SQLite ─────────────────────────────────────────────────────────────────

/// Configs kept in a `session_configs` table, one JSON document per row.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the store at the given path.
    ///
    /// Pass `":memory:"` for an in-memory database (tests).
    pub fn open(path: &str) -> Result<Self, McpError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS session_configs (
                name TEXT PRIMARY KEY,
                config TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            ",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ConfigStore for SqliteStore {
    fn load_all(&self) -> Result<BTreeMap<String, SessionConfig>, McpError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT name, config FROM session_configs ORDER BY name")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;

        let mut configs = BTreeMap::new();
        for (name, raw) in rows {
            let parsed = serde_json::from_str::<Value>(&raw)
                .ok()
                .and_then(|value| parse_entry(&name, value));
            if let Some(config) = parsed {
                configs.insert(name, config);
            }
        }
        Ok(configs)
    }

    fn get(&self, name: &str) -> Result<Option<SessionConfig>, McpError> {
        let raw: Option<String> = self
            .conn()
            .query_row(
                "SELECT config FROM session_configs WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        match raw {
            Some(raw) => Ok(parse_entry(name, serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    fn save(&self, name: &str, config: &SessionConfig) -> Result<(), McpError> {
        let raw = serde_json::to_string(config)?;
        self.conn().execute(
            "INSERT INTO session_configs (name, config, updated_at)
             VALUES (?1, ?2, datetime('now'))
             ON CONFLICT(name) DO UPDATE SET config = excluded.config,
                                             updated_at = excluded.updated_at",
            params![name, raw],
        )?;
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<(), McpError> {
        self.conn()
            .execute("DELETE FROM session_configs WHERE name = ?1", params![name])?;
        Ok(())
    }

    fn has(&self, name: &str) -> Result<bool, McpError> {
        let found: Option<i64> = self
            .conn()
            .query_row(
                "SELECT 1 FROM session_configs WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }
}

// ─── Memory ─────────────────────────────────────────────────────────────────

/// Process-local store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    configs: Mutex<BTreeMap<String, SessionConfig>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn configs(&self) -> MutexGuard<'_, BTreeMap<String, SessionConfig>> {
        self.configs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ConfigStore for MemoryStore {
    fn load_all(&self) -> Result<BTreeMap<String, SessionConfig>, McpError> {
        Ok(self.configs().clone())
    }

    fn get(&self, name: &str) -> Result<Option<SessionConfig>, McpError> {
        Ok(self.configs().get(name).cloned())
    }

    fn save(&self, name: &str, config: &SessionConfig) -> Result<(), McpError> {
        self.configs().insert(name.to_string(), config.clone());
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<(), McpError> {
        self.configs().remove(name);
        Ok(())
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
