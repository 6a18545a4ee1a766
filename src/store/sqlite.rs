// SQLite-backed session store
// A single-row key-value table, matching the layout the desktop client uses.

use std::path::PathBuf;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension};

use crate::auth::PersistedSession;

use super::SessionStore;

const RECORD_KEY: &str = "nimbus:session";

/// Stores the session record as a JSON value in an `auth_kv` table.
pub struct SqliteStore {
    path: PathBuf,
}

impl SqliteStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn open(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path)
            .with_context(|| format!("Failed to open SQLite database: {}", self.path.display()))?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS auth_kv (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
            [],
        )
        .context("Failed to create auth_kv table")?;
        Ok(conn)
    }
}

impl SessionStore for SqliteStore {
    fn load(&self) -> Result<Option<PersistedSession>> {
        if !self.path.exists() {
            return Ok(None);
        }

        let conn = self.open()?;
        let value: Option<String> = conn
            .query_row(
                "SELECT value FROM auth_kv WHERE key = ?",
                [RECORD_KEY],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to load session record from SQLite")?;

        match value {
            Some(json) => {
                let record: PersistedSession = serde_json::from_str(&json)
                    .context("Failed to parse session record from SQLite")?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    fn save(&self, record: &PersistedSession) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        let conn = self.open()?;
        let json = serde_json::to_string(record)?;
        conn.execute(
            "INSERT OR REPLACE INTO auth_kv (key, value) VALUES (?, ?)",
            [RECORD_KEY, json.as_str()],
        )
        .context("Failed to write session record to SQLite")?;

        Ok(())
    }

    fn clear(&self) -> Result<()> {
        if !self.path.exists() {
            return Ok(());
        }

        let conn = self.open()?;
        conn.execute("DELETE FROM auth_kv WHERE key = ?", [RECORD_KEY])
            .context("Failed to delete session record from SQLite")?;

        Ok(())
    }
}
