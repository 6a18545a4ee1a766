// JSON-file-backed session store

use std::path::PathBuf;

use anyhow::{Context, Result};

use crate::auth::PersistedSession;

use super::SessionStore;

/// Stores the session record as a single pretty-printed JSON file.
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl SessionStore for JsonFileStore {
    fn load(&self) -> Result<Option<PersistedSession>> {
        if !self.path.exists() {
            return Ok(None);
        }

        let contents = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read session file: {}", self.path.display()))?;
        let record: PersistedSession = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse session file: {}", self.path.display()))?;

        Ok(Some(record))
    }

    fn save(&self, record: &PersistedSession) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        let contents = serde_json::to_string_pretty(record)?;
        std::fs::write(&self.path, contents)
            .with_context(|| format!("Failed to write session file: {}", self.path.display()))?;

        Ok(())
    }

    fn clear(&self) -> Result<()> {
        if self.path.exists() {
            std::fs::remove_file(&self.path)
                .with_context(|| format!("Failed to delete session file: {}", self.path.display()))?;
        }
        Ok(())
    }
}
