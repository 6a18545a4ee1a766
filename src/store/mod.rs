// Durable session storage
// One small record per store; absence of the record is the normal
// "never authenticated" state, not an error.

mod file;
mod sqlite;

pub use file::JsonFileStore;
pub use sqlite::SqliteStore;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use anyhow::Result;

use crate::auth::PersistedSession;

/// Key-value persistence handle consumed by the session manager.
///
/// The manager is the only writer; a store implementation only has to
/// tolerate being read by a separate short-lived process at startup.
pub trait SessionStore: Send + Sync {
    /// Read the stored record, if any.
    fn load(&self) -> Result<Option<PersistedSession>>;

    /// Replace the stored record.
    fn save(&self, record: &PersistedSession) -> Result<()>;

    /// Delete the stored record. Deleting an absent record is not an error.
    fn clear(&self) -> Result<()>;
}

/// In-memory store for tests and embedders that manage persistence
/// themselves. Counts writes so tests can assert debounce coalescing.
#[derive(Default)]
pub struct MemoryStore {
    record: Mutex<Option<PersistedSession>>,
    saves: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store with an existing record.
    pub fn with_record(record: PersistedSession) -> Self {
        Self {
            record: Mutex::new(Some(record)),
            saves: AtomicUsize::new(0),
        }
    }

    /// Number of `save` calls observed.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

impl SessionStore for MemoryStore {
    fn load(&self) -> Result<Option<PersistedSession>> {
        Ok(self.record.lock().unwrap().clone())
    }

    fn save(&self, record: &PersistedSession) -> Result<()> {
        *self.record.lock().unwrap() = Some(record.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        *self.record.lock().unwrap() = None;
        Ok(())
    }
}
