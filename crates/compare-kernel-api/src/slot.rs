use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use compare_kernel_store_sqlite::SqliteStore;

/// Durable key/value slot holding the serialized selection.
pub trait SlotStorage: Send {
    /// # Errors
    /// Returns an error when the backing medium cannot be read.
    fn read_slot(&self, key: &str) -> Result<Option<String>>;

    /// # Errors
    /// Returns an error when the backing medium rejects the write.
    fn write_slot(&mut self, key: &str, value: &str) -> Result<()>;
}

impl SlotStorage for SqliteStore {
    fn read_slot(&self, key: &str) -> Result<Option<String>> {
        SqliteStore::read_slot(self, key)
    }

    fn write_slot(&mut self, key: &str, value: &str) -> Result<()> {
        SqliteStore::write_slot(self, key, value)
    }
}

/// Open the SQLite slot store at `path` and bring its schema up to date.
///
/// # Errors
/// Returns an error when the database cannot be opened or migrated.
pub fn open_sqlite_slots(path: &Path) -> Result<SqliteStore> {
    let mut store = SqliteStore::open(path)?;
    store
        .migrate()
        .with_context(|| format!("failed to migrate slot store {}", path.display()))?;
    Ok(store)
}

/// Process-local slot storage, used by embedders without a database and by tests.
#[derive(Debug, Clone, Default)]
pub struct MemorySlot {
    values: BTreeMap<String, String>,
}

impl MemorySlot {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_value(mut self, key: &str, value: &str) -> Self {
        self.values.insert(key.to_string(), value.to_string());
        self
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }
}

impl SlotStorage for MemorySlot {
    fn read_slot(&self, key: &str) -> Result<Option<String>> {
        Ok(self.values.get(key).cloned())
    }

    fn write_slot(&mut self, key: &str, value: &str) -> Result<()> {
        self.values.insert(key.to_string(), value.to_string());
        Ok(())
    }
}
