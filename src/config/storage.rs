//! Storage configuration types.

use serde::Deserialize;

/// Path value selecting a private in-memory database.
pub const MEMORY_PATH: &str = ":memory:";

/// SQLite storage configuration.
///
/// Records and the outbox share this database so both writes can commit in
/// one transaction.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Path to the database file, or `:memory:`.
    pub path: String,
    /// Maximum pooled connections (file databases only).
    pub max_connections: u32,
    /// How long a writer waits on a locked database before failing.
    pub busy_timeout_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: "./data/carga.db".to_string(),
            max_connections: 5,
            busy_timeout_secs: 30,
        }
    }
}

impl StorageConfig {
    /// Configuration for a file-backed database.
    pub fn file(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    /// Configuration for an in-memory database.
    pub fn memory() -> Self {
        Self::file(MEMORY_PATH)
    }

    pub fn is_memory(&self) -> bool {
        self.path == MEMORY_PATH || self.path == "sqlite::memory:"
    }
}
