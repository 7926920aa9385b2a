use clap::ValueEnum;
use serde::Deserialize;

use crate::{
    sqlite_storage::SqliteStorage,
    storage::{InMemoryStorage, LedgerBackend},
};

/// Ledger backend type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    /// In-memory ledger snapshotted to a JSON file
    Json,
    /// SQLite database
    Sqlite,
}

/// Returns an unopened store of the requested type; call `init` before use.
pub fn create(backend: BackendType) -> Box<dyn LedgerBackend> {
    match backend {
        BackendType::Json => Box::new(InMemoryStorage::new()),
        BackendType::Sqlite => Box::new(SqliteStorage::new()),
    }
}
