//! Core types and traits for Mealbot ledger backends.
//!
//! This crate provides the `LedgerBackend` trait, the value types it returns
//! and the canonical snapshot format, so concrete stores can live elsewhere.

pub mod models;
pub mod snapshot;
pub mod storage;
pub mod summary;

// Re-export key types at crate root for convenience
pub use models::{Account, DebtTable, GlobalSummary, Record, Summary, SummaryRecord};
pub use snapshot::{LegacyDatabase, LegacyReceipt, LegacyUser};
pub use storage::{LedgerBackend, LedgerError, UNLIMITED};
