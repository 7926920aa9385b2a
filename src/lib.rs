//! Shared-meal debt ledger with an in-memory JSON-snapshotted store and a
//! SQLite store behind one contract.

pub mod cli;
pub mod config;
pub mod factory;
pub mod flush;
pub mod logging;
pub mod sqlite_storage;
pub mod storage;
