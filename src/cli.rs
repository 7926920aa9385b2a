//! Command dispatch for the `mealbot` binary.

use serde::Serialize;
use thiserror::Error;
use time::OffsetDateTime;

use mealbot_core::storage::{epoch, horizon};

use crate::{
    config::Command,
    storage::{LedgerBackend, LedgerError, UNLIMITED},
};

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("usage: {0}")]
    Usage(&'static str),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("failed to encode output: {0}")]
    Encode(#[from] serde_json::Error),
}

impl CommandError {
    /// 2 for caller mistakes, 1 for store failures.
    pub fn exit_code(&self) -> u8 {
        match self {
            CommandError::Usage(_) => 2,
            CommandError::Ledger(e) if e.is_client_error() => 2,
            _ => 1,
        }
    }
}

fn window(start: Option<OffsetDateTime>, end: Option<OffsetDateTime>) -> Result<Option<(OffsetDateTime, OffsetDateTime)>, CommandError> {
    match (start, end) {
        (Some(start), Some(end)) => Ok(Some((start, end))),
        (None, None) => Ok(None),
        _ => Err(CommandError::Usage("--start and --end must be given together")),
    }
}

fn json<T: Serialize>(value: &T) -> Result<String, CommandError> {
    Ok(serde_json::to_string_pretty(value)?)
}

/// Runs one command against an open store and returns what to print.
pub fn execute(store: &dyn LedgerBackend, command: &Command) -> Result<String, CommandError> {
    match command {
        Command::Users => json(&store.get_users()?),
        Command::Whoami { id } => Ok(store.get_user_by_id(*id)?.username),
        Command::AddUser { name } => {
            store.create_user(name)?;
            Ok(String::new())
        }
        Command::Record { payer, recipient, credits } => {
            store.create_record(payer, recipient, *credits)?;
            Ok(String::new())
        }
        Command::Records { user1, user2, limit, start, end } => {
            let (start, end) = window(*start, *end)?.unwrap_or_else(|| (epoch(), horizon()));
            let limit = limit.unwrap_or(UNLIMITED);
            let records = match (user1, user2) {
                (None, None) => store.get_timebound_records(limit, start, end)?,
                (Some(u1), None) => store.get_timebound_records_for_user(u1, limit, start, end)?,
                (Some(u1), Some(u2)) => store.get_timebound_records_between_users(u1, u2, limit, start, end)?,
                (None, Some(_)) => return Err(CommandError::Usage("--user2 requires --user1")),
            };
            json(&records)
        }
        Command::Summary { user, start, end } => match (user, window(*start, *end)?) {
            (None, None) => json(&store.get_summary()?),
            (Some(user), None) => json(&store.get_summary_for_user(user)?),
            (Some(user), Some((start, end))) => json(&store.get_timebound_summary_for_user(user, start, end)?),
            (None, Some(_)) => Err(CommandError::Usage("a time window requires --user")),
        },
        Command::Debts => Ok(store.debt_table()?.to_string()),
        Command::Export => Ok(String::from_utf8_lossy(&store.get_legacy_database()?).into_owned()),
    }
}
