//! Canonical snapshot format.
//!
//! This is the on-disk layout of the in-memory backend and the export format
//! of every backend. Field names, including the `Reciepts` and `Payee`
//! spellings, are part of the wire contract.

use std::collections::HashSet;

use serde::{Deserialize, Deserializer, Serialize};
use time::OffsetDateTime;

use crate::storage::LedgerError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyUser {
    #[serde(rename = "ID")]
    pub id: u64,
    #[serde(rename = "UPN")]
    pub upn: String,
}

/// A receipt whose parties are positions in [`LegacyDatabase::users`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyReceipt {
    #[serde(rename = "Payer")]
    pub payer: u64,
    #[serde(rename = "Payee")]
    pub payee: u64,
    #[serde(rename = "NumMeals")]
    pub num_meals: i64,
    #[serde(rename = "DateTime", with = "time::serde::rfc3339")]
    pub date_time: OffsetDateTime,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyDatabase {
    #[serde(rename = "Users", default, deserialize_with = "null_as_empty")]
    pub users: Vec<LegacyUser>,
    #[serde(rename = "Reciepts", default, deserialize_with = "null_as_empty")]
    pub receipts: Vec<LegacyReceipt>,
}

// Older snapshots were written with `null` for empty lists.
fn null_as_empty<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}

impl LegacyDatabase {
    pub fn to_bytes(&self) -> Result<Vec<u8>, LedgerError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parses and validates a snapshot.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, LedgerError> {
        let db: LegacyDatabase = serde_json::from_slice(bytes)?;
        db.validate()?;
        Ok(db)
    }

    /// Checks that user ids are dense positions, usernames are unique and
    /// every receipt points at a known user.
    pub fn validate(&self) -> Result<(), LedgerError> {
        let mut seen = HashSet::with_capacity(self.users.len());
        for (position, user) in self.users.iter().enumerate() {
            if user.id != position as u64 {
                return Err(LedgerError::CorruptSnapshot(format!(
                    "user '{}' has id {} at position {}",
                    user.upn, user.id, position
                )));
            }
            if !seen.insert(user.upn.as_str()) {
                return Err(LedgerError::CorruptSnapshot(format!(
                    "duplicate user '{}'",
                    user.upn
                )));
            }
        }

        let known = self.users.len() as u64;
        for (i, receipt) in self.receipts.iter().enumerate() {
            if receipt.payer >= known || receipt.payee >= known {
                return Err(LedgerError::CorruptSnapshot(format!(
                    "receipt {} references unknown user ({} -> {})",
                    i, receipt.payer, receipt.payee
                )));
            }
        }
        Ok(())
    }
}
