use time::{Duration, OffsetDateTime};

use crate::models::{Account, DebtTable, GlobalSummary, Record, Summary};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("no such user: {0}")]
    NoUser(String),
    #[error("user already exists: {0}")]
    UserExists(String),
    #[error("no such user: payer {0}")]
    PayerDoesNotExist(String),
    #[error("no such user: recipient {0}")]
    RecipientDoesNotExist(String),
    #[error("not implemented")]
    NotImplemented,
    #[error("there is no active database connection")]
    NoActiveStore,
    #[error("store is already open")]
    AlreadyOpen,
    #[error("corrupt snapshot: {0}")]
    CorruptSnapshot(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("{0}")]
    Other(String),
}

impl LedgerError {
    /// True for every flavour of missing account, including the
    /// payer/recipient refinements raised by record creation.
    pub fn is_no_user(&self) -> bool {
        matches!(
            self,
            LedgerError::NoUser(_)
                | LedgerError::PayerDoesNotExist(_)
                | LedgerError::RecipientDoesNotExist(_)
        )
    }

    /// Errors caused by the caller's input rather than by the store.
    pub fn is_client_error(&self) -> bool {
        self.is_no_user() || matches!(self, LedgerError::UserExists(_))
    }
}

/// Limit that returns every matching record.
pub const UNLIMITED: u64 = u64::MAX;

/// Start of the all-time window.
pub fn epoch() -> OffsetDateTime {
    OffsetDateTime::UNIX_EPOCH
}

/// End of the all-time window: one day past the current instant.
pub fn horizon() -> OffsetDateTime {
    OffsetDateTime::now_utc() + Duration::days(1)
}

/// Operations every ledger store provides.
///
/// Backends implement the primitives; the unfiltered and unbounded variants
/// are provided methods built on the time-bounded ones. Windows are inclusive
/// on both ends and records come back newest first.
pub trait LedgerBackend: Send + Sync {
    /// Opens or creates the store at `location`.
    fn init(&self, location: &str) -> Result<(), LedgerError>;
    /// Flushes pending state and releases the store.
    fn close(&self) -> Result<(), LedgerError>;

    /// The whole store in the canonical snapshot format.
    fn get_legacy_database(&self) -> Result<Vec<u8>, LedgerError>;

    fn get_user(&self, username: &str) -> Result<Account, LedgerError>;
    /// Looks up an account by its creation-order position.
    fn get_user_by_id(&self, id: u64) -> Result<Account, LedgerError>;
    /// All accounts in creation order.
    fn get_users(&self) -> Result<Vec<Account>, LedgerError>;

    fn create_user(&self, username: &str) -> Result<(), LedgerError>;
    fn create_record(&self, payer: &str, recipient: &str, credits: u32) -> Result<(), LedgerError>;

    fn get_timebound_records(&self, limit: u64, start: OffsetDateTime, end: OffsetDateTime) -> Result<Vec<Record>, LedgerError>;
    fn get_timebound_records_for_user(&self, user: &str, limit: u64, start: OffsetDateTime, end: OffsetDateTime) -> Result<Vec<Record>, LedgerError>;
    fn get_timebound_records_between_users(&self, user1: &str, user2: &str, limit: u64, start: OffsetDateTime, end: OffsetDateTime) -> Result<Vec<Record>, LedgerError>;

    /// Per-counterparty summary for `user`, with an entry for every account.
    fn get_timebound_summary_for_user(&self, user: &str, start: OffsetDateTime, end: OffsetDateTime) -> Result<Summary, LedgerError>;

    fn get_records(&self, limit: u64) -> Result<Vec<Record>, LedgerError> {
        self.get_timebound_records(limit, epoch(), horizon())
    }

    fn get_all_records(&self) -> Result<Vec<Record>, LedgerError> {
        self.get_timebound_records(UNLIMITED, epoch(), horizon())
    }

    fn get_records_for_user(&self, user: &str, limit: u64) -> Result<Vec<Record>, LedgerError> {
        self.get_timebound_records_for_user(user, limit, epoch(), horizon())
    }

    fn get_all_records_for_user(&self, user: &str) -> Result<Vec<Record>, LedgerError> {
        self.get_timebound_records_for_user(user, UNLIMITED, epoch(), horizon())
    }

    fn get_records_between_users(&self, user1: &str, user2: &str, limit: u64) -> Result<Vec<Record>, LedgerError> {
        self.get_timebound_records_between_users(user1, user2, limit, epoch(), horizon())
    }

    fn get_all_records_between_users(&self, user1: &str, user2: &str) -> Result<Vec<Record>, LedgerError> {
        self.get_timebound_records_between_users(user1, user2, UNLIMITED, epoch(), horizon())
    }

    fn get_summary_for_user(&self, user: &str) -> Result<Summary, LedgerError> {
        self.get_timebound_summary_for_user(user, epoch(), horizon())
    }

    /// Every account's summary; not computed independently.
    fn get_summary(&self) -> Result<GlobalSummary, LedgerError> {
        let mut result = GlobalSummary::new();
        for user in self.get_users()? {
            let summary = self.get_summary_for_user(&user.username)?;
            result.insert(user.username, summary);
        }
        Ok(result)
    }

    fn debt_table(&self) -> Result<DebtTable, LedgerError> {
        let users = self.get_users()?;
        let summary = self.get_summary()?;
        Ok(DebtTable::from_summary(&users, &summary))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(LedgerError::NoUser("a".into()).is_no_user());
        assert!(LedgerError::PayerDoesNotExist("a".into()).is_no_user());
        assert!(LedgerError::RecipientDoesNotExist("a".into()).is_no_user());
        assert!(!LedgerError::UserExists("a".into()).is_no_user());

        assert!(LedgerError::UserExists("a".into()).is_client_error());
        assert!(LedgerError::RecipientDoesNotExist("a".into()).is_client_error());
        assert!(!LedgerError::NoActiveStore.is_client_error());
        assert!(!LedgerError::Other("disk on fire".into()).is_client_error());
        assert!(!LedgerError::NotImplemented.is_client_error());
    }

    #[test]
    fn test_all_time_window_covers_now() {
        let now = OffsetDateTime::now_utc();
        assert!(epoch() < now);
        assert!(horizon() > now + Duration::hours(23));
    }
}
