use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use parking_lot::{Mutex, RwLock};
use time::OffsetDateTime;

use mealbot_core::{
    summary::{apply_receipt, empty_summary},
    Account, LegacyDatabase, LegacyReceipt, LegacyUser, Record, Summary,
};

use crate::flush::{FlushHandle, FlushWorker, Snapshot};

// Re-export core storage types so callers can use crate::storage::*
pub use mealbot_core::storage::{LedgerBackend, LedgerError, UNLIMITED};

/// Accounts and receipts held in memory, in their snapshot shape, plus a
/// name lookup. `flush` is `Some` only while the store is open; mutations
/// read it under the write lock.
#[derive(Default)]
struct Ledger {
    db: LegacyDatabase,
    positions: HashMap<String, u64>,
    flush: Option<FlushHandle>,
}

impl Snapshot for Ledger {
    fn snapshot(&self) -> &LegacyDatabase {
        &self.db
    }
}

impl Ledger {
    fn from_snapshot(db: LegacyDatabase) -> Self {
        let positions = db.users.iter().map(|u| (u.upn.clone(), u.id)).collect();
        Self {
            db,
            positions,
            flush: None,
        }
    }

    fn load(path: &Path) -> Result<Self, LedgerError> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "No snapshot found, starting empty");
            return Ok(Self::default());
        }
        let bytes = std::fs::read(path)?;
        let db = LegacyDatabase::from_bytes(&bytes)?;
        tracing::debug!(
            path = %path.display(),
            users = db.users.len(),
            receipts = db.receipts.len(),
            "Snapshot loaded"
        );
        Ok(Self::from_snapshot(db))
    }

    fn position(&self, username: &str) -> Option<u64> {
        self.positions.get(username).copied()
    }

    fn flush_handle(&self) -> Result<FlushHandle, LedgerError> {
        self.flush.clone().ok_or(LedgerError::NoActiveStore)
    }

    fn require(&self, username: &str) -> Result<u64, LedgerError> {
        self.position(username)
            .ok_or_else(|| LedgerError::NoUser(username.to_string()))
    }

    fn username(&self, id: u64) -> &str {
        &self.db.users[id as usize].upn
    }

    fn to_record(&self, receipt: &LegacyReceipt) -> Record {
        Record {
            payer: self.username(receipt.payer).to_string(),
            recipient: self.username(receipt.payee).to_string(),
            credits: receipt.num_meals,
            date: receipt.date_time,
        }
    }

    /// Newest-first scan over receipts inside `[start, end]`.
    fn collect_records<F>(&self, limit: u64, start: OffsetDateTime, end: OffsetDateTime, filter: F) -> Vec<Record>
    where
        F: Fn(&LegacyReceipt) -> bool,
    {
        let limit = usize::try_from(limit).unwrap_or(usize::MAX);
        self.db
            .receipts
            .iter()
            .rev()
            .filter(|r| r.date_time >= start && r.date_time <= end)
            .filter(|r| filter(r))
            .take(limit)
            .map(|r| self.to_record(r))
            .collect()
    }
}

/// Ledger kept entirely in memory and snapshotted to a JSON file by a
/// background worker after every mutation.
pub struct InMemoryStorage {
    ledger: Arc<RwLock<Ledger>>,
    worker: Mutex<Option<FlushWorker>>,
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self {
            ledger: Arc::new(RwLock::new(Ledger::default())),
            worker: Mutex::new(None),
        }
    }

    fn ensure_open(&self) -> Result<(), LedgerError> {
        if self.worker.lock().is_some() {
            Ok(())
        } else {
            Err(LedgerError::NoActiveStore)
        }
    }
}

impl Drop for InMemoryStorage {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.get_mut().take() {
            self.ledger.write().flush = None;
            if let Err(e) = worker.shutdown() {
                tracing::error!(error = %e, "Final flush failed while dropping store");
            }
        }
    }
}

impl LedgerBackend for InMemoryStorage {
    fn init(&self, location: &str) -> Result<(), LedgerError> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Err(LedgerError::AlreadyOpen);
        }

        let path = PathBuf::from(location);
        *self.ledger.write() = Ledger::load(&path)?;
        let spawned = FlushWorker::spawn(self.ledger.clone(), path)?;
        self.ledger.write().flush = Some(spawned.handle());
        *worker = Some(spawned);
        tracing::debug!(location, "In-memory store opened");
        Ok(())
    }

    fn close(&self) -> Result<(), LedgerError> {
        let worker = self.worker.lock().take().ok_or(LedgerError::NoActiveStore)?;
        // Every mutation acknowledged before this point has already queued
        // its flush ahead of the shutdown signal.
        self.ledger.write().flush = None;
        worker.shutdown()?;
        tracing::debug!("In-memory store closed");
        Ok(())
    }

    fn get_legacy_database(&self) -> Result<Vec<u8>, LedgerError> {
        self.ensure_open()?;
        self.ledger.read().db.to_bytes()
    }

    fn get_user(&self, username: &str) -> Result<Account, LedgerError> {
        self.ensure_open()?;
        let ledger = self.ledger.read();
        ledger.require(username)?;
        Ok(Account::new(username))
    }

    fn get_user_by_id(&self, id: u64) -> Result<Account, LedgerError> {
        self.ensure_open()?;
        let ledger = self.ledger.read();
        ledger
            .db
            .users
            .get(usize::try_from(id).unwrap_or(usize::MAX))
            .map(|u| Account::new(u.upn.clone()))
            .ok_or_else(|| LedgerError::NoUser(format!("#{}", id)))
    }

    fn get_users(&self) -> Result<Vec<Account>, LedgerError> {
        self.ensure_open()?;
        let ledger = self.ledger.read();
        Ok(ledger.db.users.iter().map(|u| Account::new(u.upn.clone())).collect())
    }

    fn create_user(&self, username: &str) -> Result<(), LedgerError> {
        {
            let mut ledger = self.ledger.write();
            let flush = ledger.flush_handle()?;
            if ledger.position(username).is_some() {
                return Err(LedgerError::UserExists(username.to_string()));
            }
            let id = ledger.db.users.len() as u64;
            ledger.db.users.push(LegacyUser { id, upn: username.to_string() });
            ledger.positions.insert(username.to_string(), id);
            flush.request();
        }
        tracing::debug!(username, "User created");
        Ok(())
    }

    fn create_record(&self, payer: &str, recipient: &str, credits: u32) -> Result<(), LedgerError> {
        {
            let mut ledger = self.ledger.write();
            let flush = ledger.flush_handle()?;
            let payer_id = ledger
                .position(payer)
                .ok_or_else(|| LedgerError::PayerDoesNotExist(payer.to_string()))?;
            let payee_id = ledger
                .position(recipient)
                .ok_or_else(|| LedgerError::RecipientDoesNotExist(recipient.to_string()))?;
            ledger.db.receipts.push(LegacyReceipt {
                payer: payer_id,
                payee: payee_id,
                num_meals: i64::from(credits),
                date_time: OffsetDateTime::now_utc(),
            });
            flush.request();
        }
        tracing::debug!(payer, recipient, credits, "Record created");
        Ok(())
    }

    fn get_timebound_records(&self, limit: u64, start: OffsetDateTime, end: OffsetDateTime) -> Result<Vec<Record>, LedgerError> {
        self.ensure_open()?;
        let ledger = self.ledger.read();
        Ok(ledger.collect_records(limit, start, end, |_| true))
    }

    fn get_timebound_records_for_user(&self, user: &str, limit: u64, start: OffsetDateTime, end: OffsetDateTime) -> Result<Vec<Record>, LedgerError> {
        self.ensure_open()?;
        let ledger = self.ledger.read();
        let id = ledger.require(user)?;
        Ok(ledger.collect_records(limit, start, end, |r| r.payer == id || r.payee == id))
    }

    fn get_timebound_records_between_users(&self, user1: &str, user2: &str, limit: u64, start: OffsetDateTime, end: OffsetDateTime) -> Result<Vec<Record>, LedgerError> {
        self.ensure_open()?;
        let ledger = self.ledger.read();
        let id1 = ledger.require(user1)?;
        let id2 = ledger.require(user2)?;
        Ok(ledger.collect_records(limit, start, end, |r| {
            (r.payer == id1 && r.payee == id2) || (r.payer == id2 && r.payee == id1)
        }))
    }

    fn get_timebound_summary_for_user(&self, user: &str, start: OffsetDateTime, end: OffsetDateTime) -> Result<Summary, LedgerError> {
        self.ensure_open()?;
        let ledger = self.ledger.read();
        let id = ledger.require(user)?;

        let mut summary = empty_summary(ledger.db.users.iter().map(|u| u.upn.as_str()));
        for receipt in &ledger.db.receipts {
            if receipt.date_time < start || receipt.date_time > end {
                continue;
            }
            if receipt.payer != id && receipt.payee != id {
                continue;
            }
            apply_receipt(
                &mut summary,
                user,
                ledger.username(receipt.payer),
                ledger.username(receipt.payee),
                receipt.num_meals,
            );
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mealbot_core::SummaryRecord;
    use time::macros::datetime;

    fn open(dir: &tempfile::TempDir) -> (InMemoryStorage, PathBuf) {
        let path = dir.path().join("Database.json");
        let storage = InMemoryStorage::new();
        storage.init(path.to_str().unwrap()).unwrap();
        (storage, path)
    }

    #[test]
    fn test_memory_basic_operations() {
        let dir = tempfile::tempdir().unwrap();
        let (storage, _) = open(&dir);

        storage.create_user("alice").unwrap();
        storage.create_user("bob").unwrap();
        storage.create_record("alice", "bob", 2).unwrap();

        assert_eq!(storage.get_user("bob").unwrap(), Account::new("bob"));
        assert_eq!(storage.get_user_by_id(0).unwrap(), Account::new("alice"));
        assert!(matches!(storage.get_user_by_id(2), Err(LedgerError::NoUser(_))));
        assert!(matches!(storage.get_user("carol"), Err(LedgerError::NoUser(_))));

        let summary = storage.get_summary_for_user("alice").unwrap();
        assert_eq!(summary["bob"].outgoing_credits, 2);
        assert_eq!(summary["alice"], SummaryRecord::default());

        storage.close().unwrap();
    }

    #[test]
    fn test_memory_unopened_store_is_inactive() {
        let storage = InMemoryStorage::new();
        assert!(matches!(storage.create_user("alice"), Err(LedgerError::NoActiveStore)));
        assert!(matches!(storage.get_users(), Err(LedgerError::NoActiveStore)));
        assert!(matches!(storage.close(), Err(LedgerError::NoActiveStore)));
    }

    #[test]
    fn test_memory_double_init_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (storage, path) = open(&dir);
        assert!(matches!(
            storage.init(path.to_str().unwrap()),
            Err(LedgerError::AlreadyOpen)
        ));
        storage.close().unwrap();
    }

    #[test]
    fn test_memory_close_writes_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let (storage, path) = open(&dir);
        storage.create_user("alice").unwrap();
        storage.create_user("bob").unwrap();
        storage.create_record("bob", "alice", 4).unwrap();
        storage.close().unwrap();

        let db = LegacyDatabase::from_bytes(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(db.users.len(), 2);
        assert_eq!(db.users[1], LegacyUser { id: 1, upn: "bob".into() });
        assert_eq!(db.receipts.len(), 1);
        assert_eq!((db.receipts[0].payer, db.receipts[0].payee, db.receipts[0].num_meals), (1, 0, 4));
    }

    #[test]
    fn test_memory_close_keeps_every_acknowledged_record() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        for _ in 0..20 {
            let dir = tempfile::tempdir().unwrap();
            let (storage, path) = open(&dir);
            storage.create_user("a").unwrap();
            storage.create_user("b").unwrap();
            let acked = AtomicUsize::new(0);

            std::thread::scope(|s| {
                for _ in 0..4 {
                    s.spawn(|| loop {
                        match storage.create_record("a", "b", 1) {
                            Ok(()) => {
                                acked.fetch_add(1, Ordering::SeqCst);
                            }
                            Err(e) => {
                                assert!(matches!(e, LedgerError::NoActiveStore));
                                break;
                            }
                        }
                    });
                }
                while acked.load(Ordering::SeqCst) < 50 {
                    std::thread::yield_now();
                }
                storage.close().unwrap();
            });

            let db = LegacyDatabase::from_bytes(&std::fs::read(&path).unwrap()).unwrap();
            assert_eq!(db.receipts.len(), acked.load(Ordering::SeqCst));
        }
    }

    #[test]
    fn test_memory_drop_flushes() {
        let dir = tempfile::tempdir().unwrap();
        let path = {
            let (storage, path) = open(&dir);
            storage.create_user("alice").unwrap();
            path
        };
        let db = LegacyDatabase::from_bytes(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(db.users[0].upn, "alice");
    }

    #[test]
    fn test_memory_corrupt_snapshot_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Database.json");
        std::fs::write(&path, br#"{"Users":[{"ID":3,"UPN":"x"}],"Reciepts":[]}"#).unwrap();

        let storage = InMemoryStorage::new();
        assert!(matches!(
            storage.init(path.to_str().unwrap()),
            Err(LedgerError::CorruptSnapshot(_))
        ));
        assert!(matches!(storage.get_users(), Err(LedgerError::NoActiveStore)));
    }

    #[test]
    fn test_memory_loaded_negative_receipts_flip_direction() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Database.json");
        let db = LegacyDatabase {
            users: vec![
                LegacyUser { id: 0, upn: "alice".into() },
                LegacyUser { id: 1, upn: "bob".into() },
            ],
            receipts: vec![
                LegacyReceipt { payer: 0, payee: 1, num_meals: 3, date_time: datetime!(2021-01-01 0:00 UTC) },
                LegacyReceipt { payer: 0, payee: 1, num_meals: -1, date_time: datetime!(2021-01-02 0:00 UTC) },
            ],
        };
        std::fs::write(&path, db.to_bytes().unwrap()).unwrap();

        let storage = InMemoryStorage::new();
        storage.init(path.to_str().unwrap()).unwrap();
        let alice = storage.get_summary_for_user("alice").unwrap();
        let bob = storage.get_summary_for_user("bob").unwrap();
        assert_eq!(alice["bob"], SummaryRecord { incoming_credits: 1, outgoing_credits: 3 });
        assert_eq!(bob["alice"], SummaryRecord { incoming_credits: 3, outgoing_credits: 1 });

        let window = storage
            .get_timebound_summary_for_user("alice", datetime!(2021-01-02 0:00 UTC), datetime!(2021-01-03 0:00 UTC))
            .unwrap();
        assert_eq!(window["bob"], SummaryRecord { incoming_credits: 1, outgoing_credits: 0 });
        storage.close().unwrap();
    }
}
