use std::collections::HashMap;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use time::OffsetDateTime;

use mealbot_core::{
    summary::empty_summary, Account, LegacyDatabase, LegacyReceipt, LegacyUser, Record, Summary,
};

use crate::storage::{LedgerBackend, LedgerError};

pub struct SqliteStorage {
    conn: Mutex<Option<Connection>>,
}

impl Default for SqliteStorage {
    fn default() -> Self {
        Self::new()
    }
}

fn db_err(e: rusqlite::Error) -> LedgerError {
    LedgerError::Other(e.to_string())
}

fn to_unix(t: OffsetDateTime) -> i64 {
    t.unix_timestamp()
}

fn from_unix(secs: i64) -> Result<OffsetDateTime, LedgerError> {
    OffsetDateTime::from_unix_timestamp(secs)
        .map_err(|e| LedgerError::Other(format!("Invalid timestamp {}: {}", secs, e)))
}

fn sql_limit(limit: u64) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn record_row(row: &Row) -> rusqlite::Result<(String, String, i64, i64)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

fn into_records(rows: Vec<(String, String, i64, i64)>) -> Result<Vec<Record>, LedgerError> {
    rows.into_iter()
        .map(|(payer, recipient, credits, date)| {
            Ok(Record {
                payer,
                recipient,
                credits,
                date: from_unix(date)?,
            })
        })
        .collect()
}

impl SqliteStorage {
    pub fn new() -> Self {
        Self {
            conn: Mutex::new(None),
        }
    }

    fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T, LedgerError>) -> Result<T, LedgerError> {
        let mut guard = self.conn.lock();
        let conn = guard.as_mut().ok_or(LedgerError::NoActiveStore)?;
        f(conn)
    }

    fn init_schema(conn: &Connection) -> Result<(), LedgerError> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS Users (
                ID INTEGER PRIMARY KEY AUTOINCREMENT,
                Username TEXT UNIQUE NOT NULL
            );

            CREATE TABLE IF NOT EXISTS Reciepts (
                ID INTEGER PRIMARY KEY AUTOINCREMENT,
                Date INTEGER,
                Credits INTEGER,
                Payer TEXT NOT NULL,
                Recipient TEXT NOT NULL,
                FOREIGN KEY (Payer) REFERENCES Users (Username),
                FOREIGN KEY (Recipient) REFERENCES Users (Username)
            );

            CREATE INDEX IF NOT EXISTS idx_reciepts_date
                ON Reciepts(Date);
            ",
        )
        .map_err(db_err)
    }

    fn user_exists(conn: &Connection, username: &str) -> Result<bool, LedgerError> {
        conn.query_row(
            "SELECT COUNT(*) > 0 FROM Users WHERE Username = ?1",
            params![username],
            |row| row.get(0),
        )
        .map_err(db_err)
    }

    fn require_user(conn: &Connection, username: &str) -> Result<(), LedgerError> {
        if Self::user_exists(conn, username)? {
            Ok(())
        } else {
            Err(LedgerError::NoUser(username.to_string()))
        }
    }

    fn usernames(conn: &Connection) -> Result<Vec<String>, LedgerError> {
        let mut stmt = conn
            .prepare("SELECT Username FROM Users ORDER BY ID")
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;
        Ok(rows)
    }

    fn query_records<P: rusqlite::Params>(conn: &Connection, sql: &str, params: P) -> Result<Vec<Record>, LedgerError> {
        let mut stmt = conn.prepare(sql).map_err(db_err)?;
        let rows = stmt
            .query_map(params, record_row)
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;
        into_records(rows)
    }

    /// Adds one direction of `user`'s traffic to `summary`. `own` is the
    /// column holding `user`, `other` the counterparty column. Negative
    /// credits are summed separately and credited the other way.
    fn fold_direction(
        conn: &Connection,
        summary: &mut Summary,
        user: &str,
        own: &str,
        other: &str,
        start: i64,
        end: i64,
    ) -> Result<(), LedgerError> {
        let query = format!(
            "SELECT {other},
                    COALESCE(SUM(CASE WHEN Credits >= 0 THEN Credits ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN Credits < 0 THEN -Credits ELSE 0 END), 0)
             FROM Reciepts
             WHERE {own} = ?1 AND Date BETWEEN ?2 AND ?3
             GROUP BY {other}",
            own = own,
            other = other,
        );
        let mut stmt = conn.prepare(&query).map_err(db_err)?;
        let rows = stmt
            .query_map(params![user, start, end], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?, row.get::<_, i64>(2)?))
            })
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;

        let paid = own == "Payer";
        for (counterparty, positive, reversed) in rows {
            let entry = summary.entry(counterparty).or_default();
            let (forward, backward) = (positive.unsigned_abs(), reversed.unsigned_abs());
            if paid {
                entry.outgoing_credits += forward;
                entry.incoming_credits += backward;
            } else {
                entry.incoming_credits += forward;
                entry.outgoing_credits += backward;
            }
        }
        Ok(())
    }
}

impl LedgerBackend for SqliteStorage {
    fn init(&self, location: &str) -> Result<(), LedgerError> {
        let mut guard = self.conn.lock();
        if guard.is_some() {
            return Err(LedgerError::AlreadyOpen);
        }

        let conn = if location == ":memory:" {
            Connection::open_in_memory()
        } else {
            Connection::open(location)
        }
        .map_err(db_err)?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(db_err)?;
        Self::init_schema(&conn)?;

        *guard = Some(conn);
        tracing::debug!(location, "SQLite store opened");
        Ok(())
    }

    fn close(&self) -> Result<(), LedgerError> {
        let conn = self.conn.lock().take().ok_or(LedgerError::NoActiveStore)?;
        conn.close().map_err(|(_, e)| db_err(e))?;
        tracing::debug!("SQLite store closed");
        Ok(())
    }

    fn get_legacy_database(&self) -> Result<Vec<u8>, LedgerError> {
        self.with_conn(|conn| {
            let names = Self::usernames(conn)?;
            let records = Self::query_records(
                conn,
                "SELECT Payer, Recipient, Credits, Date
                 FROM Reciepts
                 ORDER BY Date ASC, ID ASC",
                [],
            )?;

            let lookup: HashMap<&str, u64> = names
                .iter()
                .enumerate()
                .map(|(i, name)| (name.as_str(), i as u64))
                .collect();
            let position = |name: &str| {
                lookup.get(name).copied().ok_or_else(|| {
                    LedgerError::CorruptSnapshot(format!("receipt references unknown user '{}'", name))
                })
            };

            let mut db = LegacyDatabase {
                users: names
                    .iter()
                    .enumerate()
                    .map(|(i, name)| LegacyUser { id: i as u64, upn: name.clone() })
                    .collect(),
                receipts: Vec::with_capacity(records.len()),
            };
            for record in &records {
                db.receipts.push(LegacyReceipt {
                    payer: position(record.payer.as_str())?,
                    payee: position(record.recipient.as_str())?,
                    num_meals: record.credits,
                    date_time: record.date,
                });
            }

            db.to_bytes()
        })
    }

    fn get_user(&self, username: &str) -> Result<Account, LedgerError> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT Username FROM Users WHERE Username = ?1",
                params![username],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .map_err(db_err)?
            .map(Account::new)
            .ok_or_else(|| LedgerError::NoUser(username.to_string()))
        })
    }

    fn get_user_by_id(&self, id: u64) -> Result<Account, LedgerError> {
        let offset = i64::try_from(id).map_err(|_| LedgerError::NoUser(format!("#{}", id)))?;
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT Username FROM Users ORDER BY ID LIMIT 1 OFFSET ?1",
                params![offset],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .map_err(db_err)?
            .map(Account::new)
            .ok_or_else(|| LedgerError::NoUser(format!("#{}", id)))
        })
    }

    fn get_users(&self) -> Result<Vec<Account>, LedgerError> {
        self.with_conn(|conn| Ok(Self::usernames(conn)?.into_iter().map(Account::new).collect()))
    }

    fn create_user(&self, username: &str) -> Result<(), LedgerError> {
        self.with_conn(|conn| {
            if Self::user_exists(conn, username)? {
                return Err(LedgerError::UserExists(username.to_string()));
            }

            let tx = conn.transaction().map_err(db_err)?;
            if let Err(e) = tx.execute("INSERT INTO Users (Username) VALUES (?1)", params![username]) {
                tx.rollback().map_err(db_err)?;
                return Err(db_err(e));
            }
            tx.commit().map_err(db_err)?;

            tracing::debug!(username, "User created");
            Ok(())
        })
    }

    fn create_record(&self, payer: &str, recipient: &str, credits: u32) -> Result<(), LedgerError> {
        self.with_conn(|conn| {
            let now = to_unix(OffsetDateTime::now_utc());

            // Optimistic insert; the foreign keys reject unknown accounts.
            let tx = conn.transaction().map_err(db_err)?;
            let inserted = tx.execute(
                "INSERT INTO Reciepts (Payer, Recipient, Credits, Date) VALUES (?1, ?2, ?3, ?4)",
                params![payer, recipient, i64::from(credits), now],
            );
            let err = match inserted {
                Ok(_) => {
                    tx.commit().map_err(db_err)?;
                    tracing::debug!(payer, recipient, credits, "Record created");
                    return Ok(());
                }
                Err(e) => e,
            };
            tx.rollback().map_err(db_err)?;

            if !Self::user_exists(conn, payer)? {
                return Err(LedgerError::PayerDoesNotExist(payer.to_string()));
            }
            if !Self::user_exists(conn, recipient)? {
                return Err(LedgerError::RecipientDoesNotExist(recipient.to_string()));
            }
            Err(db_err(err))
        })
    }

    fn get_timebound_records(&self, limit: u64, start: OffsetDateTime, end: OffsetDateTime) -> Result<Vec<Record>, LedgerError> {
        self.with_conn(|conn| {
            Self::query_records(
                conn,
                "SELECT Payer, Recipient, Credits, Date
                 FROM Reciepts
                 WHERE Date BETWEEN ?1 AND ?2
                 ORDER BY Date DESC, ID DESC
                 LIMIT ?3",
                params![to_unix(start), to_unix(end), sql_limit(limit)],
            )
        })
    }

    fn get_timebound_records_for_user(&self, user: &str, limit: u64, start: OffsetDateTime, end: OffsetDateTime) -> Result<Vec<Record>, LedgerError> {
        self.with_conn(|conn| {
            Self::require_user(conn, user)?;
            Self::query_records(
                conn,
                "SELECT Payer, Recipient, Credits, Date
                 FROM Reciepts
                 WHERE (Payer = ?1 OR Recipient = ?1)
                   AND Date BETWEEN ?2 AND ?3
                 ORDER BY Date DESC, ID DESC
                 LIMIT ?4",
                params![user, to_unix(start), to_unix(end), sql_limit(limit)],
            )
        })
    }

    fn get_timebound_records_between_users(&self, user1: &str, user2: &str, limit: u64, start: OffsetDateTime, end: OffsetDateTime) -> Result<Vec<Record>, LedgerError> {
        self.with_conn(|conn| {
            Self::require_user(conn, user1)?;
            Self::require_user(conn, user2)?;
            Self::query_records(
                conn,
                "SELECT Payer, Recipient, Credits, Date
                 FROM Reciepts
                 WHERE ((Payer = ?1 AND Recipient = ?2) OR (Payer = ?2 AND Recipient = ?1))
                   AND Date BETWEEN ?3 AND ?4
                 ORDER BY Date DESC, ID DESC
                 LIMIT ?5",
                params![user1, user2, to_unix(start), to_unix(end), sql_limit(limit)],
            )
        })
    }

    fn get_timebound_summary_for_user(&self, user: &str, start: OffsetDateTime, end: OffsetDateTime) -> Result<Summary, LedgerError> {
        self.with_conn(|conn| {
            Self::require_user(conn, user)?;
            let names = Self::usernames(conn)?;
            let mut summary = empty_summary(names.iter().map(String::as_str));

            let (start, end) = (to_unix(start), to_unix(end));
            Self::fold_direction(conn, &mut summary, user, "Payer", "Recipient", start, end)?;
            Self::fold_direction(conn, &mut summary, user, "Recipient", "Payer", start, end)?;
            Ok(summary)
        })
    }
}
