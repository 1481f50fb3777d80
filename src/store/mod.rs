//! Durable Store
//! Mission: One SQLite file, per-operation connections, parameterized SQL

pub mod accums;
pub mod catalog;
pub mod ledger;

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, Transaction, TransactionBehavior};
use rust_decimal::Decimal;
use tracing::debug;

use crate::error::Result;
use crate::models::UnknownStatus;

pub use accums::AccumStore;
pub use catalog::CatalogStore;
pub use ledger::LedgerStore;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS users (
    user_id INTEGER PRIMARY KEY AUTOINCREMENT,
    username TEXT UNIQUE NOT NULL,
    balance TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS bets (
    bet_id INTEGER PRIMARY KEY AUTOINCREMENT,
    category TEXT NOT NULL,
    title TEXT NOT NULL,
    status TEXT NOT NULL,
    submitter TEXT NOT NULL,
    close_timestamp TEXT NOT NULL,
    closed_early TEXT
);

CREATE TABLE IF NOT EXISTS bet_options (
    option_id INTEGER PRIMARY KEY AUTOINCREMENT,
    bet_id INTEGER NOT NULL,
    label TEXT NOT NULL,
    latest_odds TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'open',
    FOREIGN KEY (bet_id) REFERENCES bets(bet_id)
);

CREATE TABLE IF NOT EXISTS accums (
    accum_id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL,
    stake TEXT NOT NULL,
    total_odds TEXT NOT NULL,
    placed_timestamp TEXT NOT NULL,
    paid_out INTEGER NOT NULL DEFAULT 0,
    settled TEXT,
    FOREIGN KEY (user_id) REFERENCES users(user_id)
);

CREATE TABLE IF NOT EXISTS accum_options (
    accum_id INTEGER NOT NULL,
    option_id INTEGER NOT NULL,
    user_odds TEXT NOT NULL,
    PRIMARY KEY (accum_id, option_id),
    FOREIGN KEY (accum_id) REFERENCES accums(accum_id),
    FOREIGN KEY (option_id) REFERENCES bet_options(option_id)
);

CREATE INDEX IF NOT EXISTS idx_bet_options_bet ON bet_options(bet_id);
CREATE INDEX IF NOT EXISTS idx_accums_user ON accums(user_id);
CREATE INDEX IF NOT EXISTS idx_accum_options_option ON accum_options(option_id);
";

/// Handle to the wagering database. Cheap to clone; every operation opens
/// its own connection, so there is no shared mutable connection object.
#[derive(Debug, Clone)]
pub struct Db {
    path: String,
}

impl Db {
    /// Open (or create) the database at `path` and ensure the schema exists.
    pub fn new(path: &str) -> Result<Self> {
        let db = Self {
            path: path.to_string(),
        };
        let conn = db.open()?;
        conn.execute_batch(SCHEMA)?;
        debug!(path, "Database schema ready");
        Ok(db)
    }

    /// Fresh connection with the pragmas every unit of work needs: WAL for
    /// concurrent readers, a busy timeout so writers queue instead of
    /// failing instantly, and foreign keys on.
    pub fn open(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;",
        )?;
        Ok(conn)
    }
}

/// Begin an IMMEDIATE transaction: takes the write lock up front so every
/// multi-statement mutation serializes against other writers.
pub fn immediate_tx(conn: &mut Connection) -> Result<Transaction<'_>> {
    Ok(conn.transaction_with_behavior(TransactionBehavior::Immediate)?)
}

/// Map a TEXT column to `Decimal` inside a row closure.
pub(crate) fn decimal_column(idx: usize, raw: String) -> rusqlite::Result<Decimal> {
    Decimal::from_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

/// Map a TEXT column holding an RFC 3339 timestamp inside a row closure.
pub(crate) fn timestamp_column(idx: usize, raw: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

/// Map an unknown status string to a conversion failure inside a row closure.
pub(crate) fn unknown_status(idx: usize, raw: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        Box::new(UnknownStatus(raw)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_schema_init_idempotent() {
        let temp = NamedTempFile::new().unwrap();
        let path = temp.path().to_str().unwrap();
        Db::new(path).unwrap();
        // Second init against the same file must not fail.
        Db::new(path).unwrap();
    }

    #[test]
    fn test_decimal_column_rejects_garbage() {
        assert!(decimal_column(0, "12.50".to_string()).is_ok());
        assert!(decimal_column(0, "not-a-number".to_string()).is_err());
    }

    #[test]
    fn test_timestamp_column_roundtrip() {
        let now = Utc::now();
        let parsed = timestamp_column(0, now.to_rfc3339()).unwrap();
        assert_eq!(parsed, now);
    }
}
