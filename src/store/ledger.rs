//! Ledger Store
//! Mission: User balances mutated only through atomic guarded deltas

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use rust_decimal::Decimal;
use tracing::info;

use crate::error::{Result, WagerError};
use crate::models::User;
use crate::store::{decimal_column, immediate_tx, timestamp_column, Db};

/// Durable user-id → balance mapping.
pub struct LedgerStore {
    db: Db,
}

impl LedgerStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Create a user account with a starting balance.
    pub fn create_user(&self, username: &str, starting_balance: Decimal) -> Result<User> {
        if username.trim().is_empty() {
            return Err(WagerError::Validation("username must not be empty".into()));
        }
        if starting_balance < Decimal::ZERO {
            return Err(WagerError::Validation(
                "starting balance must be non-negative".into(),
            ));
        }

        let conn = self.db.open()?;
        let created_at = Utc::now();
        conn.execute(
            "INSERT INTO users (username, balance, created_at) VALUES (?1, ?2, ?3)",
            params![
                username,
                starting_balance.to_string(),
                created_at.to_rfc3339()
            ],
        )?;
        let user_id = conn.last_insert_rowid();

        info!(user_id, username, balance = %starting_balance, "User created");
        Ok(User {
            user_id,
            username: username.to_string(),
            balance: starting_balance,
            created_at,
        })
    }

    pub fn get_user(&self, user_id: i64) -> Result<User> {
        let conn = self.db.open()?;
        Self::get_user_tx(&conn, user_id)
    }

    pub fn get_user_by_username(&self, username: &str) -> Result<Option<User>> {
        let conn = self.db.open()?;
        let user = conn
            .query_row(
                "SELECT user_id, username, balance, created_at FROM users WHERE username = ?1",
                params![username],
                Self::user_from_row,
            )
            .optional()?;
        Ok(user)
    }

    pub fn get_balance(&self, user_id: i64) -> Result<Decimal> {
        let conn = self.db.open()?;
        Self::balance_tx(&conn, user_id)
    }

    /// Apply a guarded delta to a balance as one unit of work. Fails with
    /// `InsufficientFunds` when `balance + delta < 0`; nothing is written.
    pub fn apply_delta(&self, user_id: i64, delta: Decimal) -> Result<Decimal> {
        let mut conn = self.db.open()?;
        let tx = immediate_tx(&mut conn)?;
        let balance = Self::apply_delta_tx(&tx, user_id, delta)?;
        tx.commit()?;
        Ok(balance)
    }

    /// Transaction-scoped variant for callers that combine the delta with
    /// other writes (placement debit, settlement credit). The caller must
    /// hold an IMMEDIATE transaction on `conn`.
    pub fn apply_delta_tx(conn: &Connection, user_id: i64, delta: Decimal) -> Result<Decimal> {
        let balance = Self::balance_tx(conn, user_id)?;
        let updated = balance + delta;
        if updated < Decimal::ZERO {
            return Err(WagerError::InsufficientFunds {
                balance,
                required: -delta,
            });
        }
        conn.execute(
            "UPDATE users SET balance = ?1 WHERE user_id = ?2",
            params![updated.to_string(), user_id],
        )?;
        Ok(updated)
    }

    pub(crate) fn balance_tx(conn: &Connection, user_id: i64) -> Result<Decimal> {
        let raw: Option<String> = conn
            .query_row(
                "SELECT balance FROM users WHERE user_id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .optional()?;
        match raw {
            Some(raw) => Ok(decimal_column(0, raw)?),
            None => Err(WagerError::NotFound(format!("user {user_id}"))),
        }
    }

    pub(crate) fn get_user_tx(conn: &Connection, user_id: i64) -> Result<User> {
        conn.query_row(
            "SELECT user_id, username, balance, created_at FROM users WHERE user_id = ?1",
            params![user_id],
            Self::user_from_row,
        )
        .optional()?
        .ok_or_else(|| WagerError::NotFound(format!("user {user_id}")))
    }

    fn user_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
        Ok(User {
            user_id: row.get(0)?,
            username: row.get(1)?,
            balance: decimal_column(2, row.get::<_, String>(2)?)?,
            created_at: timestamp_column(3, row.get::<_, String>(3)?)?,
        })
    }
}
