//! Application configuration loaded from the environment.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use std::env;
use std::str::FromStr;

/// Runtime configuration. Callers load `.env` (dotenv) before this.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the SQLite database file.
    pub database_path: String,
    /// Balance granted to newly created users.
    pub starting_balance: Decimal,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let database_path =
            env::var("PUNTERBOOK_DB").unwrap_or_else(|_| "punterbook.db".to_string());

        let starting_balance = match env::var("PUNTERBOOK_STARTING_BALANCE") {
            Ok(raw) => Decimal::from_str(&raw)
                .with_context(|| format!("invalid PUNTERBOOK_STARTING_BALANCE: {raw:?}"))?,
            Err(_) => Decimal::from(5000),
        };

        Ok(Self {
            database_path,
            starting_balance,
        })
    }
}
