//! Error Taxonomy
//! Mission: Distinguishable failure categories, no partial mutations

use rust_decimal::Decimal;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, WagerError>;

/// Every failure the core can report. All mutations are all-or-nothing, so
/// none of these leave the store partially updated. Retries, if any, belong
/// to the caller.
#[derive(Debug, Error)]
pub enum WagerError {
    /// Malformed input, rejected before any mutation.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Illegal state transition (accepting an accepted bet, resolving a
    /// resolved option).
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Wager placed against an option that is no longer open.
    #[error("option {0} is not open for wagering")]
    OptionClosed(i64),

    /// Wager placed against a bet past its close time or closed early.
    #[error("bet {0} is closed for wagering")]
    BetClosed(i64),

    /// Stake exceeds the current balance; nothing was debited.
    #[error("insufficient funds: balance {balance} cannot cover {required}")]
    InsufficientFunds {
        balance: Decimal,
        required: Decimal,
    },

    /// Mutating catalog/settlement call without the admin capability.
    #[error("admin capability required")]
    AdminRequired,

    #[error("{0} not found")]
    NotFound(String),

    /// Lock contention in the store. Safe to retry the whole operation;
    /// nothing was applied.
    #[error("storage conflict, operation can be retried")]
    ConcurrencyConflict,

    #[error("storage error: {0}")]
    Storage(rusqlite::Error),
}

impl From<rusqlite::Error> for WagerError {
    fn from(e: rusqlite::Error) -> Self {
        match e {
            rusqlite::Error::SqliteFailure(failure, _)
                if matches!(
                    failure.code,
                    rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
                ) =>
            {
                WagerError::ConcurrencyConflict
            }
            other => WagerError::Storage(other),
        }
    }
}
