//! Domain Models
//! Mission: Explicit state machines for bets, options and accumulators

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{Result, WagerError};

/// Raised when a stored status string is not a known variant.
#[derive(Debug, Error)]
#[error("unknown status value: {0:?}")]
pub struct UnknownStatus(pub String);

/// Authenticated caller identity, supplied by the external auth collaborator.
/// The core trusts it as-is.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Principal {
    pub user_id: i64,
    pub is_admin: bool,
}

impl Principal {
    pub fn user(user_id: i64) -> Self {
        Self {
            user_id,
            is_admin: false,
        }
    }

    pub fn admin(user_id: i64) -> Self {
        Self {
            user_id,
            is_admin: true,
        }
    }

    /// Single capability check for every mutating catalog/settlement call.
    pub fn require_admin(&self) -> Result<()> {
        if self.is_admin {
            Ok(())
        } else {
            Err(WagerError::AdminRequired)
        }
    }
}

/// Bet lifecycle. Transitions only move forward.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BetStatus {
    Requested,
    Accepted,
    Open,
    ClosedEarly,
    Settled,
}

impl BetStatus {
    pub fn as_str(&self) -> &str {
        match self {
            BetStatus::Requested => "requested",
            BetStatus::Accepted => "accepted",
            BetStatus::Open => "open",
            BetStatus::ClosedEarly => "closed_early",
            BetStatus::Settled => "settled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "requested" => Some(BetStatus::Requested),
            "accepted" => Some(BetStatus::Accepted),
            "open" => Some(BetStatus::Open),
            "closed_early" => Some(BetStatus::ClosedEarly),
            "settled" => Some(BetStatus::Settled),
            _ => None,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            BetStatus::Requested => 0,
            BetStatus::Accepted => 1,
            BetStatus::Open => 2,
            BetStatus::ClosedEarly => 3,
            BetStatus::Settled => 4,
        }
    }

    /// Status advances monotonically, no regressions.
    pub fn can_advance_to(&self, next: BetStatus) -> bool {
        next.rank() > self.rank()
    }

    /// Wagering is only allowed on accepted/open bets (close time and
    /// early closure are checked on the Bet itself).
    pub fn is_wagerable(&self) -> bool {
        matches!(self, BetStatus::Accepted | BetStatus::Open)
    }
}

/// Option resolution status. Terminal values are write-once.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OptionStatus {
    Open,
    Won,
    Lost,
    Void,
}

impl OptionStatus {
    pub fn as_str(&self) -> &str {
        match self {
            OptionStatus::Open => "open",
            OptionStatus::Won => "won",
            OptionStatus::Lost => "lost",
            OptionStatus::Void => "void",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "open" => Some(OptionStatus::Open),
            "won" => Some(OptionStatus::Won),
            "lost" => Some(OptionStatus::Lost),
            "void" => Some(OptionStatus::Void),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, OptionStatus::Open)
    }
}

/// Operator-settable outcome for a single option. Voiding happens at the
/// bet level, never per option.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OptionOutcome {
    Won,
    Lost,
}

impl OptionOutcome {
    pub fn as_status(&self) -> OptionStatus {
        match self {
            OptionOutcome::Won => OptionStatus::Won,
            OptionOutcome::Lost => OptionStatus::Lost,
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "won" => Some(OptionOutcome::Won),
            "lost" => Some(OptionOutcome::Lost),
            _ => None,
        }
    }
}

/// Terminal settlement of an accumulator. Once set it never changes and the
/// accumulator leaves the settlement candidate set.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AccumSettlement {
    Won,
    Lost,
    Refunded,
}

impl AccumSettlement {
    pub fn as_str(&self) -> &str {
        match self {
            AccumSettlement::Won => "won",
            AccumSettlement::Lost => "lost",
            AccumSettlement::Refunded => "refunded",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "won" => Some(AccumSettlement::Won),
            "lost" => Some(AccumSettlement::Lost),
            "refunded" => Some(AccumSettlement::Refunded),
            _ => None,
        }
    }
}

/// User account as the ledger sees it. Identity fields beyond the username
/// belong to the registration collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub user_id: i64,
    pub username: String,
    pub balance: Decimal,
    pub created_at: DateTime<Utc>,
}

/// A published event with mutually exclusive options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bet {
    pub bet_id: i64,
    pub category: String,
    pub title: String,
    pub status: BetStatus,
    pub submitter: String,
    pub close_timestamp: DateTime<Utc>,
    pub closed_early: Option<DateTime<Utc>>,
}

impl Bet {
    /// New wagers are forbidden once the bet is closed early, past its
    /// close timestamp, or outside the wagerable statuses.
    pub fn is_open_for_wagering(&self, now: DateTime<Utc>) -> bool {
        self.status.is_wagerable() && self.closed_early.is_none() && now < self.close_timestamp
    }
}

/// One possible outcome of a bet. `latest_odds` may drift while open;
/// placed legs keep their own snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BetOption {
    pub option_id: i64,
    pub bet_id: i64,
    pub label: String,
    pub latest_odds: Decimal,
    pub status: OptionStatus,
}

/// A multi-leg wager. `total_odds` is the product of the leg snapshots at
/// placement time; payout is always `stake * total_odds`, never recomputed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Accumulator {
    pub accum_id: i64,
    pub user_id: i64,
    pub stake: Decimal,
    pub total_odds: Decimal,
    pub placed_timestamp: DateTime<Utc>,
    pub paid_out: bool,
    pub settled: Option<AccumSettlement>,
}

/// One option selection inside an accumulator, with the odds frozen at
/// placement. Its resolution state is derived from the option, never stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccumLeg {
    pub accum_id: i64,
    pub option_id: i64,
    pub user_odds: Decimal,
}

/// Leg joined with its option for display.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LegView {
    pub option_id: i64,
    pub user_odds: Decimal,
    pub option_label: String,
    pub bet_title: String,
    pub option_status: OptionStatus,
}

/// Accumulator with its legs, the shape handed to presentation layers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccumView {
    #[serde(flatten)]
    pub accum: Accumulator,
    pub legs: Vec<LegView>,
}

/// Bet with its options, the shape handed to presentation layers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BetWithOptions {
    #[serde(flatten)]
    pub bet: Bet,
    pub options: Vec<BetOption>,
}
