//! Catalog Store
//! Mission: Bets and options with guarded transitions and write-once outcomes

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use rust_decimal::Decimal;
use tracing::info;

use crate::error::{Result, WagerError};
use crate::models::{
    Bet, BetOption, BetStatus, BetWithOptions, OptionOutcome, OptionStatus, Principal,
};
use crate::store::{decimal_column, immediate_tx, timestamp_column, unknown_status, Db};

/// Option payload for bet creation.
#[derive(Debug, Clone)]
pub struct NewOption {
    pub label: String,
    pub odds: Decimal,
}

/// Durable store of bets and their options.
pub struct CatalogStore {
    db: Db,
}

impl CatalogStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Create a bet with its options in one transaction. Admin principals
    /// publish directly (Accepted); everyone else submits a request.
    pub fn create_bet(
        &self,
        principal: &Principal,
        category: &str,
        title: &str,
        submitter: &str,
        close_time: &str,
        options: &[NewOption],
    ) -> Result<(i64, Vec<i64>)> {
        let close_timestamp = DateTime::parse_from_rfc3339(close_time)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| WagerError::Validation(format!("unparseable close time: {e}")))?;
        if options.is_empty() {
            return Err(WagerError::Validation(
                "a bet needs at least one option".into(),
            ));
        }
        for option in options {
            validate_odds(option.odds)?;
        }

        let status = if principal.is_admin {
            BetStatus::Accepted
        } else {
            BetStatus::Requested
        };

        let mut conn = self.db.open()?;
        let tx = immediate_tx(&mut conn)?;
        tx.execute(
            "INSERT INTO bets (category, title, status, submitter, close_timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                category,
                title,
                status.as_str(),
                submitter,
                close_timestamp.to_rfc3339()
            ],
        )?;
        let bet_id = tx.last_insert_rowid();

        let mut option_ids = Vec::with_capacity(options.len());
        for option in options {
            tx.execute(
                "INSERT INTO bet_options (bet_id, label, latest_odds, status)
                 VALUES (?1, ?2, ?3, 'open')",
                params![bet_id, option.label, option.odds.to_string()],
            )?;
            option_ids.push(tx.last_insert_rowid());
        }
        tx.commit()?;

        info!(
            bet_id,
            title,
            status = status.as_str(),
            options = option_ids.len(),
            "Bet created"
        );
        Ok((bet_id, option_ids))
    }

    /// Requested → Accepted, nothing else.
    pub fn accept_bet(&self, principal: &Principal, bet_id: i64) -> Result<()> {
        principal.require_admin()?;
        let mut conn = self.db.open()?;
        let tx = immediate_tx(&mut conn)?;
        let bet = Self::get_bet_tx(&tx, bet_id)?;
        if bet.status != BetStatus::Requested {
            return Err(WagerError::InvalidState(format!(
                "bet {bet_id} is {}, only requested bets can be accepted",
                bet.status.as_str()
            )));
        }
        tx.execute(
            "UPDATE bets SET status = 'accepted' WHERE bet_id = ?1",
            params![bet_id],
        )?;
        tx.commit()?;
        info!(bet_id, "Bet accepted");
        Ok(())
    }

    /// Record early closure. Forbids new wagers but resolves nothing.
    pub fn close_early(&self, principal: &Principal, bet_id: i64) -> Result<()> {
        principal.require_admin()?;
        let mut conn = self.db.open()?;
        let tx = immediate_tx(&mut conn)?;
        let bet = Self::get_bet_tx(&tx, bet_id)?;
        if !bet.status.can_advance_to(BetStatus::ClosedEarly) {
            return Err(WagerError::InvalidState(format!(
                "bet {bet_id} is {}, too late to close early",
                bet.status.as_str()
            )));
        }
        tx.execute(
            "UPDATE bets SET status = 'closed_early', closed_early = ?1 WHERE bet_id = ?2",
            params![Utc::now().to_rfc3339(), bet_id],
        )?;
        tx.commit()?;
        info!(bet_id, "Bet closed early");
        Ok(())
    }

    /// Update the live odds of an option. Only while the option is open;
    /// existing leg snapshots are untouched.
    pub fn update_option_odds(
        &self,
        principal: &Principal,
        option_id: i64,
        odds: Decimal,
    ) -> Result<()> {
        principal.require_admin()?;
        validate_odds(odds)?;
        let mut conn = self.db.open()?;
        let tx = immediate_tx(&mut conn)?;
        let changed = tx.execute(
            "UPDATE bet_options SET latest_odds = ?1 WHERE option_id = ?2 AND status = 'open'",
            params![odds.to_string(), option_id],
        )?;
        if changed == 0 {
            // Distinguish a missing option from a resolved one.
            Self::get_option_tx(&tx, option_id)?;
            return Err(WagerError::InvalidState(format!(
                "option {option_id} is resolved, odds are frozen"
            )));
        }
        tx.commit()?;
        info!(option_id, odds = %odds, "Option odds updated");
        Ok(())
    }

    /// Add an option to an existing bet, possible until it settles.
    pub fn add_option(
        &self,
        principal: &Principal,
        bet_id: i64,
        label: &str,
        odds: Decimal,
    ) -> Result<i64> {
        principal.require_admin()?;
        validate_odds(odds)?;
        let mut conn = self.db.open()?;
        let tx = immediate_tx(&mut conn)?;
        let bet = Self::get_bet_tx(&tx, bet_id)?;
        if bet.status == BetStatus::Settled {
            return Err(WagerError::InvalidState(format!(
                "bet {bet_id} is settled, options are frozen"
            )));
        }
        tx.execute(
            "INSERT INTO bet_options (bet_id, label, latest_odds, status)
             VALUES (?1, ?2, ?3, 'open')",
            params![bet_id, label, odds.to_string()],
        )?;
        let option_id = tx.last_insert_rowid();
        tx.commit()?;
        info!(bet_id, option_id, label, "Option added");
        Ok(option_id)
    }

    pub fn get_bet(&self, bet_id: i64) -> Result<Bet> {
        let conn = self.db.open()?;
        Self::get_bet_tx(&conn, bet_id)
    }

    pub fn get_option(&self, option_id: i64) -> Result<BetOption> {
        let conn = self.db.open()?;
        Self::get_option_tx(&conn, option_id)
    }

    pub fn list_options_for_bet(&self, bet_id: i64) -> Result<Vec<BetOption>> {
        let conn = self.db.open()?;
        Self::list_options_tx(&conn, bet_id)
    }

    /// Bets currently open for wagering, soonest close first.
    pub fn list_open_bets(&self) -> Result<Vec<BetWithOptions>> {
        let now = Utc::now();
        let conn = self.db.open()?;
        let mut stmt = conn.prepare(
            "SELECT bet_id, category, title, status, submitter, close_timestamp, closed_early
             FROM bets
             WHERE status IN ('accepted', 'open')
               AND closed_early IS NULL
               AND close_timestamp > ?1
             ORDER BY close_timestamp ASC",
        )?;
        let bets = stmt
            .query_map(params![now.to_rfc3339()], bet_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        bets.into_iter()
            .map(|bet| {
                let options = Self::list_options_tx(&conn, bet.bet_id)?;
                Ok(BetWithOptions { bet, options })
            })
            .collect()
    }

    /// Submitted bets awaiting admin acceptance.
    pub fn list_requested_bets(&self) -> Result<Vec<BetWithOptions>> {
        let conn = self.db.open()?;
        let mut stmt = conn.prepare(
            "SELECT bet_id, category, title, status, submitter, close_timestamp, closed_early
             FROM bets WHERE status = 'requested' ORDER BY bet_id ASC",
        )?;
        let bets = stmt
            .query_map([], bet_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        bets.into_iter()
            .map(|bet| {
                let options = Self::list_options_tx(&conn, bet.bet_id)?;
                Ok(BetWithOptions { bet, options })
            })
            .collect()
    }

    /// Write-once outcome transition, returning the owning bet id. The
    /// settlement engine wraps this and runs resolution afterwards.
    pub(crate) fn set_option_outcome_tx(
        conn: &Connection,
        option_id: i64,
        outcome: OptionOutcome,
    ) -> Result<i64> {
        let option = Self::get_option_tx(conn, option_id)?;
        if option.status.is_terminal() {
            return Err(WagerError::InvalidState(format!(
                "option {option_id} is already {}, outcomes are write-once",
                option.status.as_str()
            )));
        }
        conn.execute(
            "UPDATE bet_options SET status = ?1 WHERE option_id = ?2 AND status = 'open'",
            params![outcome.as_status().as_str(), option_id],
        )?;
        Ok(option.bet_id)
    }

    /// Mark every still-open option of a bet void. Terminal like won/lost.
    pub(crate) fn void_open_options_tx(conn: &Connection, bet_id: i64) -> Result<usize> {
        let voided = conn.execute(
            "UPDATE bet_options SET status = 'void' WHERE bet_id = ?1 AND status = 'open'",
            params![bet_id],
        )?;
        Ok(voided)
    }

    /// Advance the bet to Settled once no option remains open.
    pub(crate) fn mark_bet_settled_if_resolved_tx(conn: &Connection, bet_id: i64) -> Result<bool> {
        let open_options: i64 = conn.query_row(
            "SELECT COUNT(*) FROM bet_options WHERE bet_id = ?1 AND status = 'open'",
            params![bet_id],
            |row| row.get(0),
        )?;
        if open_options > 0 {
            return Ok(false);
        }
        conn.execute(
            "UPDATE bets SET status = 'settled' WHERE bet_id = ?1 AND status != 'settled'",
            params![bet_id],
        )?;
        Ok(true)
    }

    pub(crate) fn get_bet_tx(conn: &Connection, bet_id: i64) -> Result<Bet> {
        conn.query_row(
            "SELECT bet_id, category, title, status, submitter, close_timestamp, closed_early
             FROM bets WHERE bet_id = ?1",
            params![bet_id],
            bet_from_row,
        )
        .optional()?
        .ok_or_else(|| WagerError::NotFound(format!("bet {bet_id}")))
    }

    pub(crate) fn get_option_tx(conn: &Connection, option_id: i64) -> Result<BetOption> {
        conn.query_row(
            "SELECT option_id, bet_id, label, latest_odds, status
             FROM bet_options WHERE option_id = ?1",
            params![option_id],
            option_from_row,
        )
        .optional()?
        .ok_or_else(|| WagerError::NotFound(format!("option {option_id}")))
    }

    pub(crate) fn list_options_tx(conn: &Connection, bet_id: i64) -> Result<Vec<BetOption>> {
        let mut stmt = conn.prepare(
            "SELECT option_id, bet_id, label, latest_odds, status
             FROM bet_options WHERE bet_id = ?1 ORDER BY option_id ASC",
        )?;
        let options = stmt
            .query_map(params![bet_id], option_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(options)
    }
}

fn validate_odds(odds: Decimal) -> Result<()> {
    if odds <= Decimal::ONE {
        return Err(WagerError::Validation(format!(
            "odds must be greater than 1.0, got {odds}"
        )));
    }
    Ok(())
}

fn bet_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Bet> {
    let status_raw: String = row.get(3)?;
    let status = BetStatus::from_str(&status_raw).ok_or_else(|| unknown_status(3, status_raw))?;
    let closed_early = match row.get::<_, Option<String>>(6)? {
        Some(raw) => Some(timestamp_column(6, raw)?),
        None => None,
    };
    Ok(Bet {
        bet_id: row.get(0)?,
        category: row.get(1)?,
        title: row.get(2)?,
        status,
        submitter: row.get(4)?,
        close_timestamp: timestamp_column(5, row.get::<_, String>(5)?)?,
        closed_early,
    })
}

fn option_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<BetOption> {
    let status_raw: String = row.get(4)?;
    let status = OptionStatus::from_str(&status_raw).ok_or_else(|| unknown_status(4, status_raw))?;
    Ok(BetOption {
        option_id: row.get(0)?,
        bet_id: row.get(1)?,
        label: row.get(2)?,
        latest_odds: decimal_column(3, row.get::<_, String>(3)?)?,
        status,
    })
}
