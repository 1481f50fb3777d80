//! Wager Service
//! Mission: Validate and place accumulators, all-or-nothing

use std::collections::HashSet;

use chrono::Utc;
use rust_decimal::Decimal;
use tracing::info;

use crate::error::{Result, WagerError};
use crate::models::{AccumView, OptionStatus, Principal};
use crate::store::{immediate_tx, AccumStore, CatalogStore, Db, LedgerStore};

/// Confirmation returned to the caller after a successful placement.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PlacementReceipt {
    pub accum_id: i64,
    pub stake: Decimal,
    pub total_odds: Decimal,
    pub potential_payout: Decimal,
    pub balance_after: Decimal,
}

/// Places accumulators against the catalog and the ledger.
pub struct WagerService {
    db: Db,
    accums: AccumStore,
}

impl WagerService {
    pub fn new(db: Db) -> Self {
        Self {
            accums: AccumStore::new(db.clone()),
            db,
        }
    }

    /// Place an accumulator over the selected options.
    ///
    /// Odds are snapshotted from the live catalog inside the placement
    /// transaction, never taken from the caller. The accumulator insert, the
    /// leg inserts and the stake debit commit together or not at all.
    ///
    /// The affordability gate compares the balance against the stake, the
    /// amount actually debited. The potential payout plays no part in it.
    pub fn place_accumulator(
        &self,
        principal: &Principal,
        stake: Decimal,
        option_ids: &[i64],
    ) -> Result<PlacementReceipt> {
        if stake <= Decimal::ZERO {
            return Err(WagerError::Validation(format!(
                "stake must be positive, got {stake}"
            )));
        }
        if option_ids.is_empty() {
            return Err(WagerError::Validation(
                "an accumulator needs at least one leg".into(),
            ));
        }
        let mut seen = HashSet::new();
        if !option_ids.iter().all(|id| seen.insert(*id)) {
            return Err(WagerError::Validation(
                "an accumulator cannot select the same option twice".into(),
            ));
        }

        let now = Utc::now();
        let mut conn = self.db.open()?;
        let tx = immediate_tx(&mut conn)?;

        let mut total_odds = Decimal::ONE;
        let mut legs = Vec::with_capacity(option_ids.len());
        for &option_id in option_ids {
            let option = CatalogStore::get_option_tx(&tx, option_id)?;
            if option.status != OptionStatus::Open {
                return Err(WagerError::OptionClosed(option_id));
            }
            let bet = CatalogStore::get_bet_tx(&tx, option.bet_id)?;
            if !bet.is_open_for_wagering(now) {
                return Err(WagerError::BetClosed(bet.bet_id));
            }
            total_odds *= option.latest_odds;
            legs.push((option_id, option.latest_odds));
        }

        let balance = LedgerStore::balance_tx(&tx, principal.user_id)?;
        if balance < stake {
            return Err(WagerError::InsufficientFunds {
                balance,
                required: stake,
            });
        }

        let accum_id =
            AccumStore::insert_accum_tx(&tx, principal.user_id, stake, total_odds, &legs, now)?;
        let balance_after = LedgerStore::apply_delta_tx(&tx, principal.user_id, -stake)?;
        tx.commit()?;

        info!(
            accum_id,
            user_id = principal.user_id,
            stake = %stake,
            total_odds = %total_odds,
            legs = legs.len(),
            "Accumulator placed"
        );

        Ok(PlacementReceipt {
            accum_id,
            stake,
            total_odds,
            potential_payout: stake * total_odds,
            balance_after,
        })
    }

    /// A user's accumulators with legs, for display.
    pub fn list_accumulators_for_user(&self, user_id: i64) -> Result<Vec<AccumView>> {
        self.accums.list_for_user(user_id)
    }
}
