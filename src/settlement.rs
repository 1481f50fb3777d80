//! Settlement Engine
//! Mission: Resolve accumulators against option outcomes, credit exactly once

use rust_decimal::Decimal;
use tracing::{debug, info};

use crate::error::{Result, WagerError};
use crate::models::{AccumSettlement, BetStatus, OptionOutcome, OptionStatus, Principal};
use crate::store::{immediate_tx, AccumStore, CatalogStore, Db, LedgerStore};

/// One credited payout inside a settlement run.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Payout {
    pub accum_id: i64,
    pub user_id: i64,
    pub amount: Decimal,
}

/// Outcome of settling a single accumulator.
#[derive(Debug, Clone)]
enum AccumResolution {
    /// At least one leg is still open; revisited on a later resolution.
    Pending,
    Paid(Payout),
    Lost,
    Refunded,
    /// Another settlement run already reached a terminal state.
    AlreadySettled,
}

/// Summary of one settlement run over a bet.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SettlementReport {
    pub bet_id: i64,
    pub examined: usize,
    pub paid: Vec<Payout>,
    pub lost: usize,
    pub refunded: usize,
    pub pending: usize,
}

impl SettlementReport {
    pub fn total_paid(&self) -> Decimal {
        self.paid.iter().map(|p| p.amount).sum()
    }
}

/// Resolves option outcomes and settles the affected accumulators.
pub struct SettlementEngine {
    db: Db,
}

impl SettlementEngine {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Record a terminal outcome for an option, then settle every
    /// accumulator touched by the owning bet. Settlement runs incrementally:
    /// accumulators with open legs are skipped here and picked up when their
    /// remaining options resolve.
    pub fn resolve_option(
        &self,
        principal: &Principal,
        option_id: i64,
        outcome: OptionOutcome,
    ) -> Result<SettlementReport> {
        principal.require_admin()?;

        let mut conn = self.db.open()?;
        let tx = immediate_tx(&mut conn)?;
        let bet_id = CatalogStore::set_option_outcome_tx(&tx, option_id, outcome)?;
        let fully_resolved = CatalogStore::mark_bet_settled_if_resolved_tx(&tx, bet_id)?;
        tx.commit()?;
        drop(conn);

        info!(
            option_id,
            bet_id,
            outcome = outcome.as_status().as_str(),
            fully_resolved,
            "Option outcome recorded"
        );
        self.settle_bet(bet_id)
    }

    /// Void a bet (event cancelled): every still-open option becomes void
    /// and the bet settles. Accumulators with a void leg and no lost leg
    /// are refunded their stake; a lost leg still loses.
    pub fn void_bet(&self, principal: &Principal, bet_id: i64) -> Result<SettlementReport> {
        principal.require_admin()?;

        let mut conn = self.db.open()?;
        let tx = immediate_tx(&mut conn)?;
        let bet = CatalogStore::get_bet_tx(&tx, bet_id)?;
        if bet.status == BetStatus::Settled {
            return Err(WagerError::InvalidState(format!(
                "bet {bet_id} is already settled, cannot void"
            )));
        }
        let voided = CatalogStore::void_open_options_tx(&tx, bet_id)?;
        CatalogStore::mark_bet_settled_if_resolved_tx(&tx, bet_id)?;
        tx.commit()?;
        drop(conn);

        info!(bet_id, voided, "Bet voided");
        self.settle_bet(bet_id)
    }

    /// Settle every unsettled accumulator referencing an option of the bet.
    /// Safe to re-run at any time: terminal accumulators no-op, so a crash
    /// between accumulators never double-credits.
    pub fn settle_bet(&self, bet_id: i64) -> Result<SettlementReport> {
        let candidates = {
            let conn = self.db.open()?;
            AccumStore::unsettled_for_bet_tx(&conn, bet_id)?
        };

        let mut report = SettlementReport {
            bet_id,
            examined: candidates.len(),
            paid: Vec::new(),
            lost: 0,
            refunded: 0,
            pending: 0,
        };

        for accum_id in candidates {
            match self.settle_accum(accum_id)? {
                AccumResolution::Pending => report.pending += 1,
                AccumResolution::Paid(payout) => report.paid.push(payout),
                AccumResolution::Lost => report.lost += 1,
                AccumResolution::Refunded => report.refunded += 1,
                AccumResolution::AlreadySettled => {}
            }
        }

        info!(
            bet_id,
            examined = report.examined,
            paid = report.paid.len(),
            total_paid = %report.total_paid(),
            lost = report.lost,
            refunded = report.refunded,
            pending = report.pending,
            "Settlement run complete"
        );
        Ok(report)
    }

    /// Settle one accumulator inside its own IMMEDIATE transaction; the
    /// credit and the paid_out flip commit together.
    fn settle_accum(&self, accum_id: i64) -> Result<AccumResolution> {
        let mut conn = self.db.open()?;
        let tx = immediate_tx(&mut conn)?;

        let accum = AccumStore::get_tx(&tx, accum_id)?;
        if accum.settled.is_some() {
            return Ok(AccumResolution::AlreadySettled);
        }

        let legs = AccumStore::legs_with_status_tx(&tx, accum_id)?;

        // A lost leg is terminal even while other legs are open: the
        // accumulator can never pay, so it leaves the candidate set now.
        if legs.iter().any(|(_, status)| *status == OptionStatus::Lost) {
            if !AccumStore::try_mark_settled_tx(&tx, accum_id, AccumSettlement::Lost)? {
                return Ok(AccumResolution::AlreadySettled);
            }
            tx.commit()?;
            debug!(accum_id, "Accumulator lost");
            return Ok(AccumResolution::Lost);
        }

        if legs.iter().any(|(_, status)| *status == OptionStatus::Open) {
            debug!(accum_id, "Accumulator has open legs, not yet resolvable");
            return Ok(AccumResolution::Pending);
        }

        if legs.iter().any(|(_, status)| *status == OptionStatus::Void) {
            if !AccumStore::try_mark_settled_tx(&tx, accum_id, AccumSettlement::Refunded)? {
                return Ok(AccumResolution::AlreadySettled);
            }
            LedgerStore::apply_delta_tx(&tx, accum.user_id, accum.stake)?;
            tx.commit()?;
            info!(
                accum_id,
                user_id = accum.user_id,
                stake = %accum.stake,
                "Accumulator refunded (void leg)"
            );
            return Ok(AccumResolution::Refunded);
        }

        // Every leg resolved and won. Payout comes from the placement
        // snapshot, never from live odds.
        if !AccumStore::try_mark_paid_tx(&tx, accum_id)? {
            return Ok(AccumResolution::AlreadySettled);
        }
        let payout = accum.stake * accum.total_odds;
        LedgerStore::apply_delta_tx(&tx, accum.user_id, payout)?;
        tx.commit()?;

        info!(
            accum_id,
            user_id = accum.user_id,
            payout = %payout,
            "Accumulator won, payout credited"
        );
        Ok(AccumResolution::Paid(Payout {
            accum_id,
            user_id: accum.user_id,
            amount: payout,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::catalog::NewOption;
    use crate::wager::WagerService;
    use chrono::{Duration, Utc};
    use rust_decimal_macros::dec;
    use tempfile::NamedTempFile;

    struct Fixture {
        ledger: LedgerStore,
        catalog: CatalogStore,
        accums: AccumStore,
        wager: WagerService,
        engine: SettlementEngine,
        admin: Principal,
        user: Principal,
        bet_id: i64,
        option_ids: Vec<i64>,
        _temp: NamedTempFile,
    }

    /// Balance 1000, one accepted bet with two options at odds 2.0 / 3.0.
    fn create_fixture() -> Fixture {
        let temp = NamedTempFile::new().unwrap();
        let db = Db::new(temp.path().to_str().unwrap()).unwrap();
        let ledger = LedgerStore::new(db.clone());
        let catalog = CatalogStore::new(db.clone());

        let user = ledger.create_user("alice", dec!(1000)).unwrap();
        let close = (Utc::now() + Duration::hours(4)).to_rfc3339();
        let options = vec![
            NewOption {
                label: "Home".to_string(),
                odds: dec!(2.0),
            },
            NewOption {
                label: "Away".to_string(),
                odds: dec!(3.0),
            },
        ];
        let admin = Principal::admin(1);
        let (bet_id, option_ids) = catalog
            .create_bet(&admin, "sports", "Derby", "admin", &close, &options)
            .unwrap();

        Fixture {
            ledger,
            catalog,
            accums: AccumStore::new(db.clone()),
            wager: WagerService::new(db.clone()),
            engine: SettlementEngine::new(db),
            admin,
            user: Principal::user(user.user_id),
            bet_id,
            option_ids,
            _temp: temp,
        }
    }

    fn place_two_leg(fixture: &Fixture, stake: Decimal) -> i64 {
        fixture
            .wager
            .place_accumulator(&fixture.user, stake, &fixture.option_ids)
            .unwrap()
            .accum_id
    }

    #[test]
    fn test_winning_accumulator_paid_once() {
        let fixture = create_fixture();
        let accum_id = place_two_leg(&fixture, dec!(100));
        assert_eq!(
            fixture.ledger.get_balance(fixture.user.user_id).unwrap(),
            dec!(900)
        );

        let report = fixture
            .engine
            .resolve_option(&fixture.admin, fixture.option_ids[0], OptionOutcome::Won)
            .unwrap();
        assert_eq!(report.pending, 1);
        assert!(report.paid.is_empty());
        // Partially resolved: no balance change yet.
        assert_eq!(
            fixture.ledger.get_balance(fixture.user.user_id).unwrap(),
            dec!(900)
        );

        let report = fixture
            .engine
            .resolve_option(&fixture.admin, fixture.option_ids[1], OptionOutcome::Won)
            .unwrap();
        assert_eq!(report.paid.len(), 1);
        assert_eq!(report.paid[0].amount, dec!(600));
        assert_eq!(
            fixture.ledger.get_balance(fixture.user.user_id).unwrap(),
            dec!(1500)
        );

        let accum = fixture.accums.get(accum_id).unwrap();
        assert!(accum.paid_out);
        assert_eq!(accum.settled, Some(AccumSettlement::Won));

        // The bet itself advanced to settled.
        assert_eq!(
            fixture.catalog.get_bet(fixture.bet_id).unwrap().status,
            BetStatus::Settled
        );
    }

    #[test]
    fn test_settlement_idempotent() {
        let fixture = create_fixture();
        let accum_id = place_two_leg(&fixture, dec!(100));

        fixture
            .engine
            .resolve_option(&fixture.admin, fixture.option_ids[0], OptionOutcome::Won)
            .unwrap();
        fixture
            .engine
            .resolve_option(&fixture.admin, fixture.option_ids[1], OptionOutcome::Won)
            .unwrap();
        assert_eq!(
            fixture.ledger.get_balance(fixture.user.user_id).unwrap(),
            dec!(1500)
        );

        // Re-running settlement after the payout must be a no-op.
        for _ in 0..3 {
            let report = fixture.engine.settle_bet(fixture.bet_id).unwrap();
            assert!(report.paid.is_empty());
            assert_eq!(report.examined, 0);
        }
        assert_eq!(
            fixture.ledger.get_balance(fixture.user.user_id).unwrap(),
            dec!(1500)
        );
        assert!(fixture.accums.get(accum_id).unwrap().paid_out);
    }

    #[test]
    fn test_losing_leg_never_credits() {
        let fixture = create_fixture();
        let accum_id = place_two_leg(&fixture, dec!(100));

        fixture
            .engine
            .resolve_option(&fixture.admin, fixture.option_ids[0], OptionOutcome::Lost)
            .unwrap();
        // Lost leg settles the accumulator immediately, before the second
        // option resolves.
        let accum = fixture.accums.get(accum_id).unwrap();
        assert_eq!(accum.settled, Some(AccumSettlement::Lost));
        assert!(!accum.paid_out);

        let report = fixture
            .engine
            .resolve_option(&fixture.admin, fixture.option_ids[1], OptionOutcome::Won)
            .unwrap();
        assert!(report.paid.is_empty());
        assert_eq!(report.examined, 0);
        assert_eq!(
            fixture.ledger.get_balance(fixture.user.user_id).unwrap(),
            dec!(900)
        );
    }

    #[test]
    fn test_payout_uses_snapshot_not_live_odds() {
        let fixture = create_fixture();
        place_two_leg(&fixture, dec!(100));

        // Odds drift after placement; payout must come from the snapshot.
        fixture
            .catalog
            .update_option_odds(&fixture.admin, fixture.option_ids[0], dec!(50.0))
            .unwrap();

        fixture
            .engine
            .resolve_option(&fixture.admin, fixture.option_ids[0], OptionOutcome::Won)
            .unwrap();
        let report = fixture
            .engine
            .resolve_option(&fixture.admin, fixture.option_ids[1], OptionOutcome::Won)
            .unwrap();
        assert_eq!(report.paid[0].amount, dec!(600));
        assert_eq!(
            fixture.ledger.get_balance(fixture.user.user_id).unwrap(),
            dec!(1500)
        );
    }

    #[test]
    fn test_void_bet_refunds_stake() {
        let fixture = create_fixture();
        let accum_id = place_two_leg(&fixture, dec!(100));

        let report = fixture.engine.void_bet(&fixture.admin, fixture.bet_id).unwrap();
        assert_eq!(report.refunded, 1);
        assert!(report.paid.is_empty());
        // Stake back, nothing more.
        assert_eq!(
            fixture.ledger.get_balance(fixture.user.user_id).unwrap(),
            dec!(1000)
        );

        let accum = fixture.accums.get(accum_id).unwrap();
        assert_eq!(accum.settled, Some(AccumSettlement::Refunded));
        assert!(!accum.paid_out);

        // Voiding twice is an illegal transition, and re-settling no-ops.
        assert!(matches!(
            fixture.engine.void_bet(&fixture.admin, fixture.bet_id),
            Err(WagerError::InvalidState(_))
        ));
        fixture.engine.settle_bet(fixture.bet_id).unwrap();
        assert_eq!(
            fixture.ledger.get_balance(fixture.user.user_id).unwrap(),
            dec!(1000)
        );
    }

    #[test]
    fn test_lost_leg_beats_void_leg() {
        let fixture = create_fixture();
        let accum_id = place_two_leg(&fixture, dec!(100));

        fixture
            .engine
            .resolve_option(&fixture.admin, fixture.option_ids[0], OptionOutcome::Lost)
            .unwrap();
        // Bet voided afterwards: the lost accumulator stays lost.
        let accum = fixture.accums.get(accum_id).unwrap();
        assert_eq!(accum.settled, Some(AccumSettlement::Lost));

        fixture.engine.void_bet(&fixture.admin, fixture.bet_id).unwrap();
        assert_eq!(
            fixture.ledger.get_balance(fixture.user.user_id).unwrap(),
            dec!(900)
        );
    }

    #[test]
    fn test_accumulator_spanning_two_bets() {
        let fixture = create_fixture();
        let close = (Utc::now() + Duration::hours(4)).to_rfc3339();
        let (second_bet, second_options) = fixture
            .catalog
            .create_bet(
                &fixture.admin,
                "sports",
                "Cup",
                "admin",
                &close,
                &[NewOption {
                    label: "Yes".to_string(),
                    odds: dec!(1.5),
                }],
            )
            .unwrap();

        let legs = vec![fixture.option_ids[0], second_options[0]];
        let receipt = fixture
            .wager
            .place_accumulator(&fixture.user, dec!(100), &legs)
            .unwrap();
        assert_eq!(receipt.total_odds, dec!(3.0));

        // First bet resolves; the cross-bet accumulator still has an open leg.
        let report = fixture
            .engine
            .resolve_option(&fixture.admin, fixture.option_ids[0], OptionOutcome::Won)
            .unwrap();
        assert_eq!(report.pending, 1);
        assert_eq!(
            fixture.ledger.get_balance(fixture.user.user_id).unwrap(),
            dec!(900)
        );

        // Second bet resolves; now it pays.
        let report = fixture
            .engine
            .resolve_option(&fixture.admin, second_options[0], OptionOutcome::Won)
            .unwrap();
        assert_eq!(report.paid.len(), 1);
        assert_eq!(report.paid[0].amount, dec!(300));
        assert_eq!(
            fixture.ledger.get_balance(fixture.user.user_id).unwrap(),
            dec!(1200)
        );
        assert_eq!(second_bet, report.bet_id);
    }

    #[test]
    fn test_resolution_requires_admin() {
        let fixture = create_fixture();
        assert!(matches!(
            fixture
                .engine
                .resolve_option(&fixture.user, fixture.option_ids[0], OptionOutcome::Won),
            Err(WagerError::AdminRequired)
        ));
        assert!(matches!(
            fixture.engine.void_bet(&fixture.user, fixture.bet_id),
            Err(WagerError::AdminRequired)
        ));
    }

    #[test]
    fn test_resolving_resolved_option_rejected() {
        let fixture = create_fixture();
        fixture
            .engine
            .resolve_option(&fixture.admin, fixture.option_ids[0], OptionOutcome::Won)
            .unwrap();
        assert!(matches!(
            fixture
                .engine
                .resolve_option(&fixture.admin, fixture.option_ids[0], OptionOutcome::Lost),
            Err(WagerError::InvalidState(_))
        ));
    }

    #[test]
    fn test_multiple_accumulators_settled_independently() {
        let fixture = create_fixture();
        // One accumulator per leg, plus one across both.
        let single_home = fixture
            .wager
            .place_accumulator(&fixture.user, dec!(10), &[fixture.option_ids[0]])
            .unwrap()
            .accum_id;
        let single_away = fixture
            .wager
            .place_accumulator(&fixture.user, dec!(10), &[fixture.option_ids[1]])
            .unwrap()
            .accum_id;
        let double = place_two_leg(&fixture, dec!(10));

        fixture
            .engine
            .resolve_option(&fixture.admin, fixture.option_ids[0], OptionOutcome::Won)
            .unwrap();
        let report = fixture
            .engine
            .resolve_option(&fixture.admin, fixture.option_ids[1], OptionOutcome::Lost)
            .unwrap();

        assert_eq!(
            fixture.accums.get(single_home).unwrap().settled,
            Some(AccumSettlement::Won)
        );
        assert_eq!(
            fixture.accums.get(single_away).unwrap().settled,
            Some(AccumSettlement::Lost)
        );
        assert_eq!(
            fixture.accums.get(double).unwrap().settled,
            Some(AccumSettlement::Lost)
        );
        // 1000 - 30 staked + 20 payout on the home single.
        assert_eq!(
            fixture.ledger.get_balance(fixture.user.user_id).unwrap(),
            dec!(990)
        );
        assert_eq!(report.lost, 2);
    }
}
