//! Accumulator Store
//! Mission: Accumulators and their legs, snapshot odds, one-way payout flags

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use rust_decimal::Decimal;

use crate::error::{Result, WagerError};
use crate::models::{AccumLeg, AccumSettlement, AccumView, Accumulator, LegView, OptionStatus};
use crate::store::{decimal_column, timestamp_column, unknown_status, Db};

/// Durable store of accumulators and legs.
pub struct AccumStore {
    db: Db,
}

impl AccumStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub fn get(&self, accum_id: i64) -> Result<Accumulator> {
        let conn = self.db.open()?;
        Self::get_tx(&conn, accum_id)
    }

    /// Accumulators of a user with their legs, newest first.
    pub fn list_for_user(&self, user_id: i64) -> Result<Vec<AccumView>> {
        let conn = self.db.open()?;
        let mut stmt = conn.prepare(
            "SELECT accum_id, user_id, stake, total_odds, placed_timestamp, paid_out, settled
             FROM accums WHERE user_id = ?1 ORDER BY placed_timestamp DESC",
        )?;
        let accums = stmt
            .query_map(params![user_id], accum_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        accums
            .into_iter()
            .map(|accum| {
                let legs = Self::leg_views_tx(&conn, accum.accum_id)?;
                Ok(AccumView { accum, legs })
            })
            .collect()
    }

    /// Accumulators holding a leg on the given option. Read surface for
    /// presentation layers; settlement scans per bet instead.
    pub fn list_referencing_option(&self, option_id: i64) -> Result<Vec<Accumulator>> {
        let conn = self.db.open()?;
        let mut stmt = conn.prepare(
            "SELECT a.accum_id, a.user_id, a.stake, a.total_odds, a.placed_timestamp,
                    a.paid_out, a.settled
             FROM accums a
             JOIN accum_options ao ON ao.accum_id = a.accum_id
             WHERE ao.option_id = ?1
             ORDER BY a.accum_id ASC",
        )?;
        let accums = stmt
            .query_map(params![option_id], accum_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(accums)
    }

    pub fn list_legs(&self, accum_id: i64) -> Result<Vec<AccumLeg>> {
        let conn = self.db.open()?;
        let mut stmt = conn.prepare(
            "SELECT accum_id, option_id, user_odds FROM accum_options
             WHERE accum_id = ?1 ORDER BY option_id ASC",
        )?;
        let legs = stmt
            .query_map(params![accum_id], |row| {
                Ok(AccumLeg {
                    accum_id: row.get(0)?,
                    option_id: row.get(1)?,
                    user_odds: decimal_column(2, row.get::<_, String>(2)?)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(legs)
    }

    /// Insert an accumulator and its legs inside the caller's transaction.
    /// The caller pairs this with the stake debit so the whole placement is
    /// all-or-nothing.
    pub(crate) fn insert_accum_tx(
        conn: &Connection,
        user_id: i64,
        stake: Decimal,
        total_odds: Decimal,
        legs: &[(i64, Decimal)],
        placed: DateTime<Utc>,
    ) -> Result<i64> {
        conn.execute(
            "INSERT INTO accums (user_id, stake, total_odds, placed_timestamp, paid_out)
             VALUES (?1, ?2, ?3, ?4, 0)",
            params![
                user_id,
                stake.to_string(),
                total_odds.to_string(),
                placed.to_rfc3339()
            ],
        )?;
        let accum_id = conn.last_insert_rowid();
        for (option_id, user_odds) in legs {
            conn.execute(
                "INSERT INTO accum_options (accum_id, option_id, user_odds)
                 VALUES (?1, ?2, ?3)",
                params![accum_id, option_id, user_odds.to_string()],
            )?;
        }
        Ok(accum_id)
    }

    /// Distinct unsettled accumulators holding a leg on any option of the
    /// bet. Terminally settled accumulators never reappear here.
    pub(crate) fn unsettled_for_bet_tx(conn: &Connection, bet_id: i64) -> Result<Vec<i64>> {
        let mut stmt = conn.prepare(
            "SELECT DISTINCT a.accum_id
             FROM accums a
             JOIN accum_options ao ON ao.accum_id = a.accum_id
             JOIN bet_options bo ON bo.option_id = ao.option_id
             WHERE bo.bet_id = ?1 AND a.settled IS NULL
             ORDER BY a.accum_id ASC",
        )?;
        let ids = stmt
            .query_map(params![bet_id], |row| row.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    /// Legs of an accumulator joined with the current option status.
    pub(crate) fn legs_with_status_tx(
        conn: &Connection,
        accum_id: i64,
    ) -> Result<Vec<(AccumLeg, OptionStatus)>> {
        let mut stmt = conn.prepare(
            "SELECT ao.accum_id, ao.option_id, ao.user_odds, bo.status
             FROM accum_options ao
             JOIN bet_options bo ON bo.option_id = ao.option_id
             WHERE ao.accum_id = ?1
             ORDER BY ao.option_id ASC",
        )?;
        let legs = stmt
            .query_map(params![accum_id], |row| {
                let leg = AccumLeg {
                    accum_id: row.get(0)?,
                    option_id: row.get(1)?,
                    user_odds: decimal_column(2, row.get::<_, String>(2)?)?,
                };
                let status_raw: String = row.get(3)?;
                let status = OptionStatus::from_str(&status_raw)
                    .ok_or_else(|| unknown_status(3, status_raw))?;
                Ok((leg, status))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(legs)
    }

    /// Guarded payout flip: false→true exactly once. Returns false when a
    /// concurrent settlement already paid; the caller must then skip the
    /// credit.
    pub(crate) fn try_mark_paid_tx(conn: &Connection, accum_id: i64) -> Result<bool> {
        let changed = conn.execute(
            "UPDATE accums SET paid_out = 1, settled = 'won'
             WHERE accum_id = ?1 AND paid_out = 0 AND settled IS NULL",
            params![accum_id],
        )?;
        Ok(changed == 1)
    }

    /// Guarded terminal mark for lost/refunded accumulators. Returns false
    /// when already settled.
    pub(crate) fn try_mark_settled_tx(
        conn: &Connection,
        accum_id: i64,
        settlement: AccumSettlement,
    ) -> Result<bool> {
        let changed = conn.execute(
            "UPDATE accums SET settled = ?1 WHERE accum_id = ?2 AND settled IS NULL",
            params![settlement.as_str(), accum_id],
        )?;
        Ok(changed == 1)
    }

    pub(crate) fn get_tx(conn: &Connection, accum_id: i64) -> Result<Accumulator> {
        conn.query_row(
            "SELECT accum_id, user_id, stake, total_odds, placed_timestamp, paid_out, settled
             FROM accums WHERE accum_id = ?1",
            params![accum_id],
            accum_from_row,
        )
        .optional()?
        .ok_or_else(|| WagerError::NotFound(format!("accumulator {accum_id}")))
    }

    fn leg_views_tx(conn: &Connection, accum_id: i64) -> Result<Vec<LegView>> {
        let mut stmt = conn.prepare(
            "SELECT ao.option_id, ao.user_odds, bo.label, b.title, bo.status
             FROM accum_options ao
             JOIN bet_options bo ON bo.option_id = ao.option_id
             JOIN bets b ON b.bet_id = bo.bet_id
             WHERE ao.accum_id = ?1
             ORDER BY ao.option_id ASC",
        )?;
        let legs = stmt
            .query_map(params![accum_id], |row| {
                let status_raw: String = row.get(4)?;
                let status = OptionStatus::from_str(&status_raw)
                    .ok_or_else(|| unknown_status(4, status_raw))?;
                Ok(LegView {
                    option_id: row.get(0)?,
                    user_odds: decimal_column(1, row.get::<_, String>(1)?)?,
                    option_label: row.get(2)?,
                    bet_title: row.get(3)?,
                    option_status: status,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(legs)
    }
}

fn accum_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Accumulator> {
    let settled = match row.get::<_, Option<String>>(6)? {
        Some(raw) => {
            Some(AccumSettlement::from_str(&raw).ok_or_else(|| unknown_status(6, raw))?)
        }
        None => None,
    };
    Ok(Accumulator {
        accum_id: row.get(0)?,
        user_id: row.get(1)?,
        stake: decimal_column(2, row.get::<_, String>(2)?)?,
        total_odds: decimal_column(3, row.get::<_, String>(3)?)?,
        placed_timestamp: timestamp_column(4, row.get::<_, String>(4)?)?,
        paid_out: row.get::<_, i64>(5)? == 1,
        settled,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{OptionOutcome, Principal};
    use crate::store::catalog::{CatalogStore, NewOption};
    use crate::store::LedgerStore;
    use chrono::Duration;
    use rust_decimal_macros::dec;
    use tempfile::NamedTempFile;

    struct Fixture {
        db: Db,
        accums: AccumStore,
        user_id: i64,
        bet_id: i64,
        option_ids: Vec<i64>,
        _temp: NamedTempFile,
    }

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
        let (bet_id, option_ids) = catalog
            .create_bet(&Principal::admin(1), "sports", "Derby", "admin", &close, &options)
            .unwrap();

        Fixture {
            accums: AccumStore::new(db.clone()),
            db,
            user_id: user.user_id,
            bet_id,
            option_ids,
            _temp: temp,
        }
    }

    fn place(fixture: &Fixture, stake: Decimal) -> i64 {
        let conn = fixture.db.open().unwrap();
        let legs = vec![
            (fixture.option_ids[0], dec!(2.0)),
            (fixture.option_ids[1], dec!(3.0)),
        ];
        AccumStore::insert_accum_tx(&conn, fixture.user_id, stake, dec!(6.0), &legs, Utc::now())
            .unwrap()
    }

    #[test]
    fn test_insert_and_get() {
        let fixture = create_fixture();
        let accum_id = place(&fixture, dec!(100));

        let accum = fixture.accums.get(accum_id).unwrap();
        assert_eq!(accum.stake, dec!(100));
        assert_eq!(accum.total_odds, dec!(6.0));
        assert!(!accum.paid_out);
        assert!(accum.settled.is_none());

        let legs = fixture.accums.list_legs(accum_id).unwrap();
        assert_eq!(legs.len(), 2);
        assert_eq!(legs[0].user_odds, dec!(2.0));
    }

    #[test]
    fn test_unsettled_scan_per_bet() {
        let fixture = create_fixture();
        let first = place(&fixture, dec!(10));
        let second = place(&fixture, dec!(20));

        let conn = fixture.db.open().unwrap();
        let candidates = AccumStore::unsettled_for_bet_tx(&conn, fixture.bet_id).unwrap();
        assert_eq!(candidates, vec![first, second]);

        // A terminal mark removes it from every future scan.
        assert!(AccumStore::try_mark_settled_tx(&conn, first, AccumSettlement::Lost).unwrap());
        let candidates = AccumStore::unsettled_for_bet_tx(&conn, fixture.bet_id).unwrap();
        assert_eq!(candidates, vec![second]);
    }

    #[test]
    fn test_legs_with_status_follow_option() {
        let fixture = create_fixture();
        let accum_id = place(&fixture, dec!(10));

        let conn = fixture.db.open().unwrap();
        let legs = AccumStore::legs_with_status_tx(&conn, accum_id).unwrap();
        assert!(legs.iter().all(|(_, status)| *status == OptionStatus::Open));

        CatalogStore::set_option_outcome_tx(&conn, fixture.option_ids[0], OptionOutcome::Won)
            .unwrap();
        let legs = AccumStore::legs_with_status_tx(&conn, accum_id).unwrap();
        assert_eq!(legs[0].1, OptionStatus::Won);
        assert_eq!(legs[1].1, OptionStatus::Open);
    }

    #[test]
    fn test_mark_paid_exactly_once() {
        let fixture = create_fixture();
        let accum_id = place(&fixture, dec!(10));

        let conn = fixture.db.open().unwrap();
        assert!(AccumStore::try_mark_paid_tx(&conn, accum_id).unwrap());
        // The loser of the race observes paid_out = 1 and must no-op.
        assert!(!AccumStore::try_mark_paid_tx(&conn, accum_id).unwrap());

        let accum = fixture.accums.get(accum_id).unwrap();
        assert!(accum.paid_out);
        assert_eq!(accum.settled, Some(AccumSettlement::Won));
    }

    #[test]
    fn test_mark_settled_exactly_once() {
        let fixture = create_fixture();
        let accum_id = place(&fixture, dec!(10));

        let conn = fixture.db.open().unwrap();
        assert!(AccumStore::try_mark_settled_tx(&conn, accum_id, AccumSettlement::Lost).unwrap());
        assert!(
            !AccumStore::try_mark_settled_tx(&conn, accum_id, AccumSettlement::Refunded).unwrap()
        );
        // A lost accumulator can never flip to paid.
        assert!(!AccumStore::try_mark_paid_tx(&conn, accum_id).unwrap());
    }

    #[test]
    fn test_list_for_user_view() {
        let fixture = create_fixture();
        place(&fixture, dec!(10));

        let views = fixture.accums.list_for_user(fixture.user_id).unwrap();
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].legs.len(), 2);
        assert_eq!(views[0].legs[0].bet_title, "Derby");
        assert_eq!(views[0].legs[0].option_label, "Home");

        assert!(fixture.accums.list_for_user(999).unwrap().is_empty());
    }

    #[test]
    fn test_list_referencing_option() {
        let fixture = create_fixture();
        let accum_id = place(&fixture, dec!(10));

        let refs = fixture
            .accums
            .list_referencing_option(fixture.option_ids[0])
            .unwrap();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].accum_id, accum_id);
    }
}
