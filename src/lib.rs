//! Punterbook Core
//!
//! Accumulator wagering and settlement engine: bet/option lifecycle,
//! placement with odds snapshotting, and exactly-once payout of winning
//! accumulators. HTTP transport, authentication and registration are
//! external collaborators; this crate exposes the records and services
//! they front.

pub mod config;
pub mod error;
pub mod models;
pub mod settlement;
pub mod store;
pub mod wager;

pub use error::{Result, WagerError};
pub use settlement::SettlementEngine;
pub use store::{AccumStore, CatalogStore, Db, LedgerStore};
pub use wager::WagerService;
