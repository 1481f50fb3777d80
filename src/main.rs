//! Punterbook operator CLI
//! Mission: Drive the wagering core from the command line
//!
//! Every subcommand is one unit of work against the store. The `--user` and
//! `--admin` flags stand in for the principal an auth collaborator would
//! supply in production.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use rust_decimal::Decimal;
use tracing_subscriber::EnvFilter;

use punterbook::config::Config;
use punterbook::models::{OptionOutcome, Principal};
use punterbook::store::catalog::NewOption;
use punterbook::{CatalogStore, Db, LedgerStore, SettlementEngine, WagerService};

#[derive(Parser)]
#[command(name = "punterbook", about = "Accumulator wagering and settlement")]
struct Cli {
    /// SQLite database file (overrides PUNTERBOOK_DB)
    #[arg(long)]
    db: Option<String>,

    /// Acting user id
    #[arg(long, default_value_t = 1)]
    user: i64,

    /// Act with the admin capability
    #[arg(long)]
    admin: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a user account
    CreateUser {
        username: String,
        /// Starting balance (defaults to PUNTERBOOK_STARTING_BALANCE)
        #[arg(long)]
        balance: Option<Decimal>,
    },
    /// Show a user's balance
    Balance { user_id: i64 },
    /// Create a bet (admins publish directly, users submit a request)
    CreateBet {
        category: String,
        title: String,
        /// RFC 3339 close timestamp, e.g. 2026-09-01T18:00:00Z
        close: String,
        /// Repeatable option spec, LABEL=ODDS
        #[arg(long = "option", value_name = "LABEL=ODDS", required = true)]
        options: Vec<String>,
    },
    /// Accept a requested bet
    AcceptBet { bet_id: i64 },
    /// Close a bet early (blocks new wagers, resolves nothing)
    CloseBet { bet_id: i64 },
    /// Void a bet and refund affected accumulators
    VoidBet { bet_id: i64 },
    /// Add an option to an existing bet
    AddOption {
        bet_id: i64,
        label: String,
        odds: Decimal,
    },
    /// Update the live odds of an open option
    UpdateOdds { option_id: i64, odds: Decimal },
    /// Record an option outcome and run settlement
    SetOutcome {
        option_id: i64,
        /// won or lost
        outcome: String,
    },
    /// Place an accumulator over one or more options
    Place {
        stake: Decimal,
        #[arg(required = true)]
        option_ids: Vec<i64>,
    },
    /// List bets open for wagering (or requested ones)
    ListBets {
        #[arg(long)]
        requested: bool,
    },
    /// List a user's accumulators with their legs
    ListAccums { user_id: Option<i64> },
}

fn main() -> Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;
    let db_path = cli.db.as_deref().unwrap_or(&config.database_path);
    let db = Db::new(db_path).with_context(|| format!("opening database {db_path}"))?;

    let principal = if cli.admin {
        Principal::admin(cli.user)
    } else {
        Principal::user(cli.user)
    };

    let ledger = LedgerStore::new(db.clone());
    let catalog = CatalogStore::new(db.clone());
    let wager = WagerService::new(db.clone());
    let engine = SettlementEngine::new(db);

    match cli.command {
        Command::CreateUser { username, balance } => {
            let balance = balance.unwrap_or(config.starting_balance);
            let user = ledger.create_user(&username, balance)?;
            println!("{}", serde_json::to_string_pretty(&user)?);
        }
        Command::Balance { user_id } => {
            let balance = ledger.get_balance(user_id)?;
            println!("{balance}");
        }
        Command::CreateBet {
            category,
            title,
            close,
            options,
        } => {
            let options = options
                .iter()
                .map(|spec| parse_option_spec(spec))
                .collect::<Result<Vec<_>>>()?;
            let submitter = ledger.get_user(cli.user)?.username;
            let (bet_id, option_ids) =
                catalog.create_bet(&principal, &category, &title, &submitter, &close, &options)?;
            println!("bet {bet_id} created with options {option_ids:?}");
        }
        Command::AcceptBet { bet_id } => {
            catalog.accept_bet(&principal, bet_id)?;
            println!("bet {bet_id} accepted");
        }
        Command::CloseBet { bet_id } => {
            catalog.close_early(&principal, bet_id)?;
            println!("bet {bet_id} closed early");
        }
        Command::VoidBet { bet_id } => {
            let report = engine.void_bet(&principal, bet_id)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::AddOption {
            bet_id,
            label,
            odds,
        } => {
            let option_id = catalog.add_option(&principal, bet_id, &label, odds)?;
            println!("option {option_id} added to bet {bet_id}");
        }
        Command::UpdateOdds { option_id, odds } => {
            catalog.update_option_odds(&principal, option_id, odds)?;
            println!("option {option_id} odds set to {odds}");
        }
        Command::SetOutcome { option_id, outcome } => {
            let outcome = OptionOutcome::from_str(&outcome)
                .ok_or_else(|| anyhow!("outcome must be won or lost, got {outcome:?}"))?;
            let report = engine.resolve_option(&principal, option_id, outcome)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Place { stake, option_ids } => {
            let receipt = wager.place_accumulator(&principal, stake, &option_ids)?;
            println!("{}", serde_json::to_string_pretty(&receipt)?);
        }
        Command::ListBets { requested } => {
            let bets = if requested {
                catalog.list_requested_bets()?
            } else {
                catalog.list_open_bets()?
            };
            println!("{}", serde_json::to_string_pretty(&bets)?);
        }
        Command::ListAccums { user_id } => {
            let accums = wager.list_accumulators_for_user(user_id.unwrap_or(cli.user))?;
            println!("{}", serde_json::to_string_pretty(&accums)?);
        }
    }

    Ok(())
}

/// Parse a `LABEL=ODDS` option spec.
fn parse_option_spec(spec: &str) -> Result<NewOption> {
    let (label, odds) = spec
        .split_once('=')
        .ok_or_else(|| anyhow!("option spec must be LABEL=ODDS, got {spec:?}"))?;
    let odds: Decimal = odds
        .parse()
        .with_context(|| format!("invalid odds in option spec {spec:?}"))?;
    Ok(NewOption {
        label: label.to_string(),
        odds,
    })
}
