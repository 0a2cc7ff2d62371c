//! # CLI Interface
//!
//! Command-line structure of `coffer`, built with `clap` derive. Every
//! subcommand except `version` opens the wallet stored under `--data-dir`.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Coffer: a blind-signature coin wallet.
///
/// Withdraws coins from exchange reserves, pays merchants with them and
/// refreshes what is left over. State is kept in a snapshot store under the
/// data directory.
#[derive(Parser, Debug)]
#[command(name = "coffer", about = "Blind-signature coin wallet", version, propagate_version = true)]
pub struct CofferCli {
    /// Directory holding the wallet's snapshot store.
    #[arg(long, short = 'd', env = "COFFER_DATA_DIR", default_value = ".coffer", global = true)]
    pub data_dir: PathBuf,

    /// Log format: "pretty" or "json".
    #[arg(long, env = "COFFER_LOG_FORMAT", default_value = "pretty", global = true)]
    pub log_format: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create a reserve at an exchange. Prints the reserve public key to
    /// quote as the wire transfer subject.
    CreateReserve(CreateReserveArgs),
    /// Confirm that the wire transfer was made and withdraw the reserve.
    /// Waits until the withdrawal has finished or given up.
    ConfirmReserve(ReserveArgs),
    /// Show what a withdrawal of an amount would select and cost.
    CreationInfo(CreateReserveArgs),
    /// Per-currency balances.
    Balance,
    /// Pay a merchant offer read from a JSON file.
    Pay(PayArgs),
    /// Refresh one coin.
    Refresh(CoinArgs),
    /// Refresh every coin with value left after a payment.
    RefreshDirty,
    /// Wallet history, oldest first.
    History,
    /// Reserves, pre-coins and refresh sessions still in progress.
    Pending,
    /// Print the wallet database as JSON.
    Dump,
    /// Print version information and exit.
    Version,
}

#[derive(Parser, Debug)]
pub struct CreateReserveArgs {
    /// Amount as `CURRENCY:VALUE[.FRACTION]`, e.g. `EUR:10.50`.
    #[arg(long, short = 'a')]
    pub amount: String,

    /// Exchange base URL. `https://` is assumed when no scheme is given.
    #[arg(long, short = 'e', env = "COFFER_EXCHANGE")]
    pub exchange: String,
}

#[derive(Parser, Debug)]
pub struct ReserveArgs {
    /// Public key of the reserve.
    pub reserve_pub: String,
}

#[derive(Parser, Debug)]
pub struct PayArgs {
    /// File containing the offer: `{ contract, merchant_sig, contract_hash }`.
    pub offer: PathBuf,
}

#[derive(Parser, Debug)]
pub struct CoinArgs {
    /// Public key of the coin.
    pub coin_pub: String,
}
