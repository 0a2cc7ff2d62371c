// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # Coffer Command-Line Wallet
//!
//! Entry point for the `coffer` binary. Parses arguments, initializes
//! logging, restores the wallet database from its sled snapshot store and
//! runs one wallet operation. Results go to stdout as JSON.
//!
//! ```text
//!   --data-dir/snapshots (sled) ──restore──▶ MemoryBackend ──▶ Wallet
//!            ▲                                   │
//!            └──────── after every commit ───────┘
//! ```

mod cli;
mod logging;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use serde_json::json;

use coffer_store::{Factory, MemoryBackend, SledSnapshots};
use coffer_wallet::{
    Amount, HttpClient, LocalCrypto, Offer, ReqwestHttpClient, Wallet, WalletConfig, WalletError,
};

use cli::{CofferCli, Commands};
use logging::LogFormat;

/// Directory under `--data-dir` holding the sled snapshot store.
const SNAPSHOT_DIR: &str = "snapshots";

#[tokio::main]
async fn main() -> Result<()> {
    let cli = CofferCli::parse();

    if let Commands::Version = cli.command {
        print_version();
        return Ok(());
    }

    logging::init_logging(logging::DEFAULT_FILTER, LogFormat::from_str_lossy(&cli.log_format));

    let session = Session::open(&cli.data_dir).await?;
    let result = run(&session, cli.command).await;
    session.wallet.wait_for_background_tasks().await;
    session.wallet.close();

    if let Err(e) = &result {
        if let Some(wallet_error) = e.downcast_ref::<WalletError>() {
            eprintln!("{}", serde_json::to_string_pretty(&wallet_error.to_payload())?);
        }
    }
    result
}

/// The open wallet and the backend it lives in.
struct Session {
    backend: Arc<MemoryBackend>,
    wallet: Wallet,
}

impl Session {
    async fn open(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data directory {}", data_dir.display()))?;

        let backend = Arc::new(MemoryBackend::new());
        let snapshot_path = data_dir.join(SNAPSHOT_DIR);
        SledSnapshots::open(&snapshot_path)
            .and_then(|snapshots| snapshots.attach(&backend))
            .with_context(|| format!("failed to load snapshots from {}", snapshot_path.display()))?;

        let http: Arc<dyn HttpClient> =
            Arc::new(ReqwestHttpClient::new().context("failed to build the HTTP client")?);
        let wallet = Wallet::open(
            &Factory::with_backend(Arc::clone(&backend)),
            Arc::new(LocalCrypto::new()),
            http,
            WalletConfig::default(),
        )
        .await
        .context("failed to open the wallet database")?;

        tracing::debug!(data_dir = %data_dir.display(), "wallet session opened");
        Ok(Self { backend, wallet })
    }
}

async fn run(session: &Session, command: Commands) -> Result<()> {
    let wallet = &session.wallet;
    match command {
        Commands::CreateReserve(args) => {
            let amount: Amount = args.amount.parse().context("invalid amount")?;
            let created = wallet.create_reserve(amount, &args.exchange).await?;
            print_json(&created)
        }
        Commands::ConfirmReserve(args) => {
            wallet.confirm_reserve(&args.reserve_pub).await?;
            wallet.wait_for_background_tasks().await;
            let reserve = wallet.get_reserve(&args.reserve_pub).await?;
            print_json(&json!({
                "reserve_pub": reserve.reserve_pub,
                "exchange": reserve.exchange_base_url,
                "status": reserve.status,
                "current_amount": reserve.current_amount,
                "precoin_amount": reserve.precoin_amount,
            }))
        }
        Commands::CreationInfo(args) => {
            let amount: Amount = args.amount.parse().context("invalid amount")?;
            let info = wallet.get_reserve_creation_info(&args.exchange, &amount).await?;
            print_json(&info)
        }
        Commands::Balance => print_json(&wallet.get_balances().await?),
        Commands::Pay(args) => {
            let raw = std::fs::read_to_string(&args.offer)
                .with_context(|| format!("failed to read offer {}", args.offer.display()))?;
            let offer: Offer = serde_json::from_str(&raw).context("offer is not valid JSON")?;
            let purchase = wallet.confirm_pay(&offer).await?;
            print_json(&purchase.pay_req)
        }
        Commands::Refresh(args) => {
            let session_id = wallet.refresh(&args.coin_pub).await?;
            print_json(&json!({ "coin_pub": args.coin_pub, "session_id": session_id }))
        }
        Commands::RefreshDirty => print_json(&wallet.refresh_dirty_coins().await?),
        Commands::History => print_json(&wallet.get_history().await?),
        Commands::Pending => print_json(&wallet.pending_operations().await?),
        Commands::Dump => {
            let dump = session.backend.export_database(wallet.db().name())?;
            println!("{}", dump.to_json()?);
            Ok(())
        }
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_version() {
    println!("coffer {}", env!("CARGO_PKG_VERSION"));
    println!(
        "wallet database: {} (schema version {})",
        coffer_wallet::config::DB_NAME,
        coffer_wallet::config::DB_VERSION
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn session_persists_commits_to_the_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let session = Session::open(dir.path()).await.unwrap();
        let created = session
            .wallet
            .create_reserve("EUR:5".parse().unwrap(), "exchange.example.com")
            .await
            .unwrap();
        assert_eq!(created.exchange, "https://exchange.example.com/");

        let dump = session
            .backend
            .export_database(session.wallet.db().name())
            .unwrap();
        let json = dump.to_json().unwrap();
        assert!(json.contains(&created.reserve_pub));
        assert!(dir.path().join(SNAPSHOT_DIR).exists());
        session.wallet.close();
    }
}
