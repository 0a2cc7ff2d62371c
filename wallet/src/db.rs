//! # Wallet Database Schema
//!
//! | Store           | Key path                                 | Indexes                                  |
//! |-----------------|------------------------------------------|------------------------------------------|
//! | `exchanges`     | `base_url`                               | `by_master_pub` (`master_pub`)           |
//! | `denominations` | `[exchange_base_url, denom_pub]`         | `by_exchange` (`exchange_base_url`)      |
//! | `reserves`      | `reserve_pub`                            |                                          |
//! | `precoins`      | `coin_pub`                               | `by_reserve` (`reserve_pub`)             |
//! | `coins`         | `coin_pub`                               | `by_exchange` (`exchange_base_url`)      |
//! | `refresh`       | `session_id`                             | `by_coin` (`melt_coin_pub`)              |
//! | `purchases`     | `contract_hash`                          |                                          |
//! | `history`       | `id` (auto-increment)                    |                                          |

use coffer_store::{
    Database, Factory, IndexOptions, Key, ObjectStoreOptions, StoreError, StoreResult, Transaction,
};
use tracing::info;

use crate::config::DB_VERSION;
use crate::error::WalletResult;
use crate::records::HistoryEntry;

pub mod stores {
    pub const EXCHANGES: &str = "exchanges";
    pub const DENOMINATIONS: &str = "denominations";
    pub const RESERVES: &str = "reserves";
    pub const PRECOINS: &str = "precoins";
    pub const COINS: &str = "coins";
    pub const REFRESH: &str = "refresh";
    pub const PURCHASES: &str = "purchases";
    pub const HISTORY: &str = "history";

    pub const ALL: [&str; 8] = [
        EXCHANGES,
        DENOMINATIONS,
        RESERVES,
        PRECOINS,
        COINS,
        REFRESH,
        PURCHASES,
        HISTORY,
    ];
}

pub mod indexes {
    pub const BY_MASTER_PUB: &str = "by_master_pub";
    pub const DENOMS_BY_EXCHANGE: &str = "denominations_by_exchange";
    pub const PRECOINS_BY_RESERVE: &str = "precoins_by_reserve";
    pub const COINS_BY_EXCHANGE: &str = "coins_by_exchange";
    pub const REFRESH_BY_COIN: &str = "refresh_by_coin";
}

/// Open (and on first use create) the wallet database.
pub async fn open(factory: &Factory, name: &str) -> StoreResult<Database> {
    factory
        .open(name, DB_VERSION, |vc| async move {
            info!(
                old_version = vc.old_version(),
                new_version = vc.new_version(),
                "creating wallet schema"
            );
            let exchanges = vc.create_keyed_store(stores::EXCHANGES, "base_url")?;
            exchanges.create_index(indexes::BY_MASTER_PUB, "master_pub", IndexOptions::default())?;

            let denoms = vc.create_keyed_store(
                stores::DENOMINATIONS,
                vec!["exchange_base_url", "denom_pub"],
            )?;
            denoms.create_index(
                indexes::DENOMS_BY_EXCHANGE,
                "exchange_base_url",
                IndexOptions::default(),
            )?;

            vc.create_keyed_store(stores::RESERVES, "reserve_pub")?;

            let precoins = vc.create_keyed_store(stores::PRECOINS, "coin_pub")?;
            precoins.create_index(indexes::PRECOINS_BY_RESERVE, "reserve_pub", IndexOptions::default())?;

            let coins = vc.create_keyed_store(stores::COINS, "coin_pub")?;
            coins.create_index(
                indexes::COINS_BY_EXCHANGE,
                "exchange_base_url",
                IndexOptions::default(),
            )?;

            let refresh = vc.create_keyed_store(stores::REFRESH, "session_id")?;
            refresh.create_index(indexes::REFRESH_BY_COIN, "melt_coin_pub", IndexOptions::default())?;

            vc.create_keyed_store(stores::PURCHASES, "contract_hash")?;

            vc.create_object_store(
                stores::HISTORY,
                ObjectStoreOptions::new().key_path("id").auto_increment(true),
            )?;
            Ok::<(), StoreError>(())
        })
        .await
}

/// Primary key of a denomination record.
pub fn denom_key(exchange_base_url: &str, denom_pub: &str) -> Key {
    Key::Array(vec![Key::from(exchange_base_url), Key::from(denom_pub)])
}

/// Append `entry` to the history inside `tx`, which must have the history
/// store in scope.
pub async fn append_history(tx: &Transaction, entry: HistoryEntry) -> WalletResult<()> {
    tx.object_store(stores::HISTORY)?.add_item(&entry).await?;
    Ok(())
}
