//! Balances, history and pending work: read-only views over the wallet.

use std::collections::BTreeMap;

use coffer_store::KeyRange;
use serde::{Deserialize, Serialize};

use crate::amounts::Amount;
use crate::db::{denom_key, stores};
use crate::error::{WalletError, WalletResult};
use crate::records::{
    CoinRecord, CoinStatus, DenominationRecord, HistoryEntry, PreCoinRecord, PurchaseRecord,
    RefreshSessionRecord, ReserveRecord, ReserveStatus,
};
use crate::wallet::Wallet;

/// Balance of one currency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    /// Spendable coins.
    pub available: Amount,
    /// Reserves not yet withdrawn, pre-coins and unfinished refreshes.
    pub pending_incoming: Amount,
    /// Paid but not yet acknowledged by the merchant.
    pub pending_payment: Amount,
}

impl Balance {
    fn zero(currency: &str) -> Self {
        Self {
            available: Amount::zero(currency),
            pending_incoming: Amount::zero(currency),
            pending_payment: Amount::zero(currency),
        }
    }
}

/// Currency code to balance.
pub type Balances = BTreeMap<String, Balance>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum PendingOperation {
    Reserve {
        reserve_pub: String,
        exchange_base_url: String,
        status: ReserveStatus,
        #[serde(default)]
        current_amount: Option<Amount>,
    },
    PreCoin {
        coin_pub: String,
        reserve_pub: String,
        value: Amount,
    },
    Refresh {
        session_id: String,
        melt_coin_pub: String,
        melted: bool,
    },
    DirtyCoin {
        coin_pub: String,
        current_amount: Amount,
    },
}

fn add_to(slot: &mut Amount, amount: &Amount) -> WalletResult<()> {
    *slot = slot
        .add(amount)?
        .checked()
        .ok_or_else(|| WalletError::Saturated("summing balances".into()))?;
    Ok(())
}

struct Snapshot {
    coins: Vec<CoinRecord>,
    reserves: Vec<ReserveRecord>,
    precoins: Vec<PreCoinRecord>,
    sessions: Vec<RefreshSessionRecord>,
    purchases: Vec<PurchaseRecord>,
    /// Values of the new coins of every unfinished session.
    refresh_values: Vec<Amount>,
}

impl Wallet {
    async fn snapshot(&self) -> WalletResult<Snapshot> {
        self.inner
            .db
            .run_read(
                &[
                    stores::COINS,
                    stores::RESERVES,
                    stores::PRECOINS,
                    stores::REFRESH,
                    stores::PURCHASES,
                    stores::DENOMINATIONS,
                ],
                |tx| async move {
                    let all = KeyRange::all;
                    let coins: Vec<CoinRecord> =
                        tx.object_store(stores::COINS)?.get_all_items(all(), 0).await?;
                    let reserves: Vec<ReserveRecord> =
                        tx.object_store(stores::RESERVES)?.get_all_items(all(), 0).await?;
                    let precoins: Vec<PreCoinRecord> =
                        tx.object_store(stores::PRECOINS)?.get_all_items(all(), 0).await?;
                    let sessions: Vec<RefreshSessionRecord> =
                        tx.object_store(stores::REFRESH)?.get_all_items(all(), 0).await?;
                    let purchases: Vec<PurchaseRecord> =
                        tx.object_store(stores::PURCHASES)?.get_all_items(all(), 0).await?;

                    let denoms = tx.object_store(stores::DENOMINATIONS)?;
                    let mut refresh_values = Vec::new();
                    for session in sessions.iter().filter(|s| !s.finished) {
                        for denom_pub in &session.new_denoms {
                            let denom: Option<DenominationRecord> = denoms
                                .get_item(denom_key(&session.exchange_base_url, denom_pub))
                                .await?;
                            if let Some(denom) = denom {
                                refresh_values.push(denom.value);
                            }
                        }
                    }
                    WalletResult::Ok(Snapshot {
                        coins,
                        reserves,
                        precoins,
                        sessions,
                        purchases,
                        refresh_values,
                    })
                },
            )
            .await
    }

    /// Per-currency balances.
    pub async fn get_balances(&self) -> WalletResult<Balances> {
        let snap = self.snapshot().await?;
        let mut balances = Balances::new();
        for coin in snap.coins.iter().filter(|c| c.is_spendable()) {
            let b = entry(&mut balances, coin.current_amount.currency());
            add_to(&mut b.available, &coin.current_amount)?;
        }
        for reserve in &snap.reserves {
            if reserve.status == ReserveStatus::Unconfirmed || reserve.status == ReserveStatus::Depleted {
                continue;
            }
            let b = entry(&mut balances, reserve.requested_amount.currency());
            match &reserve.current_amount {
                Some(current) => add_to(&mut b.pending_incoming, current)?,
                None => add_to(&mut b.pending_incoming, &reserve.requested_amount)?,
            }
        }
        for pc in &snap.precoins {
            let b = entry(&mut balances, pc.coin_value.currency());
            add_to(&mut b.pending_incoming, &pc.coin_value)?;
        }
        for value in &snap.refresh_values {
            let b = entry(&mut balances, value.currency());
            add_to(&mut b.pending_incoming, value)?;
        }
        for purchase in snap.purchases.iter().filter(|p| !p.finished) {
            let b = entry(&mut balances, purchase.contract.amount.currency());
            for sig in &purchase.pay_req.coins {
                add_to(&mut b.pending_payment, &sig.contribution)?;
            }
        }
        Ok(balances)
    }

    /// Every history entry, oldest first.
    pub async fn get_history(&self) -> WalletResult<Vec<HistoryEntry>> {
        self.inner
            .db
            .run_read(&[stores::HISTORY], |tx| async move {
                let entries = tx
                    .object_store(stores::HISTORY)?
                    .get_all_items::<HistoryEntry>(KeyRange::all(), 0)
                    .await?;
                WalletResult::Ok(entries)
            })
            .await
    }

    /// Work the wallet still has to do or is waiting on.
    pub async fn pending_operations(&self) -> WalletResult<Vec<PendingOperation>> {
        let snap = self.snapshot().await?;
        let mut pending = Vec::new();
        for r in snap.reserves {
            if r.status != ReserveStatus::Depleted {
                pending.push(PendingOperation::Reserve {
                    reserve_pub: r.reserve_pub,
                    exchange_base_url: r.exchange_base_url,
                    status: r.status,
                    current_amount: r.current_amount,
                });
            }
        }
        for pc in snap.precoins {
            pending.push(PendingOperation::PreCoin {
                coin_pub: pc.coin_pub,
                reserve_pub: pc.reserve_pub,
                value: pc.coin_value,
            });
        }
        for s in snap.sessions.into_iter().filter(|s| !s.finished) {
            pending.push(PendingOperation::Refresh {
                melted: s.is_melted(),
                session_id: s.session_id,
                melt_coin_pub: s.melt_coin_pub,
            });
        }
        for c in snap.coins {
            if c.status == CoinStatus::Dirty && !c.current_amount.is_zero() {
                pending.push(PendingOperation::DirtyCoin {
                    coin_pub: c.coin_pub,
                    current_amount: c.current_amount,
                });
            }
        }
        Ok(pending)
    }
}

fn entry<'a>(balances: &'a mut Balances, currency: &str) -> &'a mut Balance {
    balances
        .entry(currency.to_string())
        .or_insert_with(|| Balance::zero(currency))
}
