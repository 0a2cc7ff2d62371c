//! # Reserves and Withdrawal
//!
//! A reserve is money wired to an exchange under a fresh reserve key. Once
//! the user confirms the transfer, the wallet asks the exchange for the
//! reserve's balance and withdraws it as coins:
//!
//! ```text
//!   create_reserve ──▶ Unconfirmed
//!   confirm_reserve ─▶ Confirmed ──(spawn)──▶ process_reserve
//!                                               │ update_exchange   GET /keys
//!                                               │ update_reserve    GET /reserve/status
//!                                               ▼
//!                                             Withdrawing
//!                                               │ plan: current_amount ─▶ precoin_amount
//!                                               │ process_pre_coin  POST /reserve/withdraw
//!                                               ▼
//!                                             Depleted
//! ```
//!
//! Planning moves each coin's cost from `current_amount` to
//! `precoin_amount` in the same transaction that stores the pre-coin, and
//! storing the signed coin removes it from `precoin_amount` in the same
//! transaction that deletes the pre-coin. At every commit
//! `current_amount + precoin_amount + Σ withdrawn costs` equals the balance
//! the exchange reported.

use chrono::{DateTime, Utc};
use coffer_store::KeyRange;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::amounts::Amount;
use crate::config::WITHDRAW_DENOM_LIMIT;
use crate::crypto::create_pre_coin;
use crate::db::{append_history, indexes, stores};
use crate::error::{WalletError, WalletResult};
use crate::http::{canonicalize_base_url, join_url, post};
use crate::records::{
    CoinRecord, CoinStatus, DenominationRecord, HistoryEntry, HistoryEvent, PreCoinRecord,
    ReserveRecord, ReserveStatus,
};
use crate::retry::retry;
use crate::wallet::Wallet;

// ---------------------------------------------------------------------------
// Denomination Selection
// ---------------------------------------------------------------------------

/// Greedy withdrawal plan for `available`: the largest withdrawable
/// denomination whose value plus withdraw fee still fits, repeated until
/// nothing fits or [`WITHDRAW_DENOM_LIMIT`] coins are planned. The total
/// cost of the plan never exceeds `available`.
pub fn get_withdraw_denom_list(
    available: &Amount,
    denoms: &[DenominationRecord],
    now: DateTime<Utc>,
) -> WalletResult<Vec<DenominationRecord>> {
    let mut candidates: Vec<(&DenominationRecord, Amount)> = Vec::new();
    for d in denoms {
        if d.is_withdrawable(now) && d.value.currency() == available.currency() {
            candidates.push((d, d.withdraw_cost()?));
        }
    }
    let mut ordering_error = None;
    candidates.sort_by(|(a, _), (b, _)| match b.value.checked_cmp(&a.value) {
        Ok(ord) => ord,
        Err(e) => {
            ordering_error.get_or_insert(e);
            std::cmp::Ordering::Equal
        }
    });
    if let Some(e) = ordering_error {
        return Err(e.into());
    }

    let mut remaining = available.clone();
    let mut selected = Vec::new();
    while selected.len() < WITHDRAW_DENOM_LIMIT {
        let mut fitting = None;
        for (d, cost) in &candidates {
            if remaining.checked_cmp(cost)?.is_ge() {
                fitting = Some((*d, cost));
                break;
            }
        }
        let Some((d, cost)) = fitting else { break };
        remaining = remaining.sub(cost)?.amount;
        selected.push(d.clone());
    }
    Ok(selected)
}

// ---------------------------------------------------------------------------
// Wire Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReserveStatusResponse {
    pub balance: Amount,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WithdrawRequest {
    pub denom_pub: String,
    pub reserve_pub: String,
    pub reserve_sig: String,
    pub coin_ev: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WithdrawResponse {
    pub ev_sig: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateReserveResponse {
    /// Canonical base URL of the exchange.
    pub exchange: String,
    pub reserve_pub: String,
}

/// What withdrawing `amount` from an exchange would yield.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReserveCreationInfo {
    pub exchange: String,
    pub selected_denoms: Vec<DenominationRecord>,
    /// Sum of withdraw fees of the selected coins.
    pub withdraw_fee: Amount,
    /// Part of `amount` that no selected coin covers.
    pub overhead: Amount,
}

// ---------------------------------------------------------------------------
// Reserve Lifecycle
// ---------------------------------------------------------------------------

impl Wallet {
    /// Create an unconfirmed reserve for `amount` at `exchange_url`.
    pub async fn create_reserve(&self, amount: Amount, exchange_url: &str) -> WalletResult<CreateReserveResponse> {
        let keys = self.crypto().create_keypair().await?;
        let exchange = canonicalize_base_url(exchange_url);
        let reserve = ReserveRecord {
            reserve_pub: keys.public.clone(),
            reserve_priv: keys.private,
            exchange_base_url: exchange.clone(),
            created: Utc::now(),
            last_query: None,
            precoin_amount: Amount::zero(amount.currency()),
            requested_amount: amount.clone(),
            current_amount: None,
            status: ReserveStatus::Unconfirmed,
        };
        self.inner
            .db
            .run_write(&[stores::RESERVES, stores::HISTORY], |tx| async move {
                tx.object_store(stores::RESERVES)?.add_item(&reserve).await?;
                append_history(
                    &tx,
                    HistoryEntry::now(HistoryEvent::CreateReserve {
                        reserve_pub: reserve.reserve_pub.clone(),
                        requested_amount: reserve.requested_amount.clone(),
                    }),
                )
                .await
            })
            .await?;
        info!(reserve = %keys.public, exchange = %exchange, %amount, "reserve created");
        Ok(CreateReserveResponse {
            exchange,
            reserve_pub: keys.public,
        })
    }

    /// Mark a reserve as confirmed and start withdrawing from it in the
    /// background. Confirming twice is harmless.
    pub async fn confirm_reserve(&self, reserve_pub: &str) -> WalletResult<()> {
        let newly_confirmed = self
            .inner
            .db
            .run_write(&[stores::RESERVES, stores::HISTORY], |tx| async move {
                let reserves = tx.object_store(stores::RESERVES)?;
                let mut reserve: ReserveRecord = reserves
                    .get_item(reserve_pub)
                    .await?
                    .ok_or_else(|| WalletError::ReserveNotFound(reserve_pub.to_string()))?;
                if reserve.is_confirmed() {
                    return Ok(false);
                }
                reserve.status = ReserveStatus::Confirmed;
                reserves.put_item(&reserve).await?;
                append_history(
                    &tx,
                    HistoryEntry::now(HistoryEvent::ConfirmReserve {
                        reserve_pub: reserve_pub.to_string(),
                    }),
                )
                .await?;
                WalletResult::Ok(true)
            })
            .await?;

        if newly_confirmed {
            info!(reserve = %reserve_pub, "reserve confirmed");
        } else {
            debug!(reserve = %reserve_pub, "reserve was already confirmed");
        }
        self.spawn_reserve_processing(reserve_pub);
        Ok(())
    }

    fn spawn_reserve_processing(&self, reserve_pub: &str) {
        let wallet = self.clone();
        let reserve_pub = reserve_pub.to_string();
        self.spawn_background(format!("reserve {}", reserve_pub), async move {
            wallet.process_reserve(&reserve_pub).await
        });
    }

    /// Restart background processing for every reserve that was confirmed
    /// but not depleted, e.g. after the process restarted.
    pub async fn resume_pending_reserves(&self) -> WalletResult<usize> {
        let reserves: Vec<ReserveRecord> = self
            .inner
            .db
            .run_read(&[stores::RESERVES], |tx| async move {
                let all = tx
                    .object_store(stores::RESERVES)?
                    .get_all_items::<ReserveRecord>(KeyRange::all(), 0)
                    .await?;
                WalletResult::Ok(all)
            })
            .await?;
        let mut resumed = 0;
        for r in reserves {
            if matches!(r.status, ReserveStatus::Confirmed | ReserveStatus::Withdrawing) {
                self.spawn_reserve_processing(&r.reserve_pub);
                resumed += 1;
            }
        }
        Ok(resumed)
    }

    pub async fn get_reserve(&self, reserve_pub: &str) -> WalletResult<ReserveRecord> {
        let found: Option<ReserveRecord> = self
            .inner
            .db
            .run_read(&[stores::RESERVES], |tx| async move {
                let r = tx.object_store(stores::RESERVES)?.get_item(reserve_pub).await?;
                WalletResult::Ok(r)
            })
            .await?;
        found.ok_or_else(|| WalletError::ReserveNotFound(reserve_pub.to_string()))
    }

    /// Query the balance of a confirmed reserve and withdraw all of it.
    /// Transient failures are retried with the reserve backoff policy.
    pub async fn process_reserve(&self, reserve_pub: &str) -> WalletResult<()> {
        let _guard = self.begin("reserve", reserve_pub)?;
        let reserve = self.get_reserve(reserve_pub).await?;
        match reserve.status {
            ReserveStatus::Unconfirmed => {
                return Err(WalletError::InvalidState(format!(
                    "reserve {} is not confirmed",
                    reserve_pub
                )))
            }
            ReserveStatus::Depleted => return Ok(()),
            ReserveStatus::Confirmed | ReserveStatus::Withdrawing => {}
        }

        let policy = self.inner.config.reserve_retry;
        retry(&policy, "update exchange", || {
            self.update_exchange(&reserve.exchange_base_url)
        })
        .await?;
        if reserve.status == ReserveStatus::Confirmed {
            retry(&policy, "query reserve", || self.update_reserve(reserve_pub)).await?;
        }
        retry(&policy, "deplete reserve", || self.deplete_reserve(reserve_pub)).await
    }

    /// Ask the exchange for the reserve's balance and record it.
    pub(crate) async fn update_reserve(&self, reserve_pub: &str) -> WalletResult<ReserveRecord> {
        let reserve = self.get_reserve(reserve_pub).await?;
        let url = join_url(
            &reserve.exchange_base_url,
            &format!("reserve/status?reserve_pub={}", reserve_pub),
        );
        let response = self.http().get(&url).await?;
        if response.status == 404 {
            return Err(WalletError::ReserveNotReady(reserve_pub.to_string()));
        }
        let status: ReserveStatusResponse = response.json()?;
        if status.balance.currency() != reserve.requested_amount.currency() {
            return Err(WalletError::Protocol(format!(
                "reserve {} reported in {} instead of {}",
                reserve_pub,
                status.balance.currency(),
                reserve.requested_amount.currency()
            )));
        }

        let updated = self
            .inner
            .db
            .run_write(&[stores::RESERVES, stores::HISTORY], |tx| async move {
                let reserves = tx.object_store(stores::RESERVES)?;
                let mut reserve: ReserveRecord = reserves
                    .get_item(reserve_pub)
                    .await?
                    .ok_or_else(|| WalletError::ReserveNotFound(reserve_pub.to_string()))?;
                if reserve.status != ReserveStatus::Confirmed {
                    // Someone else already took over the balance.
                    return Ok(reserve);
                }
                let old_amount = reserve.current_amount.replace(status.balance.clone());
                reserve.last_query = Some(Utc::now());
                reserve.status = ReserveStatus::Withdrawing;
                reserves.put_item(&reserve).await?;
                append_history(
                    &tx,
                    HistoryEntry::now(HistoryEvent::ReserveUpdate {
                        reserve_pub: reserve_pub.to_string(),
                        old_amount,
                        new_amount: status.balance.clone(),
                    }),
                )
                .await?;
                WalletResult::Ok(reserve)
            })
            .await?;
        info!(
            reserve = %reserve_pub,
            balance = ?updated.current_amount,
            "reserve balance updated"
        );
        Ok(updated)
    }

    /// Plan pre-coins for the reserve's unplanned balance, exchange every
    /// pre-coin of the reserve for a coin and mark the reserve depleted.
    pub(crate) async fn deplete_reserve(&self, reserve_pub: &str) -> WalletResult<()> {
        let reserve = self.get_reserve(reserve_pub).await?;
        let Some(available) = reserve.current_amount.clone() else {
            return Err(WalletError::InvalidState(format!(
                "reserve {} has no known balance",
                reserve_pub
            )));
        };
        let denoms = self.get_denominations(&reserve.exchange_base_url).await?;
        let plan = get_withdraw_denom_list(&available, &denoms, Utc::now())?;
        debug!(reserve = %reserve_pub, coins = plan.len(), %available, "withdrawal planned");

        for denom in &plan {
            let pre_coin = create_pre_coin(self.crypto(), denom, &reserve).await?;
            if !self.store_pre_coin(&pre_coin).await? {
                warn!(reserve = %reserve_pub, "reserve balance shrank while planning");
                break;
            }
        }

        let pending = self.pre_coins_of(reserve_pub).await?;
        let results = futures::future::join_all(
            pending.iter().map(|pc| self.process_pre_coin(&pc.coin_pub)),
        )
        .await;
        let mut failure = None;
        for result in results {
            match result {
                Ok(()) | Err(WalletError::Busy(_)) => {}
                Err(e) => {
                    failure.get_or_insert(e);
                }
            }
        }
        if let Some(e) = failure {
            return Err(e);
        }
        if !self.pre_coins_of(reserve_pub).await?.is_empty() {
            return Err(WalletError::WithdrawalPending(reserve_pub.to_string()));
        }

        self.inner
            .db
            .run_write(&[stores::RESERVES, stores::HISTORY], |tx| async move {
                let reserves = tx.object_store(stores::RESERVES)?;
                let mut reserve: ReserveRecord = reserves
                    .get_item(reserve_pub)
                    .await?
                    .ok_or_else(|| WalletError::ReserveNotFound(reserve_pub.to_string()))?;
                if reserve.status == ReserveStatus::Depleted {
                    return Ok(());
                }
                reserve.status = ReserveStatus::Depleted;
                reserves.put_item(&reserve).await?;
                append_history(
                    &tx,
                    HistoryEntry::now(HistoryEvent::DepletedReserve {
                        reserve_pub: reserve_pub.to_string(),
                    }),
                )
                .await
            })
            .await?;
        info!(reserve = %reserve_pub, "reserve depleted");
        Ok(())
    }

    /// Charge the pre-coin's cost to the reserve and store it. Returns
    /// `false` when the reserve no longer has enough unplanned balance.
    async fn store_pre_coin(&self, pre_coin: &PreCoinRecord) -> WalletResult<bool> {
        self.inner
            .db
            .run_write(&[stores::RESERVES, stores::PRECOINS], |tx| async move {
                let reserves = tx.object_store(stores::RESERVES)?;
                let mut reserve: ReserveRecord = reserves
                    .get_item(pre_coin.reserve_pub.as_str())
                    .await?
                    .ok_or_else(|| WalletError::ReserveNotFound(pre_coin.reserve_pub.clone()))?;
                let current = reserve.current_amount.clone().unwrap_or_else(|| {
                    Amount::zero(reserve.requested_amount.currency())
                });
                let Some(rest) = current.sub(&pre_coin.cost)?.checked() else {
                    return Ok(false);
                };
                reserve.current_amount = Some(rest);
                reserve.precoin_amount = reserve
                    .precoin_amount
                    .add(&pre_coin.cost)?
                    .checked()
                    .ok_or_else(|| WalletError::Saturated("planning a pre-coin".into()))?;
                reserves.put_item(&reserve).await?;
                tx.object_store(stores::PRECOINS)?.add_item(pre_coin).await?;
                WalletResult::Ok(true)
            })
            .await
    }

    pub(crate) async fn pre_coins_of(&self, reserve_pub: &str) -> WalletResult<Vec<PreCoinRecord>> {
        self.inner
            .db
            .run_read(&[stores::PRECOINS], |tx| async move {
                let pending = tx
                    .object_store(stores::PRECOINS)?
                    .index(indexes::PRECOINS_BY_RESERVE)?
                    .get_all_items::<PreCoinRecord>(KeyRange::only(reserve_pub), 0)
                    .await?;
                WalletResult::Ok(pending)
            })
            .await
    }

    /// Exchange one pre-coin for a signed coin, retrying transient failures
    /// with the pre-coin backoff policy. A pre-coin that no longer exists
    /// was already processed; every attempt checks this first.
    pub async fn process_pre_coin(&self, coin_pub: &str) -> WalletResult<()> {
        let _guard = self.begin("precoin", coin_pub)?;
        let Some(pre_coin) = self.get_pre_coin(coin_pub).await? else {
            debug!(coin = %coin_pub, "pre-coin already processed");
            return Ok(());
        };

        let policy = self.inner.config.precoin_retry;
        let this = self;
        let pre_coin = &pre_coin;
        let coin = retry(&policy, "withdraw coin", || async move {
            if this.get_pre_coin(coin_pub).await?.is_none() {
                return Ok(None);
            }
            this.withdraw_execute(pre_coin).await.map(Some)
        })
        .await?;
        let Some(coin) = coin else {
            debug!(coin = %coin_pub, "pre-coin removed while withdrawing");
            return Ok(());
        };
        self.store_coin(pre_coin, coin).await
    }

    async fn get_pre_coin(&self, coin_pub: &str) -> WalletResult<Option<PreCoinRecord>> {
        self.inner
            .db
            .run_read(&[stores::PRECOINS], |tx| async move {
                let pc = tx.object_store(stores::PRECOINS)?.get_item(coin_pub).await?;
                WalletResult::Ok(pc)
            })
            .await
    }

    async fn withdraw_execute(&self, pre_coin: &PreCoinRecord) -> WalletResult<CoinRecord> {
        let request = WithdrawRequest {
            denom_pub: pre_coin.denom_pub.clone(),
            reserve_pub: pre_coin.reserve_pub.clone(),
            reserve_sig: pre_coin.withdraw_sig.clone(),
            coin_ev: pre_coin.coin_ev.clone(),
        };
        let url = join_url(&pre_coin.exchange_base_url, "reserve/withdraw");
        let response: WithdrawResponse = post(self.http(), &url, &request).await?.json()?;

        let denom_sig = self
            .crypto()
            .unblind(&response.ev_sig, &pre_coin.blinding_key, &pre_coin.denom_pub)
            .await
            .map_err(|e| WalletError::BadSignature(format!("withdraw answer for {}: {}", pre_coin.coin_pub, e)))?;
        let valid = self
            .crypto()
            .verify_denom_sig(&pre_coin.coin_pub, &denom_sig, &pre_coin.denom_pub)
            .await?;
        if !valid {
            return Err(WalletError::BadSignature(format!(
                "exchange signature on coin {}",
                pre_coin.coin_pub
            )));
        }
        Ok(CoinRecord {
            coin_pub: pre_coin.coin_pub.clone(),
            coin_priv: pre_coin.coin_priv.clone(),
            denom_pub: pre_coin.denom_pub.clone(),
            denom_sig,
            current_amount: pre_coin.coin_value.clone(),
            exchange_base_url: pre_coin.exchange_base_url.clone(),
            reserve_pub: Some(pre_coin.reserve_pub.clone()),
            status: CoinStatus::Fresh,
            suspended: false,
        })
    }

    async fn store_coin(&self, pre_coin: &PreCoinRecord, coin: CoinRecord) -> WalletResult<()> {
        let stored = self
            .inner
            .db
            .run_write(
                &[stores::PRECOINS, stores::COINS, stores::RESERVES, stores::HISTORY],
                |tx| async move {
                    let precoins = tx.object_store(stores::PRECOINS)?;
                    if precoins.get_key(pre_coin.coin_pub.as_str()).await?.is_none() {
                        return Ok(false);
                    }
                    precoins.delete(pre_coin.coin_pub.as_str()).await?;
                    tx.object_store(stores::COINS)?.add_item(&coin).await?;

                    let reserves = tx.object_store(stores::RESERVES)?;
                    let reserve: Option<ReserveRecord> =
                        reserves.get_item(pre_coin.reserve_pub.as_str()).await?;
                    if let Some(mut reserve) = reserve {
                        reserve.precoin_amount = reserve
                            .precoin_amount
                            .sub(&pre_coin.cost)?
                            .checked()
                            .ok_or_else(|| {
                                WalletError::Saturated(format!(
                                    "releasing pre-coin {} from reserve {}",
                                    pre_coin.coin_pub, pre_coin.reserve_pub
                                ))
                            })?;
                        reserves.put_item(&reserve).await?;
                    }
                    append_history(
                        &tx,
                        HistoryEntry::now(HistoryEvent::Withdraw {
                            coin_pub: coin.coin_pub.clone(),
                            value: coin.current_amount.clone(),
                        }),
                    )
                    .await?;
                    WalletResult::Ok(true)
                },
            )
            .await?;
        if stored {
            info!(coin = %pre_coin.coin_pub, value = %pre_coin.coin_value, "coin withdrawn");
        }
        Ok(())
    }

    /// Preview of a withdrawal of `amount` from `exchange_url`, based on its
    /// current `/keys`.
    pub async fn get_reserve_creation_info(
        &self,
        exchange_url: &str,
        amount: &Amount,
    ) -> WalletResult<ReserveCreationInfo> {
        let exchange = self.update_exchange(exchange_url).await?;
        let denoms = self.get_denominations(&exchange.base_url).await?;
        let selected_denoms = get_withdraw_denom_list(amount, &denoms, Utc::now())?;

        let zero = Amount::zero(amount.currency());
        let withdraw_fee = zero.sum(selected_denoms.iter().map(|d| &d.fee_withdraw))?;
        let mut cost = zero;
        for d in &selected_denoms {
            cost = cost.add(&d.withdraw_cost()?)?.amount;
        }
        Ok(ReserveCreationInfo {
            exchange: exchange.base_url,
            withdraw_fee: withdraw_fee
                .checked()
                .ok_or_else(|| WalletError::Saturated("summing withdraw fees".into()))?,
            overhead: amount.sub(&cost)?.amount,
            selected_denoms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::sync::Arc;

    use async_trait::async_trait;
    use chrono::Duration;
    use coffer_store::Factory;

    use crate::config::WalletConfig;
    use crate::crypto::LocalCrypto;
    use crate::error::HttpError;
    use crate::http::{HttpClient, HttpResponse};
    use crate::retry::RetryPolicy;

    /// Exchange that answers every request with 503.
    #[derive(Default)]
    struct Unavailable {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl HttpClient for Unavailable {
        async fn get(&self, url: &str) -> Result<HttpResponse, HttpError> {
            self.calls.fetch_add(1, AtomicOrdering::SeqCst);
            Ok(HttpResponse {
                url: url.to_string(),
                status: 503,
                body: serde_json::Value::Null,
            })
        }

        async fn post_json(&self, url: &str, _body: &serde_json::Value) -> Result<HttpResponse, HttpError> {
            self.get(url).await
        }
    }

    async fn wallet_with(http: Arc<Unavailable>, config: WalletConfig) -> Wallet {
        Wallet::open(&Factory::new(), Arc::new(LocalCrypto::new()), http, config)
            .await
            .unwrap()
    }

    fn pre_coin(coin_pub: &str, reserve_pub: &str, cost: Amount) -> PreCoinRecord {
        PreCoinRecord {
            coin_pub: coin_pub.into(),
            coin_priv: String::new(),
            reserve_pub: reserve_pub.into(),
            exchange_base_url: "https://ex.test/".into(),
            denom_pub: "denom-one".into(),
            blinding_key: String::new(),
            withdraw_sig: String::new(),
            coin_ev: String::new(),
            coin_value: eur(1, 0),
            cost,
        }
    }

    async fn insert_pre_coin(w: &Wallet, pc: &PreCoinRecord) {
        w.db()
            .run_write(&[stores::PRECOINS], |tx| async move {
                tx.object_store(stores::PRECOINS)?.add_item(pc).await?;
                WalletResult::Ok(())
            })
            .await
            .unwrap();
    }

    async fn set_reserve(w: &Wallet, reserve: &ReserveRecord) {
        w.db()
            .run_write(&[stores::RESERVES], |tx| async move {
                tx.object_store(stores::RESERVES)?.put_item(reserve).await?;
                WalletResult::Ok(())
            })
            .await
            .unwrap();
    }

    async fn coin_count(w: &Wallet) -> usize {
        w.db()
            .run_read(&[stores::COINS], |tx| async move {
                let coins = tx
                    .object_store(stores::COINS)?
                    .get_all_items::<CoinRecord>(KeyRange::all(), 0)
                    .await?;
                WalletResult::Ok(coins.len())
            })
            .await
            .unwrap()
    }

    fn eur(value: u64, fraction: u32) -> Amount {
        Amount::new("EUR", value, fraction)
    }

    fn denom(pub_: &str, value: Amount, fee: Amount) -> DenominationRecord {
        let now = Utc::now();
        DenominationRecord {
            exchange_base_url: "https://ex.test/".into(),
            denom_pub: pub_.into(),
            value,
            fee_withdraw: fee,
            fee_deposit: eur(0, 0),
            fee_refresh: eur(0, 0),
            stamp_start: now - Duration::hours(1),
            stamp_expire_withdraw: now + Duration::days(1),
            stamp_expire_deposit: now + Duration::days(30),
            master_sig: String::new(),
            is_offered: true,
        }
    }

    fn pubs(list: &[DenominationRecord]) -> Vec<&str> {
        list.iter().map(|d| d.denom_pub.as_str()).collect()
    }

    #[test]
    fn greedy_selection_never_overspends() {
        let denoms = vec![
            denom("one", eur(1, 0), eur(0, 10_000)),
            denom("five", eur(5, 0), eur(0, 100_000)),
        ];
        let plan = get_withdraw_denom_list(&eur(10, 0), &denoms, Utc::now()).unwrap();
        // 5.10 fits once; a second 5.10 would need 10.20.
        assert_eq!(pubs(&plan), vec!["five", "one", "one", "one", "one"]);

        let mut spent = eur(0, 0);
        for d in &plan {
            spent = spent.add(&d.withdraw_cost().unwrap()).unwrap().amount;
        }
        assert_eq!(spent, eur(9, 140_000));
        assert!(spent.checked_cmp(&eur(10, 0)).unwrap().is_le());
    }

    #[test]
    fn unwithdrawable_and_foreign_denominations_are_ignored() {
        let mut expired = denom("expired", eur(5, 0), eur(0, 0));
        expired.stamp_expire_withdraw = Utc::now() + Duration::seconds(10);
        let foreign = denom("usd", Amount::new("USD", 1, 0), Amount::new("USD", 0, 0));
        let plan = get_withdraw_denom_list(
            &eur(3, 0),
            &[expired, foreign, denom("two", eur(2, 0), eur(0, 0))],
            Utc::now(),
        )
        .unwrap();
        assert_eq!(pubs(&plan), vec!["two"]);
    }

    #[test]
    fn selection_is_capped() {
        let tiny = denom("tiny", eur(0, 1), eur(0, 0));
        let plan = get_withdraw_denom_list(&eur(1_000, 0), &[tiny], Utc::now()).unwrap();
        assert_eq!(plan.len(), WITHDRAW_DENOM_LIMIT);
    }

    #[test]
    fn nothing_fits_yields_an_empty_plan() {
        let plan =
            get_withdraw_denom_list(&eur(0, 500_000), &[denom("one", eur(1, 0), eur(0, 0))], Utc::now())
                .unwrap();
        assert!(plan.is_empty());
    }

    #[tokio::test]
    async fn storing_a_coin_never_drives_precoin_amount_negative() {
        let w = wallet_with(Arc::default(), WalletConfig::default()).await;
        let created = w.create_reserve(eur(5, 0), "ex.test").await.unwrap();
        let pc = pre_coin("coin-a", &created.reserve_pub, eur(1, 10_000));
        insert_pre_coin(&w, &pc).await;

        let coin = CoinRecord {
            coin_pub: pc.coin_pub.clone(),
            coin_priv: String::new(),
            denom_pub: pc.denom_pub.clone(),
            denom_sig: String::new(),
            current_amount: pc.coin_value.clone(),
            exchange_base_url: pc.exchange_base_url.clone(),
            reserve_pub: Some(pc.reserve_pub.clone()),
            status: CoinStatus::Fresh,
            suspended: false,
        };
        let err = w.store_coin(&pc, coin).await.unwrap_err();
        assert!(matches!(err, WalletError::Saturated(_)), "{err}");

        assert!(w.get_pre_coin("coin-a").await.unwrap().is_some());
        assert_eq!(coin_count(&w).await, 0);
        let reserve = w.get_reserve(&created.reserve_pub).await.unwrap();
        assert!(reserve.precoin_amount.is_zero());
    }

    #[tokio::test]
    async fn depletion_waits_for_pre_coins_held_elsewhere() {
        let w = wallet_with(Arc::default(), WalletConfig::default()).await;
        let created = w.create_reserve(eur(5, 0), "ex.test").await.unwrap();
        let mut reserve = w.get_reserve(&created.reserve_pub).await.unwrap();
        reserve.status = ReserveStatus::Withdrawing;
        reserve.current_amount = Some(eur(0, 0));
        reserve.precoin_amount = eur(1, 0);
        set_reserve(&w, &reserve).await;
        insert_pre_coin(&w, &pre_coin("coin-b", &created.reserve_pub, eur(1, 0))).await;

        let held = w.begin("precoin", "coin-b").unwrap();
        let err = w.deplete_reserve(&created.reserve_pub).await.unwrap_err();
        assert!(matches!(err, WalletError::WithdrawalPending(_)), "{err}");
        assert!(err.is_transient());
        drop(held);

        let reserve = w.get_reserve(&created.reserve_pub).await.unwrap();
        assert_eq!(reserve.status, ReserveStatus::Withdrawing);
    }

    #[tokio::test]
    async fn withdraw_retries_stop_once_the_pre_coin_is_gone() {
        let http = Arc::new(Unavailable::default());
        let config = WalletConfig {
            precoin_retry: RetryPolicy::new(
                std::time::Duration::from_millis(5),
                1,
                std::time::Duration::from_millis(5),
            )
            .with_max_attempts(500),
            ..WalletConfig::default()
        };
        let w = wallet_with(Arc::clone(&http), config).await;
        let created = w.create_reserve(eur(5, 0), "ex.test").await.unwrap();
        insert_pre_coin(&w, &pre_coin("coin-c", &created.reserve_pub, eur(1, 0))).await;

        let worker = w.clone();
        let task = tokio::spawn(async move { worker.process_pre_coin("coin-c").await });
        while http.calls.load(AtomicOrdering::SeqCst) < 2 {
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        }
        w.db()
            .run_write(&[stores::PRECOINS], |tx| async move {
                tx.object_store(stores::PRECOINS)?.delete("coin-c").await?;
                WalletResult::Ok(())
            })
            .await
            .unwrap();

        tokio::time::timeout(std::time::Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(http.calls.load(AtomicOrdering::SeqCst) < 10);
        assert_eq!(coin_count(&w).await, 0);
    }
}
