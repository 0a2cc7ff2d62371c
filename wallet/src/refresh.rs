//! # Refresh (Melt and Reveal)
//!
//! Refreshing turns what is left of a coin into fresh coins the merchant
//! never saw. The session goes through two exchange round-trips:
//!
//! ```text
//!   unmelted ──POST /refresh/melt──▶ melted (noreveal_index) ──POST /refresh/reveal──▶ finished
//! ```
//!
//! The wallet commits to `kappa` candidate sets of new coins. The exchange
//! picks one set (`noreveal_index`) that stays secret; the wallet reveals
//! the transfer keys of every other set so the exchange can check them, and
//! gets blind signatures for the hidden set in return.
//!
//! Sessions are stored before the melt, so an interrupted refresh resumes
//! where it stopped. The melted coin turns dormant as soon as the session
//! is recorded.

use chrono::Utc;
use coffer_store::KeyRange;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::amounts::Amount;
use crate::crypto::create_refresh_session;
use crate::db::{append_history, indexes, stores};
use crate::error::{WalletError, WalletResult};
use crate::http::{join_url, post};
use crate::records::{
    CoinRecord, CoinStatus, HistoryEntry, HistoryEvent, RefreshSessionRecord,
};
use crate::retry::retry;
use crate::wallet::Wallet;
use crate::withdraw::get_withdraw_denom_list;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeltRequest {
    pub coin_pub: String,
    pub denom_pub: String,
    pub denom_sig: String,
    pub confirm_sig: String,
    /// Session commitment.
    pub rc: String,
    pub value_with_fee: Amount,
    pub transfer_pubs: Vec<String>,
    pub new_denoms: Vec<String>,
    /// `coin_evs[gamma][i]`: envelope of candidate `i` in set `gamma`.
    pub coin_evs: Vec<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeltResponse {
    pub noreveal_index: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevealRequest {
    pub rc: String,
    pub noreveal_index: usize,
    /// Transfer private keys of every set except `noreveal_index`, in set
    /// order.
    pub transfer_privs: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvSig {
    pub ev_sig: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevealResponse {
    pub ev_sigs: Vec<EvSig>,
}

impl Wallet {
    /// Refresh a coin. Returns the session id, or `None` when the coin is
    /// worth too little to yield any new coin, in which case it is marked
    /// dormant. An unfinished session of the coin is resumed instead of
    /// starting a new one.
    pub async fn refresh(&self, coin_pub: &str) -> WalletResult<Option<String>> {
        let _guard = self.begin("coin", coin_pub)?;

        if let Some(session) = self.unfinished_session_of(coin_pub).await? {
            debug!(coin = %coin_pub, session = %session.session_id, "resuming refresh");
            let id = session.session_id.clone();
            self.continue_refresh(session).await?;
            return Ok(Some(id));
        }

        let coin = self.get_coin(coin_pub).await?;
        if coin.status == CoinStatus::Dormant || coin.current_amount.is_zero() {
            debug!(coin = %coin_pub, "nothing left to refresh");
            return Ok(None);
        }
        let denom = self
            .get_denomination(&coin.exchange_base_url, &coin.denom_pub)
            .await?;
        let Some(available) = coin.current_amount.sub(&denom.fee_refresh)?.checked() else {
            self.retire_coin(&coin).await?;
            return Ok(None);
        };
        let offered = self.get_denominations(&coin.exchange_base_url).await?;
        let new_denoms = get_withdraw_denom_list(&available, &offered, Utc::now())?;
        if new_denoms.is_empty() {
            self.retire_coin(&coin).await?;
            return Ok(None);
        }

        let session = create_refresh_session(
            self.crypto(),
            &coin.exchange_base_url,
            self.inner.config.kappa,
            &coin,
            &new_denoms,
            &denom.fee_refresh,
        )
        .await?;

        let coin_ref = &coin;
        let session_ref = &session;
        self.inner
            .db
            .run_write(
                &[stores::COINS, stores::REFRESH, stores::HISTORY],
                |tx| async move {
                    let coins = tx.object_store(stores::COINS)?;
                    let stored: Option<CoinRecord> = coins.get_item(coin_ref.coin_pub.as_str()).await?;
                    if stored.as_ref() != Some(coin_ref) {
                        return Err(WalletError::InvalidState(format!(
                            "coin {} changed while preparing a refresh",
                            coin_ref.coin_pub
                        )));
                    }
                    let mut melted = coin_ref.clone();
                    melted.current_amount = melted
                        .current_amount
                        .sub(&session_ref.value_with_fee)?
                        .checked()
                        .ok_or_else(|| WalletError::Saturated("melting a coin".into()))?;
                    melted.status = CoinStatus::Dormant;
                    coins.put_item(&melted).await?;
                    tx.object_store(stores::REFRESH)?.add_item(session_ref).await?;
                    append_history(
                        &tx,
                        HistoryEntry::now(HistoryEvent::Refresh {
                            session_id: session_ref.session_id.clone(),
                            melt_coin_pub: coin_ref.coin_pub.clone(),
                            value_with_fee: session_ref.value_with_fee.clone(),
                        }),
                    )
                    .await
                },
            )
            .await?;
        info!(
            coin = %coin_pub,
            session = %session.session_id,
            new_coins = session.new_denoms.len(),
            value_with_fee = %session.value_with_fee,
            "refresh session created"
        );

        let id = session.session_id.clone();
        self.continue_refresh(session).await?;
        Ok(Some(id))
    }

    /// Refresh every dirty coin. Returns the ids of the sessions that ran.
    pub async fn refresh_dirty_coins(&self) -> WalletResult<Vec<String>> {
        let dirty: Vec<CoinRecord> = self
            .all_coins()
            .await?
            .into_iter()
            .filter(|c| c.status == CoinStatus::Dirty && !c.current_amount.is_zero())
            .collect();
        let mut sessions = Vec::new();
        for coin in dirty {
            if let Some(id) = self.refresh(&coin.coin_pub).await? {
                sessions.push(id);
            }
        }
        Ok(sessions)
    }

    /// Finish an unfinished session by id.
    pub async fn resume_refresh(&self, session_id: &str) -> WalletResult<()> {
        let session = self.get_refresh_session(session_id).await?;
        let _guard = self.begin("coin", &session.melt_coin_pub)?;
        self.continue_refresh(session).await
    }

    async fn continue_refresh(&self, mut session: RefreshSessionRecord) -> WalletResult<()> {
        if session.finished {
            return Ok(());
        }
        let policy = self.inner.config.precoin_retry;
        if !session.is_melted() {
            let index = retry(&policy, "melt", || self.melt(&session)).await?;
            session = self.record_noreveal_index(&session.session_id, index).await?;
        }
        let coins = retry(&policy, "reveal", || self.reveal(&session)).await?;
        self.store_refreshed_coins(&session.session_id, coins).await
    }

    async fn melt(&self, session: &RefreshSessionRecord) -> WalletResult<usize> {
        let coin = self.get_coin(&session.melt_coin_pub).await?;
        let request = MeltRequest {
            coin_pub: coin.coin_pub.clone(),
            denom_pub: coin.denom_pub.clone(),
            denom_sig: coin.denom_sig.clone(),
            confirm_sig: session.confirm_sig.clone(),
            rc: session.session_hash.clone(),
            value_with_fee: session.value_with_fee.clone(),
            transfer_pubs: session.transfer_pubs.clone(),
            new_denoms: session.new_denoms.clone(),
            coin_evs: session
                .planchets
                .iter()
                .map(|set| set.iter().map(|p| p.coin_ev.clone()).collect())
                .collect(),
        };
        let url = join_url(&session.exchange_base_url, "refresh/melt");
        let response: MeltResponse = post(self.http(), &url, &request).await?.json()?;
        if response.noreveal_index >= session.transfer_pubs.len() {
            return Err(WalletError::Protocol(format!(
                "noreveal index {} out of range",
                response.noreveal_index
            )));
        }
        debug!(session = %session.session_id, noreveal_index = response.noreveal_index, "coin melted");
        Ok(response.noreveal_index)
    }

    async fn record_noreveal_index(&self, session_id: &str, index: usize) -> WalletResult<RefreshSessionRecord> {
        self.inner
            .db
            .run_write(&[stores::REFRESH], |tx| async move {
                let sessions = tx.object_store(stores::REFRESH)?;
                let mut session: RefreshSessionRecord = sessions
                    .get_item(session_id)
                    .await?
                    .ok_or_else(|| WalletError::RefreshSessionNotFound(session_id.to_string()))?;
                match session.noreveal_index {
                    Some(existing) if existing != index => {
                        return Err(WalletError::Protocol(format!(
                            "exchange changed its noreveal index from {} to {}",
                            existing, index
                        )))
                    }
                    Some(_) => {}
                    None => {
                        session.noreveal_index = Some(index);
                        sessions.put_item(&session).await?;
                    }
                }
                WalletResult::Ok(session)
            })
            .await
    }

    async fn reveal(&self, session: &RefreshSessionRecord) -> WalletResult<Vec<CoinRecord>> {
        let noreveal = session
            .noreveal_index
            .ok_or_else(|| WalletError::InvalidState("revealing an unmelted session".into()))?;
        let hidden = session
            .planchets
            .get(noreveal)
            .ok_or_else(|| WalletError::InvalidState("noreveal index out of range".into()))?;
        let request = RevealRequest {
            rc: session.session_hash.clone(),
            noreveal_index: noreveal,
            transfer_privs: session
                .transfer_privs
                .iter()
                .enumerate()
                .filter(|(gamma, _)| *gamma != noreveal)
                .map(|(_, p)| p.clone())
                .collect(),
        };
        let url = join_url(&session.exchange_base_url, "refresh/reveal");
        let response: RevealResponse = post(self.http(), &url, &request).await?.json()?;
        if response.ev_sigs.len() != hidden.len() {
            return Err(WalletError::Protocol(format!(
                "expected {} signatures, got {}",
                hidden.len(),
                response.ev_sigs.len()
            )));
        }

        let mut coins = Vec::with_capacity(hidden.len());
        for ((planchet, denom_pub), sig) in hidden.iter().zip(&session.new_denoms).zip(&response.ev_sigs) {
            let denom_sig = self
                .crypto()
                .unblind(&sig.ev_sig, &planchet.blinding_key, denom_pub)
                .await
                .map_err(|e| WalletError::BadSignature(format!("reveal answer: {}", e)))?;
            if !self
                .crypto()
                .verify_denom_sig(&planchet.coin_pub, &denom_sig, denom_pub)
                .await?
            {
                return Err(WalletError::BadSignature(format!(
                    "exchange signature on refreshed coin {}",
                    planchet.coin_pub
                )));
            }
            let denom = self.get_denomination(&session.exchange_base_url, denom_pub).await?;
            coins.push(CoinRecord {
                coin_pub: planchet.coin_pub.clone(),
                coin_priv: planchet.coin_priv.clone(),
                denom_pub: denom_pub.clone(),
                denom_sig,
                current_amount: denom.value,
                exchange_base_url: session.exchange_base_url.clone(),
                reserve_pub: None,
                status: CoinStatus::Fresh,
                suspended: false,
            });
        }
        Ok(coins)
    }

    async fn store_refreshed_coins(&self, session_id: &str, coins: Vec<CoinRecord>) -> WalletResult<()> {
        let count = coins.len();
        let stored = self
            .inner
            .db
            .run_write(
                &[stores::COINS, stores::REFRESH, stores::HISTORY],
                |tx| async move {
                    let sessions = tx.object_store(stores::REFRESH)?;
                    let mut session: RefreshSessionRecord = sessions
                        .get_item(session_id)
                        .await?
                        .ok_or_else(|| WalletError::RefreshSessionNotFound(session_id.to_string()))?;
                    if session.finished {
                        return Ok(false);
                    }
                    let store = tx.object_store(stores::COINS)?;
                    for coin in &coins {
                        store.add_item(coin).await?;
                    }
                    session.finished = true;
                    sessions.put_item(&session).await?;
                    append_history(
                        &tx,
                        HistoryEntry::now(HistoryEvent::RefreshRevealed {
                            session_id: session_id.to_string(),
                            new_coins: coins.len(),
                        }),
                    )
                    .await?;
                    WalletResult::Ok(true)
                },
            )
            .await?;
        if stored {
            info!(session = %session_id, new_coins = count, "refresh finished");
        }
        Ok(())
    }

    /// Mark a coin too small to refresh as dormant.
    async fn retire_coin(&self, coin: &CoinRecord) -> WalletResult<()> {
        self.inner
            .db
            .run_write(&[stores::COINS], |tx| async move {
                let coins = tx.object_store(stores::COINS)?;
                let stored: Option<CoinRecord> = coins.get_item(coin.coin_pub.as_str()).await?;
                if let Some(mut stored) = stored {
                    stored.status = CoinStatus::Dormant;
                    coins.put_item(&stored).await?;
                }
                WalletResult::Ok(())
            })
            .await?;
        info!(coin = %coin.coin_pub, remaining = %coin.current_amount, "coin too small to refresh, retired");
        Ok(())
    }

    async fn unfinished_session_of(&self, coin_pub: &str) -> WalletResult<Option<RefreshSessionRecord>> {
        let sessions: Vec<RefreshSessionRecord> = self
            .inner
            .db
            .run_read(&[stores::REFRESH], |tx| async move {
                let all = tx
                    .object_store(stores::REFRESH)?
                    .index(indexes::REFRESH_BY_COIN)?
                    .get_all_items::<RefreshSessionRecord>(KeyRange::only(coin_pub), 0)
                    .await?;
                WalletResult::Ok(all)
            })
            .await?;
        Ok(sessions.into_iter().find(|s| !s.finished))
    }

    pub async fn get_refresh_session(&self, session_id: &str) -> WalletResult<RefreshSessionRecord> {
        let found: Option<RefreshSessionRecord> = self
            .inner
            .db
            .run_read(&[stores::REFRESH], |tx| async move {
                let s = tx.object_store(stores::REFRESH)?.get_item(session_id).await?;
                WalletResult::Ok(s)
            })
            .await?;
        found.ok_or_else(|| WalletError::RefreshSessionNotFound(session_id.to_string()))
    }

    pub async fn get_coin(&self, coin_pub: &str) -> WalletResult<CoinRecord> {
        let found: Option<CoinRecord> = self
            .inner
            .db
            .run_read(&[stores::COINS], |tx| async move {
                let c = tx.object_store(stores::COINS)?.get_item(coin_pub).await?;
                WalletResult::Ok(c)
            })
            .await?;
        found.ok_or_else(|| WalletError::CoinNotFound(coin_pub.to_string()))
    }

    pub async fn all_coins(&self) -> WalletResult<Vec<CoinRecord>> {
        self.inner
            .db
            .run_read(&[stores::COINS], |tx| async move {
                let all = tx
                    .object_store(stores::COINS)?
                    .get_all_items::<CoinRecord>(KeyRange::all(), 0)
                    .await?;
                WalletResult::Ok(all)
            })
            .await
    }
}
