//! End-to-end tests for the wallet against an in-process exchange.
//!
//! `FakeExchange` implements the HTTP collaborator and plays the exchange
//! side of every protocol step: it lists signed denominations, keeps
//! reserve balances, blind-signs withdrawals and runs the melt/reveal
//! check. Knobs on its state inject transient failures and forged
//! signatures.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;

use coffer_store::Factory;
use coffer_wallet::crypto::{
    denomination_message, deposit_message, derive_refresh_planchets, melt_message, withdraw_message,
};
use coffer_wallet::refresh::{EvSig, MeltRequest, MeltResponse, RevealRequest, RevealResponse};
use coffer_wallet::withdraw::{ReserveStatusResponse, WithdrawRequest, WithdrawResponse};
use coffer_wallet::{
    hash_contract, Amount, CoinStatus, Contract, CryptoApi, DenominationInfo, ExchangeHandle,
    HistoryEvent, HttpClient, HttpError, HttpResponse, KeyPair, KeysResponse, LocalCrypto, Merchant,
    Offer, PendingOperation, ReserveStatus, RetryPolicy, Wallet, WalletConfig, WalletError,
};

const BASE: &str = "https://exchange.test/";

// ---------------------------------------------------------------------------
// Fake Exchange
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ExchangeState {
    reserves: HashMap<String, Amount>,
    /// Withdrawals answered with 503 before one succeeds.
    failing_withdrawals: u32,
    withdraw_calls: u32,
    /// Sign withdrawals with the wrong key.
    forge_signatures: bool,
    /// Announce a different master key in `/keys`.
    rotate_master_key: bool,
    /// Break the master signature of the first denomination.
    corrupt_denomination: bool,
    melted: HashMap<String, MeltRequest>,
}

struct FakeExchange {
    crypto: LocalCrypto,
    master: KeyPair,
    other_master: KeyPair,
    denoms: Vec<(DenominationInfo, KeyPair)>,
    state: Mutex<ExchangeState>,
}

/// `(value, fee)` with the same fee for withdraw, deposit and refresh.
fn denom_fees(value: &str, fee: &str) -> (Amount, Amount) {
    (value.parse().unwrap(), fee.parse().unwrap())
}

impl FakeExchange {
    async fn new(specs: &[(Amount, Amount)]) -> Arc<Self> {
        let crypto = LocalCrypto::new();
        let master = crypto.create_keypair().await.unwrap();
        let other_master = crypto.create_keypair().await.unwrap();
        let now = Utc::now();
        let mut denoms = Vec::new();
        for (value, fee) in specs {
            let key = crypto.create_keypair().await.unwrap();
            let mut info = DenominationInfo {
                denom_pub: key.public.clone(),
                value: value.clone(),
                fee_withdraw: fee.clone(),
                fee_deposit: fee.clone(),
                fee_refresh: fee.clone(),
                stamp_start: now - chrono::Duration::hours(1),
                stamp_expire_withdraw: now + chrono::Duration::days(7),
                stamp_expire_deposit: now + chrono::Duration::days(30),
                master_sig: String::new(),
            };
            let message = denomination_message(&info.clone().into_record(BASE));
            info.master_sig = crypto.sign(&master.private, &message).await.unwrap();
            denoms.push((info, key));
        }
        Arc::new(Self {
            crypto,
            master,
            other_master,
            denoms,
            state: Mutex::new(ExchangeState::default()),
        })
    }

    fn fund(&self, reserve_pub: &str, amount: &str) {
        self.state
            .lock()
            .reserves
            .insert(reserve_pub.to_string(), amount.parse().unwrap());
    }

    fn denom(&self, denom_pub: &str) -> Option<&(DenominationInfo, KeyPair)> {
        self.denoms.iter().find(|(d, _)| d.denom_pub == denom_pub)
    }

    fn keys(&self) -> KeysResponse {
        let state = self.state.lock();
        let mut denoms: Vec<DenominationInfo> = self.denoms.iter().map(|(d, _)| d.clone()).collect();
        if state.corrupt_denomination {
            denoms[0].master_sig = denoms[1].master_sig.clone();
        }
        let master = if state.rotate_master_key {
            &self.other_master
        } else {
            &self.master
        };
        KeysResponse {
            master_public_key: master.public.clone(),
            denoms,
        }
    }

    async fn withdraw(&self, req: WithdrawRequest) -> (u16, serde_json::Value) {
        let Some((denom, key)) = self.denom(&req.denom_pub) else {
            return error(404, "unknown denomination");
        };
        let cost = denom.value.add(&denom.fee_withdraw).unwrap().amount;
        let message = withdraw_message(&req.reserve_pub, &req.denom_pub, &req.coin_ev, &cost);
        if !self
            .crypto
            .verify(&req.reserve_pub, &message, &req.reserve_sig)
            .await
            .unwrap_or(false)
        {
            return error(401, "bad reserve signature");
        }
        let forge = {
            let mut state = self.state.lock();
            state.withdraw_calls += 1;
            if state.failing_withdrawals > 0 {
                state.failing_withdrawals -= 1;
                return error(503, "try again");
            }
            let Some(balance) = state.reserves.get(&req.reserve_pub).cloned() else {
                return error(404, "unknown reserve");
            };
            let Some(rest) = balance.sub(&cost).unwrap().checked() else {
                return error(409, "insufficient funds");
            };
            state.reserves.insert(req.reserve_pub.clone(), rest);
            state.forge_signatures
        };
        let signer = if forge { &self.master } else { key };
        let ev = hex::decode(&req.coin_ev).unwrap();
        let ev_sig = self.crypto.sign(&signer.private, &ev).await.unwrap();
        ok(WithdrawResponse { ev_sig })
    }

    async fn melt(&self, req: MeltRequest) -> (u16, serde_json::Value) {
        let confirm = melt_message(&req.rc, &req.coin_pub, &req.value_with_fee);
        if !self
            .crypto
            .verify(&req.coin_pub, &confirm, &req.confirm_sig)
            .await
            .unwrap_or(false)
        {
            return error(401, "bad melt signature");
        }
        if !self
            .crypto
            .verify_denom_sig(&req.coin_pub, &req.denom_sig, &req.denom_pub)
            .await
            .unwrap_or(false)
        {
            return error(401, "coin not signed by the exchange");
        }
        let noreveal_index = 1 % req.transfer_pubs.len();
        self.state.lock().melted.insert(req.rc.clone(), req);
        ok(MeltResponse { noreveal_index })
    }

    async fn reveal(&self, req: RevealRequest) -> (u16, serde_json::Value) {
        let Some(melt) = self.state.lock().melted.get(&req.rc).cloned() else {
            return error(404, "unknown session");
        };
        let revealed: Vec<usize> = (0..melt.transfer_pubs.len())
            .filter(|g| *g != req.noreveal_index)
            .collect();
        if revealed.len() != req.transfer_privs.len() {
            return error(400, "wrong number of transfer keys");
        }
        for (gamma, transfer_priv) in revealed.into_iter().zip(&req.transfer_privs) {
            let seed: [u8; 32] = hex::decode(transfer_priv).unwrap().try_into().unwrap();
            let transfer = self.crypto.keypair_from_seed(seed).await.unwrap();
            if transfer.public != melt.transfer_pubs[gamma] {
                return error(400, "transfer key does not match the commitment");
            }
            let planchets = derive_refresh_planchets(&self.crypto, transfer_priv, &melt.coin_pub, &melt.new_denoms)
                .await
                .unwrap();
            let evs: Vec<String> = planchets.into_iter().map(|p| p.coin_ev).collect();
            if evs != melt.coin_evs[gamma] {
                return error(400, "revealed coins do not match the commitment");
            }
        }
        let mut ev_sigs = Vec::new();
        for (coin_ev, denom_pub) in melt.coin_evs[req.noreveal_index].iter().zip(&melt.new_denoms) {
            let Some((_, key)) = self.denom(denom_pub) else {
                return error(404, "unknown denomination");
            };
            let ev = hex::decode(coin_ev).unwrap();
            ev_sigs.push(EvSig {
                ev_sig: self.crypto.sign(&key.private, &ev).await.unwrap(),
            });
        }
        ok(RevealResponse { ev_sigs })
    }
}

fn ok<T: Serialize>(body: T) -> (u16, serde_json::Value) {
    (200, serde_json::to_value(body).unwrap())
}

fn error(status: u16, hint: &str) -> (u16, serde_json::Value) {
    (status, serde_json::json!({ "hint": hint }))
}

fn decode<T: serde::de::DeserializeOwned>(body: &serde_json::Value) -> T {
    serde_json::from_value(body.clone()).unwrap()
}

#[async_trait]
impl HttpClient for FakeExchange {
    async fn get(&self, url: &str) -> Result<HttpResponse, HttpError> {
        let path = url.strip_prefix(BASE).ok_or_else(|| HttpError::Network {
            url: url.to_string(),
            reason: "unknown host".into(),
        })?;
        let (status, body) = if path == "keys" {
            ok(self.keys())
        } else if let Some(reserve_pub) = path.strip_prefix("reserve/status?reserve_pub=") {
            match self.state.lock().reserves.get(reserve_pub) {
                Some(balance) => ok(ReserveStatusResponse {
                    balance: balance.clone(),
                }),
                None => error(404, "unknown reserve"),
            }
        } else {
            error(404, "no such endpoint")
        };
        Ok(HttpResponse {
            url: url.to_string(),
            status,
            body,
        })
    }

    async fn post_json(&self, url: &str, body: &serde_json::Value) -> Result<HttpResponse, HttpError> {
        let path = url.strip_prefix(BASE).unwrap_or_default();
        let (status, body) = match path {
            "reserve/withdraw" => self.withdraw(decode(body)).await,
            "refresh/melt" => self.melt(decode(body)).await,
            "refresh/reveal" => self.reveal(decode(body)).await,
            _ => error(404, "no such endpoint"),
        };
        Ok(HttpResponse {
            url: url.to_string(),
            status,
            body,
        })
    }
}

// ---------------------------------------------------------------------------
// Test Helpers
// ---------------------------------------------------------------------------

fn eur(s: &str) -> Amount {
    format!("EUR:{}", s).parse().unwrap()
}

fn fast_retries() -> RetryPolicy {
    RetryPolicy::new(Duration::from_millis(1), 2, Duration::from_millis(5))
}

async fn wallet_with(exchange: &Arc<FakeExchange>, config: WalletConfig) -> Wallet {
    let http: Arc<dyn HttpClient> = exchange.clone();
    Wallet::open(&Factory::new(), Arc::new(LocalCrypto::new()), http, config)
        .await
        .unwrap()
}

async fn wallet(exchange: &Arc<FakeExchange>) -> Wallet {
    wallet_with(
        exchange,
        WalletConfig {
            precoin_retry: fast_retries(),
            reserve_retry: fast_retries(),
            ..WalletConfig::default()
        },
    )
    .await
}

/// The two-denomination exchange: 5.00 (fee 0.10) and 1.00 (fee 0.01).
async fn standard_exchange() -> Arc<FakeExchange> {
    FakeExchange::new(&[denom_fees("EUR:5", "EUR:0.10"), denom_fees("EUR:1", "EUR:0.01")]).await
}

/// Create, fund and confirm a reserve, then wait for the withdrawal.
async fn withdraw(w: &Wallet, exchange: &FakeExchange, amount: &str) -> String {
    let created = w.create_reserve(eur(amount), "exchange.test").await.unwrap();
    assert_eq!(created.exchange, BASE);
    exchange.fund(&created.reserve_pub, &format!("EUR:{}", amount));
    w.confirm_reserve(&created.reserve_pub).await.unwrap();
    w.wait_for_background_tasks().await;
    created.reserve_pub
}

async fn offer(exchange: &FakeExchange, amount: &str, max_fee: &str) -> Offer {
    let crypto = LocalCrypto::new();
    let merchant = crypto.create_keypair().await.unwrap();
    let contract = Contract {
        order_id: format!("order-{}", amount),
        amount: eur(amount),
        max_fee: eur(max_fee),
        merchant: Merchant {
            name: "Corner Shop".into(),
        },
        merchant_pub: merchant.public.clone(),
        exchanges: vec![ExchangeHandle {
            url: BASE.into(),
            master_pub: exchange.master.public.clone(),
        }],
        fulfillment_url: "https://shop.test/fulfilled".into(),
        timestamp: Utc::now(),
        refund_deadline: Utc::now() + chrono::Duration::days(14),
        summary: Some("a coffee".into()),
    };
    let contract_hash = hash_contract(&contract).unwrap();
    let merchant_sig = crypto
        .sign(&merchant.private, contract_hash.as_bytes())
        .await
        .unwrap();
    Offer {
        contract,
        merchant_sig,
        contract_hash,
    }
}

async fn coin_values(w: &Wallet, status: CoinStatus) -> Vec<Amount> {
    let mut values: Vec<Amount> = w
        .all_coins()
        .await
        .unwrap()
        .into_iter()
        .filter(|c| c.status == status)
        .map(|c| c.current_amount)
        .collect();
    values.sort_by(|a, b| a.checked_cmp(b).unwrap());
    values
}

fn history_types(events: &[coffer_wallet::HistoryEntry]) -> Vec<String> {
    events
        .iter()
        .map(|e| serde_json::to_value(&e.event).unwrap()["type"].as_str().unwrap().to_string())
        .collect()
}

// ---------------------------------------------------------------------------
// Withdrawal
// ---------------------------------------------------------------------------

#[tokio::test]
async fn withdrawal_depletes_reserve_without_overspending() {
    let exchange = standard_exchange().await;
    let w = wallet(&exchange).await;
    let reserve_pub = withdraw(&w, &exchange, "10").await;

    // 5.10 once, then 1.01 four times: 9.14 of 10.00.
    assert_eq!(
        coin_values(&w, CoinStatus::Fresh).await,
        vec![eur("1"), eur("1"), eur("1"), eur("1"), eur("5")]
    );

    let reserve = w.get_reserve(&reserve_pub).await.unwrap();
    assert_eq!(reserve.status, ReserveStatus::Depleted);
    assert_eq!(reserve.current_amount, Some(eur("0.86")));
    assert!(reserve.precoin_amount.is_zero());

    let spent = exchange.state.lock().reserves[&reserve_pub].clone();
    assert_eq!(spent, eur("0.86"));

    let balances = w.get_balances().await.unwrap();
    assert_eq!(balances["EUR"].available, eur("9"));
    assert!(balances["EUR"].pending_incoming.is_zero());

    let history = w.get_history().await.unwrap();
    let types = history_types(&history);
    assert_eq!(types.first().map(String::as_str), Some("create-reserve"));
    assert_eq!(types[1], "confirm-reserve");
    assert_eq!(types[2], "reserve-update");
    assert_eq!(types.iter().filter(|t| *t == "withdraw").count(), 5);
    assert_eq!(types.last().map(String::as_str), Some("depleted-reserve"));
    assert!(w.pending_operations().await.unwrap().is_empty());
}

#[tokio::test]
async fn creation_info_previews_the_plan() {
    let exchange = standard_exchange().await;
    let w = wallet(&exchange).await;
    let info = w.get_reserve_creation_info(BASE, &eur("10")).await.unwrap();
    assert_eq!(info.exchange, BASE);
    assert_eq!(info.selected_denoms.len(), 5);
    assert_eq!(info.withdraw_fee, eur("0.14"));
    assert_eq!(info.overhead, eur("0.86"));
}

#[tokio::test]
async fn transient_withdraw_failures_are_retried() {
    let exchange = standard_exchange().await;
    exchange.state.lock().failing_withdrawals = 3;
    let w = wallet(&exchange).await;
    let reserve_pub = withdraw(&w, &exchange, "10").await;

    assert_eq!(coin_values(&w, CoinStatus::Fresh).await.len(), 5);
    assert_eq!(exchange.state.lock().withdraw_calls, 8);
    assert_eq!(
        w.get_reserve(&reserve_pub).await.unwrap().status,
        ReserveStatus::Depleted
    );
}

#[tokio::test]
async fn unknown_reserve_stays_confirmed() {
    let exchange = standard_exchange().await;
    let w = wallet_with(
        &exchange,
        WalletConfig {
            precoin_retry: fast_retries(),
            reserve_retry: fast_retries().with_max_attempts(3),
            ..WalletConfig::default()
        },
    )
    .await;
    let created = w.create_reserve(eur("10"), BASE).await.unwrap();
    w.confirm_reserve(&created.reserve_pub).await.unwrap();
    w.wait_for_background_tasks().await;

    let reserve = w.get_reserve(&created.reserve_pub).await.unwrap();
    assert_eq!(reserve.status, ReserveStatus::Confirmed);
    assert!(reserve.current_amount.is_none());

    let pending = w.pending_operations().await.unwrap();
    assert!(matches!(
        pending.as_slice(),
        [PendingOperation::Reserve { status: ReserveStatus::Confirmed, .. }]
    ));
    assert_eq!(w.get_balances().await.unwrap()["EUR"].pending_incoming, eur("10"));

    // Once the transfer arrives, resuming finishes the job.
    exchange.fund(&created.reserve_pub, "EUR:10");
    assert_eq!(w.resume_pending_reserves().await.unwrap(), 1);
    w.wait_for_background_tasks().await;
    assert_eq!(coin_values(&w, CoinStatus::Fresh).await.len(), 5);
}

#[tokio::test]
async fn forged_signatures_leave_pre_coins_pending() {
    let exchange = standard_exchange().await;
    exchange.state.lock().forge_signatures = true;
    let w = wallet(&exchange).await;
    let reserve_pub = withdraw(&w, &exchange, "10").await;

    assert!(w.all_coins().await.unwrap().is_empty());
    let reserve = w.get_reserve(&reserve_pub).await.unwrap();
    assert_eq!(reserve.status, ReserveStatus::Withdrawing);
    assert_eq!(reserve.precoin_amount, eur("9.14"));
    assert_eq!(reserve.current_amount, Some(eur("0.86")));

    let pending = w.pending_operations().await.unwrap();
    let pre_coins = pending
        .iter()
        .filter(|p| matches!(p, PendingOperation::PreCoin { .. }))
        .count();
    assert_eq!(pre_coins, 5);
    assert_eq!(w.get_balances().await.unwrap()["EUR"].pending_incoming, eur("9.86"));
}

#[tokio::test]
async fn unconfirmed_reserves_cannot_be_processed() {
    let exchange = standard_exchange().await;
    let w = wallet(&exchange).await;
    let created = w.create_reserve(eur("3"), BASE).await.unwrap();
    assert!(matches!(
        w.process_reserve(&created.reserve_pub).await,
        Err(WalletError::InvalidState(_))
    ));
    assert!(matches!(
        w.confirm_reserve("no-such-reserve").await,
        Err(WalletError::ReserveNotFound(_))
    ));
}

// ---------------------------------------------------------------------------
// Exchanges
// ---------------------------------------------------------------------------

#[tokio::test]
async fn exchange_keys_are_verified() {
    let exchange = standard_exchange().await;
    let w = wallet(&exchange).await;

    exchange.state.lock().corrupt_denomination = true;
    assert!(matches!(
        w.update_exchange(BASE).await,
        Err(WalletError::BadSignature(_))
    ));
    assert!(w.get_exchange(BASE).await.unwrap().is_none());

    exchange.state.lock().corrupt_denomination = false;
    let record = w.update_exchange("https://Exchange.test").await.unwrap();
    assert_eq!(record.base_url, BASE);
    assert_eq!(record.master_pub, exchange.master.public);
    assert_eq!(w.get_denominations(BASE).await.unwrap().len(), 2);

    exchange.state.lock().rotate_master_key = true;
    assert!(matches!(
        w.update_exchange(BASE).await,
        Err(WalletError::Protocol(_))
    ));
}

// ---------------------------------------------------------------------------
// Payments
// ---------------------------------------------------------------------------

#[tokio::test]
async fn payment_charges_cheapest_coins_first() {
    let exchange = standard_exchange().await;
    let w = wallet(&exchange).await;
    withdraw(&w, &exchange, "10").await;

    let offer = offer(&exchange, "5.50", "1").await;
    let purchase = w.confirm_pay(&offer).await.unwrap();
    assert_eq!(purchase.pay_req.exchange, BASE);
    assert_eq!(purchase.pay_req.coins.len(), 5);

    let crypto = LocalCrypto::new();
    let mut total = eur("0");
    for sig in &purchase.pay_req.coins {
        let message = deposit_message(
            &offer.contract_hash,
            &sig.coin_pub,
            &sig.contribution,
            &offer.contract.merchant_pub,
        );
        assert!(crypto.verify(&sig.coin_pub, &message, &sig.coin_sig).await.unwrap());
        total = total.add(&sig.contribution).unwrap().amount;
    }
    assert_eq!(total, eur("5.50"));

    // Four 1.00 coins (fee 0.01) go first, the 5.00 coin covers the rest.
    assert_eq!(coin_values(&w, CoinStatus::Dirty).await, vec![eur("3.50")]);
    assert_eq!(coin_values(&w, CoinStatus::Dormant).await.len(), 4);

    let balances = w.get_balances().await.unwrap();
    assert_eq!(balances["EUR"].available, eur("3.50"));
    assert_eq!(balances["EUR"].pending_payment, eur("5.50"));

    let stored = w.get_purchase(&offer.contract_hash).await.unwrap().unwrap();
    assert_eq!(stored, purchase);
    let history = w.get_history().await.unwrap();
    assert!(matches!(
        &history.last().unwrap().event,
        HistoryEvent::Pay { merchant_name, .. } if merchant_name == "Corner Shop"
    ));

    // Paying the same contract again charges nothing.
    assert_eq!(w.confirm_pay(&offer).await.unwrap(), purchase);
    assert_eq!(w.get_balances().await.unwrap()["EUR"].available, eur("3.50"));

    w.finish_purchase(&offer.contract_hash).await.unwrap();
    assert!(w.get_balances().await.unwrap()["EUR"].pending_payment.is_zero());
}

#[tokio::test]
async fn insufficient_coins_are_reported() {
    let exchange = standard_exchange().await;
    let w = wallet(&exchange).await;
    withdraw(&w, &exchange, "10").await;

    let err = w.confirm_pay(&offer(&exchange, "20", "1").await).await.unwrap_err();
    assert!(matches!(err, WalletError::CoinsInsufficient));
    assert_eq!(err.to_payload().error, "coins-insufficient");

    // Fees of three 1.00 coins already reach a 0.03 ceiling.
    let err = w.confirm_pay(&offer(&exchange, "5.50", "0.03").await).await.unwrap_err();
    assert!(matches!(err, WalletError::CoinsInsufficient));

    let mut foreign = offer(&exchange, "1", "1").await;
    foreign.contract.exchanges[0].master_pub = exchange.other_master.public.clone();
    let crypto = LocalCrypto::new();
    let merchant = crypto.create_keypair().await.unwrap();
    foreign.contract.merchant_pub = merchant.public.clone();
    foreign.contract_hash = hash_contract(&foreign.contract).unwrap();
    foreign.merchant_sig = crypto
        .sign(&merchant.private, foreign.contract_hash.as_bytes())
        .await
        .unwrap();
    assert!(matches!(
        w.confirm_pay(&foreign).await,
        Err(WalletError::CoinsInsufficient)
    ));

    assert_eq!(w.get_balances().await.unwrap()["EUR"].available, eur("9"));
}

#[tokio::test]
async fn tampered_offers_are_rejected() {
    let exchange = standard_exchange().await;
    let w = wallet(&exchange).await;
    withdraw(&w, &exchange, "10").await;

    let mut altered = offer(&exchange, "1", "1").await;
    altered.contract.amount = eur("0.01");
    assert!(matches!(
        w.confirm_pay(&altered).await,
        Err(WalletError::Protocol(_))
    ));

    let mut unsigned = offer(&exchange, "1", "1").await;
    let other = offer(&exchange, "2", "1").await;
    unsigned.merchant_sig = other.merchant_sig;
    assert!(matches!(
        w.confirm_pay(&unsigned).await,
        Err(WalletError::BadSignature(_))
    ));
}

// ---------------------------------------------------------------------------
// Refresh
// ---------------------------------------------------------------------------

#[tokio::test]
async fn dirty_coins_are_melted_into_fresh_ones() {
    let exchange = standard_exchange().await;
    let w = wallet(&exchange).await;
    withdraw(&w, &exchange, "10").await;
    w.confirm_pay(&offer(&exchange, "5.50", "1").await).await.unwrap();

    let sessions = w.refresh_dirty_coins().await.unwrap();
    assert_eq!(sessions.len(), 1);
    let session = w.get_refresh_session(&sessions[0]).await.unwrap();
    assert!(session.finished);
    assert_eq!(session.noreveal_index, Some(1));
    // 3.50 minus the 0.10 melt fee buys three 1.01 coins.
    assert_eq!(session.value_with_fee, eur("3.13"));

    assert_eq!(
        coin_values(&w, CoinStatus::Fresh).await,
        vec![eur("1"), eur("1"), eur("1")]
    );
    assert!(coin_values(&w, CoinStatus::Dirty).await.is_empty());
    assert_eq!(w.get_coin(&session.melt_coin_pub).await.unwrap().current_amount, eur("0.37"));
    assert_eq!(w.get_balances().await.unwrap()["EUR"].available, eur("3"));

    let types = history_types(&w.get_history().await.unwrap());
    assert!(types.ends_with(&["refresh".to_string(), "refresh-revealed".to_string()]));

    // Nothing left to refresh.
    assert!(w.refresh_dirty_coins().await.unwrap().is_empty());
    assert_eq!(w.refresh(&session.melt_coin_pub).await.unwrap(), None);
}

#[tokio::test]
async fn coins_too_small_to_refresh_are_retired() {
    let exchange = standard_exchange().await;
    let w = wallet(&exchange).await;
    withdraw(&w, &exchange, "10").await;
    w.confirm_pay(&offer(&exchange, "0.50", "1").await).await.unwrap();

    let dirty = w
        .all_coins()
        .await
        .unwrap()
        .into_iter()
        .find(|c| c.status == CoinStatus::Dirty)
        .unwrap();
    assert_eq!(dirty.current_amount, eur("0.50"));
    assert_eq!(w.refresh(&dirty.coin_pub).await.unwrap(), None);
    assert_eq!(w.get_coin(&dirty.coin_pub).await.unwrap().status, CoinStatus::Dormant);
    assert_eq!(w.get_balances().await.unwrap()["EUR"].available, eur("8"));
}
