//! # Payments
//!
//! A merchant hands the wallet an [`Offer`]: the contract terms, their hash
//! and the merchant's signature over that hash. Paying means picking coins
//! from one exchange the merchant accepts, signing a deposit permission for
//! each and recording the purchase together with the charged coins in one
//! transaction.
//!
//! ## Coin Selection
//!
//! Per accepted exchange, spendable coins are sorted by ascending deposit
//! fee and taken greedily:
//!
//! ```text
//!   for coin in coins (cheapest fee first):
//!       skip coins worth no more than their fee
//!       acc_fee    += fee       ──▶ acc_fee >= max_fee  ⇒ reject exchange
//!       acc_amount += value     ──▶ acc_amount >= target ⇒ accept
//! ```
//!
//! The first exchange in the merchant's list that is accepted pays.

use std::cmp::Ordering;
use std::collections::HashSet;

use chrono::Utc;
use coffer_store::KeyRange;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use tracing::{debug, info};

use crate::amounts::Amount;
use crate::crypto::{sign_deposit, CoinWithDenom};
use crate::db::{append_history, denom_key, indexes, stores};
use crate::error::{WalletError, WalletResult};
use crate::records::{
    CoinRecord, Contract, DenominationRecord, ExchangeHandle, ExchangeRecord, HistoryEntry,
    HistoryEvent, PayRequest, PurchaseRecord,
};
use crate::wallet::Wallet;

/// What a merchant proposes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    pub contract: Contract,
    /// Merchant's signature over `contract_hash`.
    pub merchant_sig: String,
    pub contract_hash: String,
}

/// SHA-512 over the contract's JSON encoding, hex-encoded.
pub fn hash_contract(contract: &Contract) -> WalletResult<String> {
    let encoded = serde_json::to_vec(contract)
        .map_err(|e| WalletError::Protocol(format!("cannot encode contract: {}", e)))?;
    Ok(hex::encode(Sha512::digest(&encoded)))
}

/// Coins of one exchange that can pay `amount` with total deposit fees
/// below `max_fee`, or `None`.
pub fn select_pay_coins(
    amount: &Amount,
    max_fee: &Amount,
    mut coins: Vec<CoinWithDenom>,
) -> WalletResult<Option<Vec<CoinWithDenom>>> {
    let mut ordering_error = None;
    coins.sort_by(|a, b| match a.denom.fee_deposit.checked_cmp(&b.denom.fee_deposit) {
        Ok(ord) => ord,
        Err(e) => {
            ordering_error.get_or_insert(e);
            Ordering::Equal
        }
    });
    if let Some(e) = ordering_error {
        return Err(e.into());
    }

    let mut acc_fee = Amount::zero(amount.currency());
    let mut acc_amount = Amount::zero(amount.currency());
    let mut usable = Vec::new();
    for cd in coins {
        let value = &cd.coin.current_amount;
        let fee = &cd.denom.fee_deposit;
        if value.checked_cmp(fee)?.is_le() {
            continue;
        }
        acc_fee = acc_fee.add(fee)?.amount;
        acc_amount = acc_amount.add(value)?.amount;
        if acc_fee.checked_cmp(max_fee)?.is_ge() {
            return Ok(None);
        }
        usable.push(cd);
        if acc_amount.checked_cmp(amount)?.is_ge() {
            return Ok(Some(usable));
        }
    }
    Ok(None)
}

impl Wallet {
    /// For every accepted exchange (in the given order) that can cover
    /// `amount` within `max_fee`, the coins it would use.
    pub async fn get_possible_exchange_coins(
        &self,
        amount: &Amount,
        max_fee: &Amount,
        exchanges: &[ExchangeHandle],
    ) -> WalletResult<Vec<(String, Vec<CoinWithDenom>)>> {
        let candidates: Vec<(String, Vec<CoinWithDenom>)> = self
            .inner
            .db
            .run_read(
                &[stores::EXCHANGES, stores::COINS, stores::DENOMINATIONS],
                |tx| async move {
                    let by_master = tx.object_store(stores::EXCHANGES)?.index(indexes::BY_MASTER_PUB)?;
                    let coins_by_exchange = tx.object_store(stores::COINS)?.index(indexes::COINS_BY_EXCHANGE)?;
                    let denoms = tx.object_store(stores::DENOMINATIONS)?;

                    let mut seen = HashSet::new();
                    let mut out = Vec::new();
                    for handle in exchanges {
                        let known: Vec<ExchangeRecord> = by_master
                            .get_all_items(KeyRange::only(handle.master_pub.as_str()), 0)
                            .await?;
                        for exchange in known {
                            if !seen.insert(exchange.base_url.clone()) {
                                continue;
                            }
                            let coins: Vec<CoinRecord> = coins_by_exchange
                                .get_all_items(KeyRange::only(exchange.base_url.as_str()), 0)
                                .await?;
                            let mut usable = Vec::new();
                            for coin in coins.into_iter().filter(CoinRecord::is_spendable) {
                                let denom: Option<DenominationRecord> = denoms
                                    .get_item(denom_key(&coin.exchange_base_url, &coin.denom_pub))
                                    .await?;
                                let denom = denom.ok_or_else(|| WalletError::DenominationNotFound {
                                    exchange: coin.exchange_base_url.clone(),
                                    denom_pub: coin.denom_pub.clone(),
                                })?;
                                if denom.value.currency() != amount.currency() {
                                    continue;
                                }
                                usable.push(CoinWithDenom { coin, denom });
                            }
                            if !usable.is_empty() {
                                out.push((exchange.base_url, usable));
                            }
                        }
                    }
                    WalletResult::Ok(out)
                },
            )
            .await?;

        let mut selected = Vec::new();
        for (url, coins) in candidates {
            match select_pay_coins(amount, max_fee, coins)? {
                Some(coins) => selected.push((url, coins)),
                None => debug!(exchange = %url, "exchange cannot cover the payment"),
            }
        }
        Ok(selected)
    }

    /// Pay for `offer`: sign deposit permissions with coins of the first
    /// suitable exchange and record the purchase. Paying the same contract
    /// again returns the recorded purchase.
    pub async fn confirm_pay(&self, offer: &Offer) -> WalletResult<PurchaseRecord> {
        let contract = &offer.contract;
        if hash_contract(contract)? != offer.contract_hash {
            return Err(WalletError::Protocol("contract hash does not match the contract".into()));
        }
        let merchant_ok = self
            .crypto()
            .verify(&contract.merchant_pub, offer.contract_hash.as_bytes(), &offer.merchant_sig)
            .await?;
        if !merchant_ok {
            return Err(WalletError::BadSignature("merchant signature on contract".into()));
        }
        if let Some(existing) = self.get_purchase(&offer.contract_hash).await? {
            debug!(contract = %offer.contract_hash, "contract already paid");
            return Ok(existing);
        }

        let mut options = self
            .get_possible_exchange_coins(&contract.amount, &contract.max_fee, &contract.exchanges)
            .await?;
        if options.is_empty() {
            info!(contract = %offer.contract_hash, amount = %contract.amount, "insufficient coins");
            return Err(WalletError::CoinsInsufficient);
        }
        let (exchange, coins) = options.swap_remove(0);
        let _guards = coins
            .iter()
            .map(|cd| self.begin("coin", &cd.coin.coin_pub))
            .collect::<WalletResult<Vec<_>>>()?;

        let signed = sign_deposit(self.crypto(), contract, &offer.contract_hash, &coins).await?;
        let purchase = PurchaseRecord {
            contract_hash: offer.contract_hash.clone(),
            contract: contract.clone(),
            pay_req: PayRequest {
                amount: contract.amount.clone(),
                max_fee: contract.max_fee.clone(),
                contract_hash: offer.contract_hash.clone(),
                merchant_sig: offer.merchant_sig.clone(),
                exchange: exchange.clone(),
                order_id: contract.order_id.clone(),
                timestamp: contract.timestamp,
                refund_deadline: contract.refund_deadline,
                coins: signed.iter().map(|(sig, _)| sig.clone()).collect(),
            },
            merchant_sig: offer.merchant_sig.clone(),
            timestamp: Utc::now(),
            finished: false,
        };

        let coins = &coins;
        let signed = &signed;
        let purchase_ref = &purchase;
        self.inner
            .db
            .run_write(
                &[stores::COINS, stores::PURCHASES, stores::HISTORY],
                |tx| async move {
                    let store = tx.object_store(stores::COINS)?;
                    for (_, updated) in signed {
                        let stored: Option<CoinRecord> = store.get_item(updated.coin_pub.as_str()).await?;
                        let original = coins.iter().find(|cd| cd.coin.coin_pub == updated.coin_pub);
                        match (stored, original) {
                            (Some(stored), Some(original)) if stored == original.coin => {}
                            _ => {
                                return Err(WalletError::InvalidState(format!(
                                    "coin {} changed while paying",
                                    updated.coin_pub
                                )))
                            }
                        }
                        store.put_item(updated).await?;
                    }
                    tx.object_store(stores::PURCHASES)?.add_item(purchase_ref).await?;
                    append_history(
                        &tx,
                        HistoryEntry::now(HistoryEvent::Pay {
                            merchant_name: purchase_ref.contract.merchant.name.clone(),
                            amount: purchase_ref.contract.amount.clone(),
                            contract_hash: purchase_ref.contract_hash.clone(),
                            fulfillment_url: purchase_ref.contract.fulfillment_url.clone(),
                        }),
                    )
                    .await
                },
            )
            .await?;

        info!(
            contract = %purchase.contract_hash,
            exchange = %exchange,
            coins = purchase.pay_req.coins.len(),
            amount = %contract.amount,
            "payment confirmed"
        );
        Ok(purchase)
    }

    /// The recorded purchase for a contract hash, with its pay request.
    pub async fn get_purchase(&self, contract_hash: &str) -> WalletResult<Option<PurchaseRecord>> {
        self.inner
            .db
            .run_read(&[stores::PURCHASES], |tx| async move {
                let p = tx.object_store(stores::PURCHASES)?.get_item(contract_hash).await?;
                WalletResult::Ok(p)
            })
            .await
    }

    /// Record that the merchant accepted the payment.
    pub async fn finish_purchase(&self, contract_hash: &str) -> WalletResult<()> {
        self.inner
            .db
            .run_write(&[stores::PURCHASES], |tx| async move {
                let purchases = tx.object_store(stores::PURCHASES)?;
                let mut purchase: PurchaseRecord = purchases.get_item(contract_hash).await?.ok_or_else(|| {
                    WalletError::InvalidState(format!("no purchase for contract {}", contract_hash))
                })?;
                purchase.finished = true;
                purchases.put_item(&purchase).await?;
                WalletResult::Ok(())
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    use crate::error::AmountError;
    use crate::records::{CoinStatus, Merchant};

    fn eur(value: u64) -> Amount {
        Amount::from_units("EUR", value)
    }

    fn coin_with_fee(name: &str, value: Amount, fee: Amount) -> CoinWithDenom {
        let now = Utc::now();
        CoinWithDenom {
            coin: CoinRecord {
                coin_pub: name.into(),
                coin_priv: String::new(),
                denom_pub: format!("denom-{}", name),
                denom_sig: String::new(),
                current_amount: value.clone(),
                exchange_base_url: "https://ex.test/".into(),
                reserve_pub: None,
                status: CoinStatus::Fresh,
                suspended: false,
            },
            denom: DenominationRecord {
                exchange_base_url: "https://ex.test/".into(),
                denom_pub: format!("denom-{}", name),
                value,
                fee_withdraw: eur(0),
                fee_deposit: fee,
                fee_refresh: eur(0),
                stamp_start: now - Duration::hours(1),
                stamp_expire_withdraw: now + Duration::days(1),
                stamp_expire_deposit: now + Duration::days(30),
                master_sig: String::new(),
                is_offered: true,
            },
        }
    }

    fn names(coins: &[CoinWithDenom]) -> Vec<&str> {
        coins.iter().map(|c| c.coin.coin_pub.as_str()).collect()
    }

    #[test]
    fn fee_ceiling_rejects_the_exchange() {
        let coins = vec![
            coin_with_fee("b", eur(5), eur(2)),
            coin_with_fee("a", eur(10), eur(1)),
        ];
        // 10 (fee 1) is not enough, adding 5 (fee 2) brings fees to 3 > 2.
        assert!(select_pay_coins(&eur(12), &eur(2), coins.clone()).unwrap().is_none());

        let picked = select_pay_coins(&eur(12), &eur(4), coins).unwrap().unwrap();
        assert_eq!(names(&picked), vec!["a", "b"]);
    }

    #[test]
    fn cheapest_fees_first_and_stop_at_target() {
        let coins = vec![
            coin_with_fee("pricey", eur(10), eur(3)),
            coin_with_fee("cheap", eur(10), eur(1)),
            coin_with_fee("free", eur(1), eur(0)),
        ];
        let picked = select_pay_coins(&eur(5), &eur(5), coins).unwrap().unwrap();
        assert_eq!(names(&picked), vec!["free", "cheap"]);
    }

    #[test]
    fn coins_worth_less_than_their_fee_are_skipped() {
        let coins = vec![
            coin_with_fee("dust", Amount::new("EUR", 0, 10_000), Amount::new("EUR", 0, 10_000)),
            coin_with_fee("real", eur(2), Amount::new("EUR", 0, 10_000)),
        ];
        let picked = select_pay_coins(&eur(1), &eur(1), coins).unwrap().unwrap();
        assert_eq!(names(&picked), vec!["real"]);
    }

    #[test]
    fn not_enough_value_yields_none() {
        let coins = vec![coin_with_fee("a", eur(1), eur(0))];
        assert!(select_pay_coins(&eur(2), &eur(1), coins).unwrap().is_none());
        assert!(select_pay_coins(&eur(2), &eur(1), Vec::new()).unwrap().is_none());
    }

    #[test]
    fn mixed_fee_currencies_are_an_error() {
        let coins = vec![
            coin_with_fee("eur", eur(5), eur(1)),
            coin_with_fee("usd", eur(5), Amount::from_units("USD", 1)),
        ];
        let err = select_pay_coins(&eur(3), &eur(2), coins).unwrap_err();
        assert!(
            matches!(err, WalletError::Amount(AmountError::CurrencyMismatch { .. })),
            "{err}"
        );
    }

    #[test]
    fn contract_hash_is_stable() {
        let contract = Contract {
            order_id: "o-1".into(),
            amount: eur(3),
            max_fee: eur(1),
            merchant: Merchant { name: "shop".into() },
            merchant_pub: "mp".into(),
            exchanges: Vec::new(),
            fulfillment_url: "https://shop.test/done".into(),
            timestamp: Utc::now(),
            refund_deadline: Utc::now(),
            summary: None,
        };
        let h = hash_contract(&contract).unwrap();
        assert_eq!(h.len(), 128);
        assert_eq!(h, hash_contract(&contract.clone()).unwrap());
        let mut other = contract;
        other.order_id = "o-2".into();
        assert_ne!(h, hash_contract(&other).unwrap());
    }
}
