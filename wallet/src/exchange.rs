//! # Exchanges and Denominations
//!
//! `GET {base}/keys` lists the exchange's master key and its denominations.
//! Each denomination carries a signature by the master key over
//! [`denomination_message`]; unsigned or badly signed denominations are
//! rejected outright. Keys are merged into what the wallet already knows:
//!
//! | situation                                   | outcome                     |
//! |---------------------------------------------|-----------------------------|
//! | master key differs from the stored one      | `Protocol` error, no change |
//! | known denomination with different contents | `Protocol` error, no change |
//! | new denomination                            | verified, stored            |
//! | stored denomination missing from `/keys`    | kept, `is_offered = false`  |

use chrono::{DateTime, Utc};
use coffer_store::KeyRange;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::amounts::Amount;
use crate::crypto::denomination_message;
use crate::db::{denom_key, indexes, stores};
use crate::error::{WalletError, WalletResult};
use crate::http::{canonicalize_base_url, join_url};
use crate::records::{DenominationRecord, ExchangeRecord};
use crate::wallet::Wallet;

/// A denomination as listed by `/keys`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DenominationInfo {
    pub denom_pub: String,
    pub value: Amount,
    pub fee_withdraw: Amount,
    pub fee_deposit: Amount,
    pub fee_refresh: Amount,
    pub stamp_start: DateTime<Utc>,
    pub stamp_expire_withdraw: DateTime<Utc>,
    pub stamp_expire_deposit: DateTime<Utc>,
    pub master_sig: String,
}

impl DenominationInfo {
    pub fn into_record(self, exchange_base_url: &str) -> DenominationRecord {
        DenominationRecord {
            exchange_base_url: exchange_base_url.to_string(),
            denom_pub: self.denom_pub,
            value: self.value,
            fee_withdraw: self.fee_withdraw,
            fee_deposit: self.fee_deposit,
            fee_refresh: self.fee_refresh,
            stamp_start: self.stamp_start,
            stamp_expire_withdraw: self.stamp_expire_withdraw,
            stamp_expire_deposit: self.stamp_expire_deposit,
            master_sig: self.master_sig,
            is_offered: true,
        }
    }
}

/// Body of `GET /keys`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeysResponse {
    pub master_public_key: String,
    pub denoms: Vec<DenominationInfo>,
}

/// Everything but the offer flag must match for a denomination to count as
/// unchanged.
fn same_denomination(a: &DenominationRecord, b: &DenominationRecord) -> bool {
    let mut a = a.clone();
    a.is_offered = b.is_offered;
    &a == b
}

impl Wallet {
    /// Fetch `/keys` from `base_url` and merge the result into the stored
    /// exchange. Returns the updated exchange record.
    pub async fn update_exchange(&self, base_url: &str) -> WalletResult<ExchangeRecord> {
        let base_url = canonicalize_base_url(base_url);
        let keys: KeysResponse = self.http().get(&join_url(&base_url, "keys")).await?.json()?;

        let (known, known_denoms) = self
            .inner
            .db
            .run_read(&[stores::EXCHANGES, stores::DENOMINATIONS], |tx| {
                let base_url = base_url.clone();
                async move {
                    let known: Option<ExchangeRecord> =
                        tx.object_store(stores::EXCHANGES)?.get_item(base_url.as_str()).await?;
                    let denoms: Vec<DenominationRecord> = tx
                        .object_store(stores::DENOMINATIONS)?
                        .index(indexes::DENOMS_BY_EXCHANGE)?
                        .get_all_items(KeyRange::only(base_url.as_str()), 0)
                        .await?;
                    WalletResult::Ok((known, denoms))
                }
            })
            .await?;

        if let Some(known) = &known {
            if known.master_pub != keys.master_public_key {
                warn!(exchange = %base_url, "exchange master key changed");
                return Err(WalletError::Protocol(format!(
                    "master key of {} changed",
                    base_url
                )));
            }
        }
        let master_pub = keys.master_public_key.clone();

        let mut merged = Vec::with_capacity(keys.denoms.len() + known_denoms.len());
        let mut added = 0usize;
        for info in keys.denoms {
            let fresh = info.into_record(&base_url);
            if let Some(old) = known_denoms.iter().find(|d| d.denom_pub == fresh.denom_pub) {
                if !same_denomination(old, &fresh) {
                    return Err(WalletError::Protocol(format!(
                        "denomination {} of {} was modified",
                        fresh.denom_pub, base_url
                    )));
                }
                merged.push(fresh);
                continue;
            }
            let valid = self
                .crypto()
                .verify(&master_pub, &denomination_message(&fresh), &fresh.master_sig)
                .await?;
            if !valid {
                return Err(WalletError::BadSignature(format!(
                    "master signature on denomination {}",
                    fresh.denom_pub
                )));
            }
            added += 1;
            merged.push(fresh);
        }
        for old in &known_denoms {
            if !merged.iter().any(|d| d.denom_pub == old.denom_pub) {
                let mut retired = old.clone();
                retired.is_offered = false;
                merged.push(retired);
            }
        }

        let record = ExchangeRecord {
            base_url: base_url.clone(),
            master_pub,
            last_update: Utc::now(),
        };
        self.inner
            .db
            .run_write(&[stores::EXCHANGES, stores::DENOMINATIONS], |tx| {
                let record = record.clone();
                let merged = &merged;
                async move {
                    tx.object_store(stores::EXCHANGES)?.put_item(&record).await?;
                    let denoms = tx.object_store(stores::DENOMINATIONS)?;
                    for d in merged {
                        denoms.put_item(d).await?;
                    }
                    WalletResult::Ok(())
                }
            })
            .await?;

        info!(
            exchange = %base_url,
            denominations = merged.len(),
            added,
            "exchange keys updated"
        );
        Ok(record)
    }

    /// Stored exchange, if any.
    pub async fn get_exchange(&self, base_url: &str) -> WalletResult<Option<ExchangeRecord>> {
        let base_url = canonicalize_base_url(base_url);
        self.inner
            .db
            .run_read(&[stores::EXCHANGES], |tx| async move {
                let exchange = tx
                    .object_store(stores::EXCHANGES)?
                    .get_item::<ExchangeRecord>(base_url.as_str())
                    .await?;
                WalletResult::Ok(exchange)
            })
            .await
    }

    /// Every stored denomination of an exchange, offered or not.
    pub async fn get_denominations(&self, base_url: &str) -> WalletResult<Vec<DenominationRecord>> {
        let base_url = canonicalize_base_url(base_url);
        self.inner
            .db
            .run_read(&[stores::DENOMINATIONS], |tx| async move {
                let denoms = tx
                    .object_store(stores::DENOMINATIONS)?
                    .index(indexes::DENOMS_BY_EXCHANGE)?
                    .get_all_items::<DenominationRecord>(KeyRange::only(base_url.as_str()), 0)
                    .await?;
                WalletResult::Ok(denoms)
            })
            .await
    }

    pub(crate) async fn get_denomination(
        &self,
        base_url: &str,
        denom_pub: &str,
    ) -> WalletResult<DenominationRecord> {
        let found: Option<DenominationRecord> = self
            .inner
            .db
            .run_read(&[stores::DENOMINATIONS], |tx| async move {
                let denom = tx
                    .object_store(stores::DENOMINATIONS)?
                    .get_item(denom_key(base_url, denom_pub))
                    .await?;
                WalletResult::Ok(denom)
            })
            .await?;
        found.ok_or_else(|| WalletError::DenominationNotFound {
            exchange: base_url.to_string(),
            denom_pub: denom_pub.to_string(),
        })
    }
}
