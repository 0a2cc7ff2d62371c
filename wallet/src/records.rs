//! # Wallet Records
//!
//! Everything the wallet persists, one struct per object store. Records are
//! stored through serde, so field names here are the key paths used by the
//! schema in [`crate::db`].
//!
//! ## Lifecycles
//!
//! ```text
//!   Reserve:  Unconfirmed ─confirm─▶ Confirmed ─status─▶ Withdrawing ─▶ Depleted
//!
//!   PreCoin ──exchange signs──▶ Coin (Fresh) ──pay──▶ Dirty ──refresh──▶ Dormant
//!                                                        │
//!                                     RefreshSession ◀───┘  melt ─▶ reveal ─▶ new Fresh coins
//! ```
//!
//! A coin's `current_amount` only ever decreases, and a dormant coin is
//! never revived.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::amounts::Amount;
use crate::config::WITHDRAW_EXPIRY_GRACE_SECS;
use crate::error::{WalletError, WalletResult};

// ---------------------------------------------------------------------------
// Exchanges and Denominations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeRecord {
    /// Canonical base URL; the primary key.
    pub base_url: String,
    pub master_pub: String,
    pub last_update: DateTime<Utc>,
}

/// One coin denomination offered by an exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DenominationRecord {
    pub exchange_base_url: String,
    pub denom_pub: String,
    pub value: Amount,
    pub fee_withdraw: Amount,
    pub fee_deposit: Amount,
    pub fee_refresh: Amount,
    pub stamp_start: DateTime<Utc>,
    pub stamp_expire_withdraw: DateTime<Utc>,
    pub stamp_expire_deposit: DateTime<Utc>,
    /// Exchange master key's signature over the denomination.
    pub master_sig: String,
    /// Still listed in the exchange's latest `/keys`.
    pub is_offered: bool,
}

impl DenominationRecord {
    /// Value plus withdraw fee: what one coin costs the reserve.
    pub fn withdraw_cost(&self) -> WalletResult<Amount> {
        self.value
            .add(&self.fee_withdraw)?
            .checked()
            .ok_or_else(|| WalletError::Saturated("pricing a denomination".into()))
    }

    /// Withdrawable at `now`, with a safety margin before the deadline.
    pub fn is_withdrawable(&self, now: DateTime<Utc>) -> bool {
        self.is_offered
            && self.stamp_start <= now
            && self.stamp_expire_withdraw.timestamp() - WITHDRAW_EXPIRY_GRACE_SECS > now.timestamp()
    }
}

// ---------------------------------------------------------------------------
// Reserves
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReserveStatus {
    /// Created; the user has not confirmed the wire transfer yet.
    Unconfirmed,
    /// Confirmed; waiting for the exchange to report funds.
    Confirmed,
    /// Funds known; pre-coins are being planned and exchanged.
    Withdrawing,
    /// Nothing more can be withdrawn.
    Depleted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReserveRecord {
    pub reserve_pub: String,
    pub reserve_priv: String,
    pub exchange_base_url: String,
    pub created: DateTime<Utc>,
    #[serde(default)]
    pub last_query: Option<DateTime<Utc>>,
    pub requested_amount: Amount,
    /// Balance still at the exchange and not yet planned into pre-coins.
    /// `None` until the exchange has been asked.
    #[serde(default)]
    pub current_amount: Option<Amount>,
    /// Value (with fees) of pre-coins created but not yet signed.
    pub precoin_amount: Amount,
    pub status: ReserveStatus,
}

impl ReserveRecord {
    pub fn is_confirmed(&self) -> bool {
        self.status != ReserveStatus::Unconfirmed
    }
}

// ---------------------------------------------------------------------------
// Coins
// ---------------------------------------------------------------------------

/// A coin waiting for the exchange's blind signature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreCoinRecord {
    pub coin_pub: String,
    pub coin_priv: String,
    pub reserve_pub: String,
    pub exchange_base_url: String,
    pub denom_pub: String,
    pub blinding_key: String,
    pub withdraw_sig: String,
    pub coin_ev: String,
    pub coin_value: Amount,
    /// `coin_value` plus the withdraw fee, as charged to the reserve.
    pub cost: Amount,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CoinStatus {
    /// Never spent.
    Fresh,
    /// Partially spent; should be refreshed.
    Dirty,
    /// Value moved into a refresh session, or too little left to bother.
    Dormant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoinRecord {
    pub coin_pub: String,
    pub coin_priv: String,
    pub denom_pub: String,
    pub denom_sig: String,
    pub current_amount: Amount,
    pub exchange_base_url: String,
    /// Reserve the coin was withdrawn from; `None` for refreshed coins.
    #[serde(default)]
    pub reserve_pub: Option<String>,
    pub status: CoinStatus,
    /// Temporarily excluded from coin selection.
    #[serde(default)]
    pub suspended: bool,
}

impl CoinRecord {
    pub fn is_spendable(&self) -> bool {
        !self.suspended && self.status != CoinStatus::Dormant && !self.current_amount.is_zero()
    }
}

// ---------------------------------------------------------------------------
// Refresh
// ---------------------------------------------------------------------------

/// One candidate coin of one cut-and-choose set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefreshPlanchet {
    pub coin_pub: String,
    pub coin_priv: String,
    pub blinding_key: String,
    pub coin_ev: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefreshSessionRecord {
    pub session_id: String,
    pub exchange_base_url: String,
    pub melt_coin_pub: String,
    /// New coins' values and withdraw fees plus the melt fee.
    pub value_with_fee: Amount,
    /// Commitment over every candidate set.
    pub session_hash: String,
    pub confirm_sig: String,
    pub transfer_pubs: Vec<String>,
    pub transfer_privs: Vec<String>,
    pub new_denoms: Vec<String>,
    /// `planchets[gamma][i]`: candidate `i` of set `gamma`.
    pub planchets: Vec<Vec<RefreshPlanchet>>,
    /// Set chosen by the exchange at melt time; `None` while unmelted.
    #[serde(default)]
    pub noreveal_index: Option<usize>,
    pub finished: bool,
    pub created: DateTime<Utc>,
}

impl RefreshSessionRecord {
    pub fn is_melted(&self) -> bool {
        self.noreveal_index.is_some()
    }
}

// ---------------------------------------------------------------------------
// Payments
// ---------------------------------------------------------------------------

/// An exchange a merchant accepts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeHandle {
    pub url: String,
    pub master_pub: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Merchant {
    pub name: String,
}

/// Terms a merchant offers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contract {
    pub order_id: String,
    pub amount: Amount,
    /// Deposit fees the merchant is willing to cover.
    pub max_fee: Amount,
    pub merchant: Merchant,
    pub merchant_pub: String,
    pub exchanges: Vec<ExchangeHandle>,
    pub fulfillment_url: String,
    pub timestamp: DateTime<Utc>,
    pub refund_deadline: DateTime<Utc>,
    #[serde(default)]
    pub summary: Option<String>,
}

/// A deposit permission for one coin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoinPaySig {
    pub coin_pub: String,
    pub denom_pub: String,
    pub denom_sig: String,
    /// Amount spent from the coin, deposit fee included.
    pub contribution: Amount,
    pub coin_sig: String,
}

/// What the merchant receives once the payment is submitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayRequest {
    pub amount: Amount,
    pub max_fee: Amount,
    pub contract_hash: String,
    pub merchant_sig: String,
    pub exchange: String,
    pub order_id: String,
    pub timestamp: DateTime<Utc>,
    pub refund_deadline: DateTime<Utc>,
    pub coins: Vec<CoinPaySig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PurchaseRecord {
    pub contract_hash: String,
    pub contract: Contract,
    pub pay_req: PayRequest,
    pub merchant_sig: String,
    pub timestamp: DateTime<Utc>,
    /// The merchant acknowledged the payment.
    #[serde(default)]
    pub finished: bool,
}

// ---------------------------------------------------------------------------
// History
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum HistoryEvent {
    CreateReserve {
        reserve_pub: String,
        requested_amount: Amount,
    },
    ConfirmReserve {
        reserve_pub: String,
    },
    ReserveUpdate {
        reserve_pub: String,
        #[serde(default)]
        old_amount: Option<Amount>,
        new_amount: Amount,
    },
    DepletedReserve {
        reserve_pub: String,
    },
    Withdraw {
        coin_pub: String,
        value: Amount,
    },
    Pay {
        merchant_name: String,
        amount: Amount,
        contract_hash: String,
        fulfillment_url: String,
    },
    Refresh {
        session_id: String,
        melt_coin_pub: String,
        value_with_fee: Amount,
    },
    RefreshRevealed {
        session_id: String,
        new_coins: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Assigned by the store's key generator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub timestamp: DateTime<Utc>,
    pub event: HistoryEvent,
}

impl HistoryEntry {
    pub fn now(event: HistoryEvent) -> Self {
        Self {
            id: None,
            timestamp: Utc::now(),
            event,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn denom(expire_in: Duration) -> DenominationRecord {
        let now = Utc::now();
        DenominationRecord {
            exchange_base_url: "https://ex.test/".into(),
            denom_pub: "aa".into(),
            value: Amount::from_units("EUR", 5),
            fee_withdraw: Amount::new("EUR", 0, 100_000),
            fee_deposit: Amount::zero("EUR"),
            fee_refresh: Amount::zero("EUR"),
            stamp_start: now - Duration::hours(1),
            stamp_expire_withdraw: now + expire_in,
            stamp_expire_deposit: now + Duration::days(30),
            master_sig: String::new(),
            is_offered: true,
        }
    }

    #[test]
    fn withdraw_cost_includes_the_fee() {
        assert_eq!(
            denom(Duration::days(1)).withdraw_cost().unwrap(),
            Amount::new("EUR", 5, 100_000)
        );
    }

    #[test]
    fn withdrawability_respects_the_grace_period() {
        let now = Utc::now();
        assert!(denom(Duration::days(1)).is_withdrawable(now));
        assert!(!denom(Duration::seconds(30)).is_withdrawable(now));

        let mut retired = denom(Duration::days(1));
        retired.is_offered = false;
        assert!(!retired.is_withdrawable(now));
    }

    #[test]
    fn history_events_are_tagged() {
        let entry = HistoryEntry::now(HistoryEvent::ConfirmReserve {
            reserve_pub: "rp".into(),
        });
        let json = serde_json::to_value(&entry).unwrap();
        assert!(json.get("id").is_none());
        assert_eq!(json["event"]["type"], "confirm-reserve");
        let back: HistoryEntry = serde_json::from_value(json).unwrap();
        assert_eq!(back, entry);
    }
}
