// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # Coffer Wallet: Coins, Reserves and Refresh
//!
//! The coin engine of a blind-signature payment wallet. Money enters as a
//! reserve at an exchange, is withdrawn as coins, leaves through deposit
//! permissions handed to merchants, and whatever a payment leaves on a coin
//! is refreshed into new coins. Every state the engine goes through lives in
//! a [`coffer_store`] database, so a wallet can stop at any point and pick up
//! where it left off.
//!
//! ## Architecture
//!
//! ```text
//!                         ┌─────────────── Wallet ───────────────┐
//!   UI / CLI ──────────▶  │ exchange  withdraw  pay  refresh      │
//!                         │ overview (balances, history, pending) │
//!                         └───┬───────────────┬──────────────┬────┘
//!                             │               │              │
//!                       coffer_store     CryptoApi       HttpClient
//!                       (records)      (LocalCrypto)  (ReqwestHttpClient)
//! ```
//!
//! - **amounts**: saturating fixed-point money.
//! - **records**: everything persisted, one struct per store.
//! - **db**: schema and store names.
//! - **crypto**: the crypto collaborator and the protocol messages.
//! - **http**: the HTTP collaborator and URL handling.
//! - **retry**: backoff policy and driver.
//! - **exchange / withdraw / pay / refresh / overview**: the operations.
//! - **config / error**: constants, tunables and error types.
//!
//! ## Rules of the House
//!
//! 1. Amount arithmetic never wraps; saturation is reported, not hidden.
//! 2. A coin's value only ever goes down, and every decrease is written in
//!    the same transaction as whatever it paid for.
//! 3. Nothing waits on the network while holding a transaction open.

pub mod amounts;
pub mod config;
pub mod crypto;
pub mod db;
pub mod error;
pub mod exchange;
pub mod http;
pub mod overview;
pub mod pay;
pub mod records;
pub mod refresh;
pub mod retry;
pub mod wallet;
pub mod withdraw;

pub use amounts::{Amount, Saturating};
pub use config::WalletConfig;
pub use crypto::{CoinWithDenom, CryptoApi, KeyPair, LocalCrypto};
pub use error::{AmountError, CryptoError, ErrorPayload, HttpError, WalletError, WalletResult};
pub use exchange::{DenominationInfo, KeysResponse};
pub use http::{HttpClient, HttpResponse, ReqwestHttpClient};
pub use overview::{Balance, Balances, PendingOperation};
pub use pay::{hash_contract, select_pay_coins, Offer};
pub use records::{
    CoinRecord, CoinStatus, Contract, DenominationRecord, ExchangeHandle, ExchangeRecord,
    HistoryEntry, HistoryEvent, Merchant, PurchaseRecord, RefreshSessionRecord, ReserveRecord,
    ReserveStatus,
};
pub use retry::RetryPolicy;
pub use wallet::Wallet;
pub use withdraw::{get_withdraw_denom_list, CreateReserveResponse, ReserveCreationInfo};
