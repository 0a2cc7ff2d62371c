//! # Wallet Errors
//!
//! Every failure the wallet can report, split by origin:
//!
//! | Type           | Origin                                  |
//! |----------------|-----------------------------------------|
//! | `AmountError`  | currency mismatch, malformed amount text |
//! | `CryptoError`  | malformed keys or signatures            |
//! | `HttpError`    | transport failures and non-2xx replies  |
//! | `WalletError`  | everything above plus storage and protocol state |
//!
//! The retry driver only looks at [`WalletError::is_transient`]. Callers on
//! the other side of the wallet boundary get an [`ErrorPayload`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

use coffer_store::StoreError;

// ---------------------------------------------------------------------------
// AmountError
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AmountError {
    #[error("currency mismatch: {left} vs {right}")]
    CurrencyMismatch { left: String, right: String },

    #[error("cannot parse amount: {0:?}")]
    Parse(String),

    #[error("division by zero")]
    DivisionByZero,
}

// ---------------------------------------------------------------------------
// CryptoError
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("invalid signature encoding: {0}")]
    InvalidSignature(String),

    #[error("malformed encoding: {0}")]
    Encoding(String),
}

impl From<hex::FromHexError> for CryptoError {
    fn from(e: hex::FromHexError) -> Self {
        CryptoError::Encoding(e.to_string())
    }
}

// ---------------------------------------------------------------------------
// HttpError
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Error)]
pub enum HttpError {
    /// The request never got an answer.
    #[error("network error talking to {url}: {reason}")]
    Network { url: String, reason: String },

    /// The server answered with a non-success status.
    #[error("{url} answered with status {status}")]
    Status {
        url: String,
        status: u16,
        body: serde_json::Value,
    },

    /// The body was not the JSON we expected.
    #[error("unexpected response from {url}: {reason}")]
    Decode { url: String, reason: String },
}

impl HttpError {
    /// Timeouts, connection failures, rate limiting and server-side errors
    /// may go away on their own.
    pub fn is_transient(&self) -> bool {
        match self {
            HttpError::Network { .. } => true,
            HttpError::Status { status, .. } => *status == 429 || *status >= 500,
            HttpError::Decode { .. } => false,
        }
    }
}

// ---------------------------------------------------------------------------
// WalletError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum WalletError {
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    #[error("amount error: {0}")]
    Amount(#[from] AmountError),

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("http error: {0}")]
    Http(#[from] HttpError),

    #[error("amount overflowed or underflowed while {0}")]
    Saturated(String),

    #[error("reserve {0} not found")]
    ReserveNotFound(String),

    #[error("coin {0} not found")]
    CoinNotFound(String),

    #[error("exchange {0} is unknown")]
    ExchangeNotFound(String),

    #[error("denomination {denom_pub} of {exchange} not found")]
    DenominationNotFound { exchange: String, denom_pub: String },

    #[error("refresh session {0} not found")]
    RefreshSessionNotFound(String),

    /// The exchange does not (yet) report a balance for the reserve. Usually
    /// the wire transfer has not arrived.
    #[error("reserve {0} is not known to the exchange yet")]
    ReserveNotReady(String),

    #[error("no exchange can cover the payment with acceptable fees")]
    CoinsInsufficient,

    #[error("a bad signature from the exchange: {0}")]
    BadSignature(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("{0} is already being processed")]
    Busy(String),

    /// Another task still holds pre-coins of the reserve.
    #[error("pre-coins of reserve {0} are still being withdrawn")]
    WithdrawalPending(String),

    #[error("invalid state: {0}")]
    InvalidState(String),
}

pub type WalletResult<T> = Result<T, WalletError>;

impl WalletError {
    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            WalletError::Http(e) => e.is_transient(),
            WalletError::ReserveNotReady(_) | WalletError::WithdrawalPending(_) => true,
            _ => false,
        }
    }

    /// Stable machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            WalletError::Store(_) => "storage-error",
            WalletError::Amount(_) | WalletError::Saturated(_) => "amount-error",
            WalletError::Crypto(_) => "crypto-error",
            WalletError::Http(_) => "http-error",
            WalletError::ReserveNotFound(_)
            | WalletError::CoinNotFound(_)
            | WalletError::ExchangeNotFound(_)
            | WalletError::DenominationNotFound { .. }
            | WalletError::RefreshSessionNotFound(_) => "not-found",
            WalletError::ReserveNotReady(_) => "reserve-not-ready",
            WalletError::CoinsInsufficient => "coins-insufficient",
            WalletError::BadSignature(_) => "bad-signature",
            WalletError::Protocol(_) => "protocol-violation",
            WalletError::Busy(_) => "busy",
            WalletError::WithdrawalPending(_) => "withdrawal-pending",
            WalletError::InvalidState(_) => "invalid-state",
        }
    }

    /// The `{error, hint, detail}` form handed across the wallet boundary.
    pub fn to_payload(&self) -> ErrorPayload {
        let detail = match self {
            WalletError::Store(e) => Some(serde_json::json!({ "kind": e.name() })),
            WalletError::Http(HttpError::Status { status, body, .. }) => {
                Some(serde_json::json!({ "status": status, "body": body }))
            }
            _ => None,
        };
        ErrorPayload {
            error: self.code().to_string(),
            hint: self.to_string(),
            detail,
            transient: self.is_transient(),
        }
    }
}

/// Structured error for UIs and the CLI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub error: String,
    pub hint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
    /// Retrying later may help.
    #[serde(default)]
    pub transient: bool,
}
