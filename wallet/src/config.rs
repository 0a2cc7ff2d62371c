//! # Wallet Constants and Configuration
//!
//! Protocol-level constants live here as plain `const`s so they can be
//! referenced from anywhere without threading a config struct around.
//! Tunables that an embedder may reasonably want to change (retry backoff,
//! the refresh cut-and-choose parameter, the database name) are collected in
//! [`WalletConfig`].
//!
//! | Constant                     | Value     | Used by                 |
//! |------------------------------|-----------|-------------------------|
//! | `FRACTIONAL_BASE`            | 1 000 000 | amount arithmetic       |
//! | `MAX_AMOUNT_VALUE`           | 2^52      | amount saturation       |
//! | `WITHDRAW_DENOM_LIMIT`       | 1000      | denomination selection  |
//! | `REFRESH_KAPPA`              | 3         | melt / reveal           |
//! | `DB_NAME` / `DB_VERSION`     | `coffer-wallet` / 1 | schema upgrade |

use std::time::Duration;

use crate::retry::RetryPolicy;

// ---------------------------------------------------------------------------
// Amounts
// ---------------------------------------------------------------------------

/// Sub-units per whole unit.
pub const FRACTIONAL_BASE: u32 = 1_000_000;

/// Number of decimal digits in the fractional part.
pub const FRACTIONAL_LENGTH: usize = 6;

/// Largest representable whole-unit value. Chosen so that every amount
/// survives a round-trip through an `f64`-backed record value.
pub const MAX_AMOUNT_VALUE: u64 = 1 << 52;

// ---------------------------------------------------------------------------
// Withdrawal and Refresh
// ---------------------------------------------------------------------------

/// Upper bound on coins planned for one withdrawal.
pub const WITHDRAW_DENOM_LIMIT: usize = 1000;

/// Number of candidate coin sets committed to during a melt.
pub const REFRESH_KAPPA: usize = 3;

/// A denomination stays withdrawable until this long before its withdraw
/// deadline.
pub const WITHDRAW_EXPIRY_GRACE_SECS: i64 = 60;

// ---------------------------------------------------------------------------
// Retry Backoff
// ---------------------------------------------------------------------------

pub const PRECOIN_RETRY_INITIAL: Duration = Duration::from_millis(100);
pub const PRECOIN_RETRY_MAX: Duration = Duration::from_secs(60);

pub const RESERVE_RETRY_INITIAL: Duration = Duration::from_millis(250);
pub const RESERVE_RETRY_MAX: Duration = Duration::from_secs(180);

pub const RETRY_FACTOR: u32 = 2;

/// Per-request timeout of the default HTTP client.
pub const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Database
// ---------------------------------------------------------------------------

pub const DB_NAME: &str = "coffer-wallet";
pub const DB_VERSION: u64 = 1;

// ---------------------------------------------------------------------------
// WalletConfig
// ---------------------------------------------------------------------------

/// Runtime knobs of a [`Wallet`](crate::Wallet).
#[derive(Debug, Clone, PartialEq)]
pub struct WalletConfig {
    /// Name of the backing database.
    pub db_name: String,
    /// Backoff for exchanging one pre-coin for a signed coin.
    pub precoin_retry: RetryPolicy,
    /// Backoff for querying and depleting a reserve.
    pub reserve_retry: RetryPolicy,
    /// Cut-and-choose parameter for refresh sessions.
    pub kappa: usize,
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            db_name: DB_NAME.to_string(),
            precoin_retry: RetryPolicy::new(PRECOIN_RETRY_INITIAL, RETRY_FACTOR, PRECOIN_RETRY_MAX),
            reserve_retry: RetryPolicy::new(RESERVE_RETRY_INITIAL, RETRY_FACTOR, RESERVE_RETRY_MAX),
            kappa: REFRESH_KAPPA,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_amount_fits_an_f64_mantissa() {
        assert_eq!(MAX_AMOUNT_VALUE as f64 as u64, MAX_AMOUNT_VALUE);
        assert_eq!(10u32.pow(FRACTIONAL_LENGTH as u32), FRACTIONAL_BASE);
    }

    #[test]
    fn default_config_uses_protocol_constants() {
        let config = WalletConfig::default();
        assert_eq!(config.db_name, DB_NAME);
        assert_eq!(config.kappa, 3);
        assert_eq!(config.precoin_retry.max_delay, Duration::from_secs(60));
        assert_eq!(config.reserve_retry.initial, Duration::from_millis(250));
    }
}
