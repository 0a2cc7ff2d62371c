//! # Amounts
//!
//! Exact fixed-point money: a whole-unit `value`, a `fraction` counted in
//! millionths, and a currency code. Arithmetic never wraps and never
//! panics. Results that would leave the representable range come back
//! capped and flagged:
//!
//! | operation          | out of range        | result                         |
//! |--------------------|---------------------|--------------------------------|
//! | [`Amount::add`]    | value > 2^52        | maximum amount, `saturated`    |
//! | [`Amount::sub`]    | below zero          | zero, `saturated`              |
//! | [`Amount::checked_cmp`] | currency mismatch | `AmountError::CurrencyMismatch` |
//!
//! The textual form is `CURRENCY:VALUE[.FRACTION]`, e.g. `EUR:10.25`.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::config::{FRACTIONAL_BASE, FRACTIONAL_LENGTH, MAX_AMOUNT_VALUE};
use crate::error::AmountError;

/// A non-negative amount of one currency.
///
/// Constructed amounts are normalized (`fraction < FRACTIONAL_BASE`).
/// Deserialized ones may not be; every operation normalizes its inputs
/// first, so that is harmless.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Amount {
    pub value: u64,
    pub fraction: u32,
    pub currency: String,
}

/// Outcome of saturating arithmetic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Saturating {
    pub amount: Amount,
    /// `true` when the exact result was not representable and `amount` is
    /// the nearest bound instead.
    pub saturated: bool,
}

impl Saturating {
    fn exact(amount: Amount) -> Self {
        Self {
            amount,
            saturated: false,
        }
    }

    /// The amount, or `None` when it had to be capped.
    pub fn checked(self) -> Option<Amount> {
        (!self.saturated).then_some(self.amount)
    }
}

impl Amount {
    /// Build a normalized amount; an oversized fraction carries into
    /// `value`, and anything beyond the maximum is capped.
    pub fn new(currency: impl Into<String>, value: u64, fraction: u32) -> Self {
        let currency = currency.into();
        match value.checked_add(u64::from(fraction / FRACTIONAL_BASE)) {
            Some(value) if value <= MAX_AMOUNT_VALUE => {
                Self::raw(currency, value, fraction % FRACTIONAL_BASE)
            }
            _ => Self::max(currency),
        }
    }

    fn raw(currency: String, value: u64, fraction: u32) -> Self {
        Self {
            value,
            fraction,
            currency,
        }
    }

    pub fn zero(currency: impl Into<String>) -> Self {
        Self::raw(currency.into(), 0, 0)
    }

    /// The largest representable amount.
    pub fn max(currency: impl Into<String>) -> Self {
        Self::raw(currency.into(), MAX_AMOUNT_VALUE, FRACTIONAL_BASE - 1)
    }

    /// Whole units only.
    pub fn from_units(currency: impl Into<String>, value: u64) -> Self {
        Self::new(currency, value, 0)
    }

    pub fn currency(&self) -> &str {
        &self.currency
    }

    pub fn is_zero(&self) -> bool {
        self.value == 0 && self.fraction == 0
    }

    /// `(value, fraction)` with the fraction carried into the value.
    fn normalized(&self) -> (u64, u32) {
        let carry = u64::from(self.fraction / FRACTIONAL_BASE);
        (
            self.value.saturating_add(carry),
            self.fraction % FRACTIONAL_BASE,
        )
    }

    fn same_currency(&self, other: &Amount) -> Result<(), AmountError> {
        if self.currency == other.currency {
            Ok(())
        } else {
            Err(AmountError::CurrencyMismatch {
                left: self.currency.clone(),
                right: other.currency.clone(),
            })
        }
    }

    /// Saturating addition.
    pub fn add(&self, other: &Amount) -> Result<Saturating, AmountError> {
        self.same_currency(other)?;
        let (av, af) = self.normalized();
        let (bv, bf) = other.normalized();
        let fraction = af + bf;
        let value = av
            .checked_add(bv)
            .and_then(|v| v.checked_add(u64::from(fraction / FRACTIONAL_BASE)));
        match value {
            Some(value) if value <= MAX_AMOUNT_VALUE => Ok(Saturating::exact(Self::raw(
                self.currency.clone(),
                value,
                fraction % FRACTIONAL_BASE,
            ))),
            _ => Ok(Saturating {
                amount: Self::max(self.currency.clone()),
                saturated: true,
            }),
        }
    }

    /// Saturating subtraction; going below zero yields zero.
    pub fn sub(&self, other: &Amount) -> Result<Saturating, AmountError> {
        self.same_currency(other)?;
        let (mut value, mut fraction) = self.normalized();
        let (bv, bf) = other.normalized();
        if fraction < bf {
            if value == 0 {
                return Ok(self.underflow());
            }
            value -= 1;
            fraction += FRACTIONAL_BASE;
        }
        fraction -= bf;
        if value < bv {
            return Ok(self.underflow());
        }
        Ok(Saturating::exact(Self::raw(
            self.currency.clone(),
            value - bv,
            fraction,
        )))
    }

    fn underflow(&self) -> Saturating {
        Saturating {
            amount: Self::zero(self.currency.clone()),
            saturated: true,
        }
    }

    /// Add all of `items` to `self`, stopping at the first saturation.
    pub fn sum<'a>(&self, items: impl IntoIterator<Item = &'a Amount>) -> Result<Saturating, AmountError> {
        let mut acc = Saturating::exact(self.clone());
        for item in items {
            acc = acc.amount.add(item)?;
            if acc.saturated {
                break;
            }
        }
        Ok(acc)
    }

    /// Order two amounts of the same currency.
    pub fn checked_cmp(&self, other: &Amount) -> Result<Ordering, AmountError> {
        self.same_currency(other)?;
        Ok(self.normalized().cmp(&other.normalized()))
    }

    /// Split into `n` equal parts, rounding the fraction down.
    pub fn divide(&self, n: u32) -> Result<Amount, AmountError> {
        if n == 0 {
            return Err(AmountError::DivisionByZero);
        }
        let (value, fraction) = self.normalized();
        let n64 = u64::from(n);
        let remainder = value % n64;
        let fraction = (remainder * u64::from(FRACTIONAL_BASE) + u64::from(fraction)) / n64;
        Ok(Self::raw(self.currency.clone(), value / n64, fraction as u32))
    }

    /// Parse `CURRENCY:VALUE[.FRACTION]`.
    pub fn parse(s: &str) -> Result<Amount, AmountError> {
        let invalid = || AmountError::Parse(s.to_string());
        let (currency, number) = s.split_once(':').ok_or_else(invalid)?;
        let currency_ok = !currency.is_empty()
            && currency
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '*' | '-'));
        if !currency_ok {
            return Err(invalid());
        }
        let (whole, tail) = match number.split_once('.') {
            Some((whole, tail)) if !tail.is_empty() => (whole, tail),
            Some(_) => return Err(invalid()),
            None => (number, ""),
        };
        if whole.is_empty()
            || !whole.bytes().all(|b| b.is_ascii_digit())
            || !tail.bytes().all(|b| b.is_ascii_digit())
            || tail.len() > FRACTIONAL_LENGTH
        {
            return Err(invalid());
        }
        let value: u64 = whole.parse().map_err(|_| invalid())?;
        if value > MAX_AMOUNT_VALUE {
            return Err(invalid());
        }
        let fraction = if tail.is_empty() {
            0
        } else {
            let digits: u32 = tail.parse().map_err(|_| invalid())?;
            digits * 10u32.pow((FRACTIONAL_LENGTH - tail.len()) as u32)
        };
        Ok(Self::raw(currency.to_string(), value, fraction))
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (value, fraction) = self.normalized();
        write!(f, "{}:{}", self.currency, value)?;
        if fraction > 0 {
            let digits = format!("{:0width$}", fraction, width = FRACTIONAL_LENGTH);
            write!(f, ".{}", digits.trim_end_matches('0'))?;
        }
        Ok(())
    }
}

impl fmt::Debug for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Amount({})", self)
    }
}

impl FromStr for Amount {
    type Err = AmountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Amount::parse(s)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn eur(value: u64, fraction: u32) -> Amount {
        Amount::new("EUR", value, fraction)
    }

    #[test]
    fn add_carries_the_fraction() {
        let r = eur(1, 999_999).add(&eur(0, 1)).unwrap();
        assert_eq!(r.amount, eur(2, 0));
        assert!(!r.saturated);
    }

    #[test]
    fn sub_below_zero_saturates_at_zero() {
        let r = eur(0, 0).sub(&eur(1, 0)).unwrap();
        assert!(r.saturated);
        assert!(r.amount.is_zero());

        let r = eur(1, 0).sub(&eur(0, 500_000)).unwrap();
        assert_eq!(r.amount, eur(0, 500_000));
        assert!(!r.saturated);
    }

    #[test]
    fn add_to_maximum_is_capped_not_wrapped() {
        let r = Amount::max("EUR").add(&eur(0, 1)).unwrap();
        assert!(r.saturated);
        assert_eq!(r.amount, Amount::max("EUR"));
        assert!(r.clone().checked().is_none());

        let r = eur(u64::MAX, 0).add(&eur(u64::MAX, 0)).unwrap();
        assert!(r.saturated);
    }

    #[test]
    fn currency_mismatch_is_an_error() {
        let usd = Amount::from_units("USD", 1);
        assert!(matches!(
            eur(1, 0).checked_cmp(&usd),
            Err(AmountError::CurrencyMismatch { .. })
        ));
        assert!(eur(1, 0).add(&usd).is_err());
        assert!(eur(1, 0).sub(&usd).is_err());
    }

    #[test]
    fn unnormalized_inputs_compare_by_value() {
        let loose = Amount {
            value: 1,
            fraction: 1_500_000,
            currency: "EUR".into(),
        };
        assert_eq!(loose.checked_cmp(&eur(2, 500_000)).unwrap(), Ordering::Equal);
        assert_eq!(Amount::new("EUR", 0, 2_000_001), eur(2, 1));
    }

    #[test]
    fn parse_and_display() {
        assert_eq!(Amount::parse("EUR:10").unwrap(), eur(10, 0));
        assert_eq!(Amount::parse("EUR:1.5").unwrap(), eur(1, 500_000));
        assert_eq!(Amount::parse("KUDOS:0.000001").unwrap(), Amount::new("KUDOS", 0, 1));
        assert_eq!("EUR:3.25".parse::<Amount>().unwrap().to_string(), "EUR:3.25");
        assert_eq!(eur(7, 0).to_string(), "EUR:7");
        assert_eq!(eur(0, 10).to_string(), "EUR:0.00001");

        for bad in ["EUR", "EUR:", ":1", "EUR:1.", "EUR:1.1234567", "EUR:-1", "E R:1", "EUR:1.x"] {
            assert!(Amount::parse(bad).is_err(), "{bad} should not parse");
        }
    }

    #[test]
    fn divide_rounds_down() {
        assert_eq!(eur(10, 0).divide(4).unwrap(), eur(2, 500_000));
        assert_eq!(eur(1, 0).divide(3).unwrap(), eur(0, 333_333));
        assert!(eur(1, 0).divide(0).is_err());
    }

    #[test]
    fn sum_stops_at_saturation() {
        let items = vec![eur(1, 0), eur(2, 250_000)];
        let r = Amount::zero("EUR").sum(&items).unwrap();
        assert_eq!(r.amount, eur(3, 250_000));
        let r = Amount::max("EUR").sum(&items).unwrap();
        assert!(r.saturated);
    }

    fn arb_amount() -> impl Strategy<Value = Amount> {
        (0u64..1_000_000_000, 0u32..FRACTIONAL_BASE).prop_map(|(v, f)| eur(v, f))
    }

    proptest! {
        #[test]
        fn add_is_commutative(a in arb_amount(), b in arb_amount()) {
            prop_assert_eq!(a.add(&b).unwrap(), b.add(&a).unwrap());
        }

        #[test]
        fn sub_undoes_add(a in arb_amount(), b in arb_amount()) {
            let sum = a.add(&b).unwrap().amount;
            let back = sum.sub(&b).unwrap();
            prop_assert!(!back.saturated);
            prop_assert_eq!(back.amount, a);
        }

        #[test]
        fn display_parses_back(a in arb_amount()) {
            prop_assert_eq!(Amount::parse(&a.to_string()).unwrap(), a);
        }
    }
}
