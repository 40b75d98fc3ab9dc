//! Money Module
//!
//! Decimal amounts paired with an ISO-4217 style currency code. All amounts
//! entering the saga go through [`Money::new`], so the rest of the crate can
//! assume a positive value with at most [`MAX_SCALE`] decimal places.

use std::fmt;
use std::str::FromStr;

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum decimal places carried by a money amount (cents).
pub const MAX_SCALE: u32 = 2;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MoneyError {
    #[error("Invalid currency code: {0}")]
    InvalidCurrency(String),

    #[error("Amount must be greater than zero")]
    NonPositive,

    #[error("Precision overflow: provided {provided} decimals, max allowed {max}")]
    PrecisionOverflow { provided: u32, max: u32 },
}

/// Three-letter upper-case currency code, e.g. `MOP`, `HKD`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CurrencyCode(String);

impl CurrencyCode {
    pub fn parse(code: &str) -> Result<Self, MoneyError> {
        let code = code.trim();
        if code.len() == 3 && code.bytes().all(|b| b.is_ascii_uppercase()) {
            Ok(Self(code.to_string()))
        } else {
            Err(MoneyError::InvalidCurrency(code.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CurrencyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for CurrencyCode {
    type Err = MoneyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for CurrencyCode {
    type Error = MoneyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<CurrencyCode> for String {
    fn from(code: CurrencyCode) -> Self {
        code.0
    }
}

/// A strictly positive amount in a given currency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Money {
    amount: Decimal,
    currency: CurrencyCode,
}

impl Money {
    /// Validate and build a money value.
    ///
    /// # Errors
    /// * `NonPositive` - amount is zero or negative
    /// * `PrecisionOverflow` - more than [`MAX_SCALE`] decimal places
    pub fn new(amount: Decimal, currency: CurrencyCode) -> Result<Self, MoneyError> {
        if amount <= Decimal::ZERO {
            return Err(MoneyError::NonPositive);
        }
        let normalized = amount.normalize();
        if normalized.scale() > MAX_SCALE {
            return Err(MoneyError::PrecisionOverflow {
                provided: normalized.scale(),
                max: MAX_SCALE,
            });
        }
        Ok(Self { amount, currency })
    }

    #[inline]
    pub fn amount(&self) -> Decimal {
        self.amount
    }

    #[inline]
    pub fn currency(&self) -> &CurrencyCode {
        &self.currency
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", to_cents(self.amount), self.currency)
    }
}

/// Round half-up to cents.
pub fn round_money(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(MAX_SCALE, RoundingStrategy::MidpointAwayFromZero)
}

/// Round half-up and pin the scale to exactly two places (`12.5` -> `12.50`).
pub fn to_cents(value: Decimal) -> Decimal {
    let mut rounded = round_money(value);
    rounded.rescale(MAX_SCALE);
    rounded
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use std::str::FromStr;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[test]
    fn test_currency_code_parse() {
        assert_eq!(CurrencyCode::parse("MOP").unwrap().as_str(), "MOP");
        assert!(CurrencyCode::parse("mop").is_err());
        assert!(CurrencyCode::parse("MOPX").is_err());
        assert!(CurrencyCode::parse("").is_err());
    }

    #[test]
    fn test_money_rejects_non_positive() {
        let mop = CurrencyCode::parse("MOP").unwrap();
        assert_eq!(
            Money::new(Decimal::ZERO, mop.clone()),
            Err(MoneyError::NonPositive)
        );
        assert_eq!(Money::new(dec("-1"), mop), Err(MoneyError::NonPositive));
    }

    #[test]
    fn test_money_precision() {
        let hkd = CurrencyCode::parse("HKD").unwrap();
        assert!(Money::new(dec("10.25"), hkd.clone()).is_ok());
        // Trailing zeros do not count against the scale
        assert!(Money::new(dec("10.2500"), hkd.clone()).is_ok());
        assert_eq!(
            Money::new(dec("10.255"), hkd),
            Err(MoneyError::PrecisionOverflow {
                provided: 3,
                max: 2
            })
        );
    }

    #[test]
    fn test_round_half_up() {
        assert_eq!(round_money(dec("1.005")), dec("1.01"));
        assert_eq!(round_money(dec("1.004")), dec("1.00"));
        assert_eq!(to_cents(dec("12.5")).to_string(), "12.50");
    }

    #[test]
    fn test_currency_serde() {
        let json = serde_json::to_string(&CurrencyCode::parse("USD").unwrap()).unwrap();
        assert_eq!(json, "\"USD\"");
        assert!(serde_json::from_str::<CurrencyCode>("\"usd\"").is_err());
    }
}
