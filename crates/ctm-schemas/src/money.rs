//! Integer minor-unit money.
//!
//! All amounts are `i64` minor units (cents, centavos) tagged with a
//! currency. No `f64` appears anywhere on the money path; gateway and
//! persistence boundaries exchange minor-unit integers only.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// ISO-4217 currency tag. One charge carries exactly one currency;
/// cross-currency arithmetic is a hard error, not a conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Currency {
    Brl,
    Usd,
    Eur,
}

impl Currency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Currency::Brl => "BRL",
            Currency::Usd => "USD",
            Currency::Eur => "EUR",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "BRL" => Some(Currency::Brl),
            "USD" => Some(Currency::Usd),
            "EUR" => Some(Currency::Eur),
            _ => None,
        }
    }
}

impl std::fmt::Display for Currency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An amount of money in integer minor units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Money {
    minor_units: i64,
    currency: Currency,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MoneyError {
    #[error("amount must be positive, got {minor_units} minor units")]
    NonPositiveAmount { minor_units: i64 },
    #[error("currency mismatch: {left} vs {right}")]
    CurrencyMismatch { left: Currency, right: Currency },
    #[error("amount overflow")]
    Overflow,
    #[error("cannot total an empty item set")]
    EmptyAmountSet,
}

impl Money {
    pub fn new(minor_units: i64, currency: Currency) -> Self {
        Self {
            minor_units,
            currency,
        }
    }

    /// A positive amount; the constructor used on every input boundary.
    pub fn positive(minor_units: i64, currency: Currency) -> Result<Self, MoneyError> {
        if minor_units <= 0 {
            return Err(MoneyError::NonPositiveAmount { minor_units });
        }
        Ok(Self::new(minor_units, currency))
    }

    pub fn minor_units(&self) -> i64 {
        self.minor_units
    }

    pub fn currency(&self) -> Currency {
        self.currency
    }

    /// Same-currency checked addition.
    pub fn checked_add(self, other: Money) -> Result<Money, MoneyError> {
        if self.currency != other.currency {
            return Err(MoneyError::CurrencyMismatch {
                left: self.currency,
                right: other.currency,
            });
        }
        let minor_units = self
            .minor_units
            .checked_add(other.minor_units)
            .ok_or(MoneyError::Overflow)?;
        Ok(Money {
            minor_units,
            currency: self.currency,
        })
    }

    /// Same-currency comparison. Cross-currency ordering does not exist.
    pub fn try_cmp(&self, other: &Money) -> Result<Ordering, MoneyError> {
        if self.currency != other.currency {
            return Err(MoneyError::CurrencyMismatch {
                left: self.currency,
                right: other.currency,
            });
        }
        Ok(self.minor_units.cmp(&other.minor_units))
    }
}

impl std::fmt::Display for Money {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.minor_units, self.currency)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positive_rejects_zero_and_negative() {
        assert!(Money::positive(1, Currency::Brl).is_ok());
        assert!(matches!(
            Money::positive(0, Currency::Brl),
            Err(MoneyError::NonPositiveAmount { minor_units: 0 })
        ));
        assert!(Money::positive(-100, Currency::Brl).is_err());
    }

    #[test]
    fn add_same_currency() {
        let a = Money::new(20_000, Currency::Brl);
        let b = Money::new(5_000, Currency::Brl);
        assert_eq!(a.checked_add(b).unwrap(), Money::new(25_000, Currency::Brl));
    }

    #[test]
    fn add_mixed_currency_fails() {
        let a = Money::new(100, Currency::Brl);
        let b = Money::new(100, Currency::Usd);
        assert!(matches!(
            a.checked_add(b),
            Err(MoneyError::CurrencyMismatch { .. })
        ));
    }

    #[test]
    fn add_overflow_is_an_error_not_a_wrap() {
        let a = Money::new(i64::MAX, Currency::Brl);
        let b = Money::new(1, Currency::Brl);
        assert!(matches!(a.checked_add(b), Err(MoneyError::Overflow)));
    }

    #[test]
    fn cmp_same_currency_only() {
        let a = Money::new(100, Currency::Brl);
        let b = Money::new(200, Currency::Brl);
        assert_eq!(a.try_cmp(&b).unwrap(), Ordering::Less);
        let c = Money::new(100, Currency::Usd);
        assert!(a.try_cmp(&c).is_err());
    }
}
