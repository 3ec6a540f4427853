//! Shared value types for the centime billing core.
//!
//! Everything here is a plain serde-able value: no I/O, no async, no
//! business rules beyond the invariants the types themselves carry
//! (positive amounts, single-currency arithmetic).

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod money;

pub use money::{Currency, Money, MoneyError};

// ---------------------------------------------------------------------------
// Gateway identity
// ---------------------------------------------------------------------------

/// Which payment gateway a charge was (or will be) submitted to.
///
/// Only the gateway adapter crates and the migration coordinator are allowed
/// to branch on this value; everything else treats it as an opaque tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GatewayVariant {
    Current,
    Legacy,
}

impl GatewayVariant {
    pub fn as_str(&self) -> &'static str {
        match self {
            GatewayVariant::Current => "CURRENT",
            GatewayVariant::Legacy => "LEGACY",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "CURRENT" | "current" => Some(GatewayVariant::Current),
            "LEGACY" | "legacy" => Some(GatewayVariant::Legacy),
            _ => None,
        }
    }
}

impl std::fmt::Display for GatewayVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-customer routing assignment maintained by the migration coordinator.
///
/// `Dual` is the migration window: historical charges may live on either
/// gateway, new charges route to CURRENT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GatewayAssignment {
    Current,
    Legacy,
    Dual,
}

impl GatewayAssignment {
    pub fn as_str(&self) -> &'static str {
        match self {
            GatewayAssignment::Current => "CURRENT",
            GatewayAssignment::Legacy => "LEGACY",
            GatewayAssignment::Dual => "DUAL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "CURRENT" => Some(GatewayAssignment::Current),
            "LEGACY" => Some(GatewayAssignment::Legacy),
            "DUAL" => Some(GatewayAssignment::Dual),
            _ => None,
        }
    }

    /// New charges for a customer with this assignment go to this gateway.
    pub fn routes_to(&self) -> GatewayVariant {
        match self {
            GatewayAssignment::Current | GatewayAssignment::Dual => GatewayVariant::Current,
            GatewayAssignment::Legacy => GatewayVariant::Legacy,
        }
    }
}

impl std::fmt::Display for GatewayAssignment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Billing type
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BillingType {
    OneTime,
    Recurring,
}

impl BillingType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingType::OneTime => "ONE_TIME",
            BillingType::Recurring => "RECURRING",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ONE_TIME" => Some(BillingType::OneTime),
            "RECURRING" => Some(BillingType::Recurring),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Customer
// ---------------------------------------------------------------------------

/// The customer fields this core needs: identity, the contact/document data
/// gateways require on submission, and the migration routing state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Customer {
    pub customer_id: Uuid,
    pub name: String,
    pub email: String,
    pub tax_id: String,
    pub phone: String,
    pub gateway_assignment: GatewayAssignment,
    pub legacy_external_id: Option<String>,
    pub current_external_id: Option<String>,
    pub created_at_utc: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Products and charge items
// ---------------------------------------------------------------------------

/// Identity-only reference to a product owned by another service.
///
/// The core never needs the product's shape, only its identity for the
/// existence check and the gateway line-item description.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProductRef {
    pub product_type: String,
    pub product_id: i64,
}

impl ProductRef {
    pub fn new(product_type: impl Into<String>, product_id: i64) -> Self {
        Self {
            product_type: product_type.into(),
            product_id,
        }
    }
}

impl std::fmt::Display for ProductRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.product_type, self.product_id)
    }
}

/// One priced line within a charge. Immutable once the charge is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChargeItem {
    pub product: ProductRef,
    pub amount: Money,
}

impl ChargeItem {
    /// Build an item, rejecting non-positive amounts.
    pub fn new(product: ProductRef, amount: Money) -> Result<Self, MoneyError> {
        if amount.minor_units() <= 0 {
            return Err(MoneyError::NonPositiveAmount {
                minor_units: amount.minor_units(),
            });
        }
        Ok(Self { product, amount })
    }
}

/// Sum a set of charge items into a single total.
///
/// Fails if the set is empty, any amount is non-positive, or the items do
/// not share one currency.
pub fn total_of(items: &[ChargeItem]) -> Result<Money, MoneyError> {
    let mut iter = items.iter();
    let first = iter.next().ok_or(MoneyError::EmptyAmountSet)?;
    let mut total = first.amount;
    for item in iter {
        total = total.checked_add(item.amount)?;
    }
    if total.minor_units() <= 0 {
        return Err(MoneyError::NonPositiveAmount {
            minor_units: total.minor_units(),
        });
    }
    Ok(total)
}

/// Due date is a calendar date; gateways receive it as ISO-8601.
pub type DueDate = NaiveDate;

#[cfg(test)]
mod tests {
    use super::*;

    fn brl(minor: i64) -> Money {
        Money::new(minor, Currency::Brl)
    }

    #[test]
    fn assignment_routing_matches_contract() {
        assert_eq!(GatewayAssignment::Current.routes_to(), GatewayVariant::Current);
        assert_eq!(GatewayAssignment::Dual.routes_to(), GatewayVariant::Current);
        assert_eq!(GatewayAssignment::Legacy.routes_to(), GatewayVariant::Legacy);
    }

    #[test]
    fn item_rejects_non_positive_amount() {
        let err = ChargeItem::new(ProductRef::new("PMS", 1), brl(0)).unwrap_err();
        assert!(matches!(err, MoneyError::NonPositiveAmount { .. }));
        let err = ChargeItem::new(ProductRef::new("PMS", 1), brl(-5)).unwrap_err();
        assert!(matches!(err, MoneyError::NonPositiveAmount { .. }));
    }

    #[test]
    fn total_sums_items() {
        let items = vec![
            ChargeItem::new(ProductRef::new("PMS", 1), brl(20_000)).unwrap(),
            ChargeItem::new(ProductRef::new("Motor", 2), brl(5_000)).unwrap(),
        ];
        assert_eq!(total_of(&items).unwrap(), brl(25_000));
    }

    #[test]
    fn total_of_empty_set_is_rejected() {
        assert!(matches!(total_of(&[]), Err(MoneyError::EmptyAmountSet)));
    }

    #[test]
    fn total_rejects_mixed_currencies() {
        let items = vec![
            ChargeItem::new(ProductRef::new("PMS", 1), brl(100)).unwrap(),
            ChargeItem::new(ProductRef::new("PMS", 2), Money::new(100, Currency::Usd)).unwrap(),
        ];
        assert!(matches!(
            total_of(&items),
            Err(MoneyError::CurrencyMismatch { .. })
        ));
    }

    #[test]
    fn variant_round_trips_through_str() {
        for v in [GatewayVariant::Current, GatewayVariant::Legacy] {
            assert_eq!(GatewayVariant::parse(v.as_str()), Some(v));
        }
        for a in [
            GatewayAssignment::Current,
            GatewayAssignment::Legacy,
            GatewayAssignment::Dual,
        ] {
            assert_eq!(GatewayAssignment::parse(a.as_str()), Some(a));
        }
        assert_eq!(GatewayVariant::parse("SANDBOX"), None);
    }
}
