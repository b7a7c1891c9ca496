//! Monetary amounts.

use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// An amount in cents.
///
/// Gateways charge in minor units, so the cent amount is passed through
/// unchanged when a charge is created. Arithmetic is checked and reports
/// `DomainError::AmountOverflow` instead of wrapping.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct Money(i64);

impl Money {
    pub const fn from_cents(cents: i64) -> Self {
        Self(cents)
    }

    /// Whole dollars, for literals in configuration and tests.
    pub const fn from_dollars(dollars: i64) -> Self {
        Self(dollars * 100)
    }

    pub const fn zero() -> Self {
        Self(0)
    }

    pub fn cents(&self) -> i64 {
        self.0
    }

    pub fn checked_add(self, other: Money) -> Result<Money, DomainError> {
        self.0
            .checked_add(other.0)
            .map(Money)
            .ok_or(DomainError::AmountOverflow)
    }

    /// Price of `quantity` units at this unit price.
    pub fn multiply(self, quantity: u32) -> Result<Money, DomainError> {
        self.0
            .checked_mul(i64::from(quantity))
            .map(Money)
            .ok_or(DomainError::AmountOverflow)
    }
}

impl std::fmt::Display for Money {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let cents = self.0.unsigned_abs();
        write!(f, "{sign}${}.{:02}", cents / 100, cents % 100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_as_dollars() {
        assert_eq!(Money::from_dollars(50).to_string(), "$50.00");
        assert_eq!(Money::from_cents(1005).to_string(), "$10.05");
        assert_eq!(Money::from_cents(-250).to_string(), "-$2.50");
        assert_eq!(Money::from_cents(i64::MIN).to_string(), "-$92233720368547758.08");
    }

    #[test]
    fn test_line_arithmetic() {
        let unit = Money::from_dollars(10);
        assert_eq!(unit.multiply(3).unwrap(), Money::from_dollars(30));
        assert_eq!(
            unit.checked_add(Money::from_cents(99)).unwrap().cents(),
            1099
        );
    }

    #[test]
    fn test_overflow_is_an_error() {
        let huge = Money::from_cents(i64::MAX / 2 + 1);
        assert!(matches!(huge.multiply(2), Err(DomainError::AmountOverflow)));
        assert!(matches!(
            huge.checked_add(huge),
            Err(DomainError::AmountOverflow)
        ));
    }

    #[test]
    fn test_serialized_as_plain_cents() {
        assert_eq!(serde_json::to_string(&Money::from_cents(999)).unwrap(), "999");
        let back: Money = serde_json::from_str("4200").unwrap();
        assert_eq!(back, Money::from_dollars(42));
    }
}
