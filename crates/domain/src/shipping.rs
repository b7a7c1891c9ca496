//! Shipping-fee policies applied when an order is priced.

use crate::order::OrderLine;
use crate::money::Money;

/// Computes the shipping fee for an order.
pub trait ShippingPolicy: Send + Sync + std::fmt::Debug {
    /// Returns the fee for an order with the given subtotal and lines.
    fn fee(&self, subtotal: Money, lines: &[OrderLine]) -> Money;
}

/// The same fee for every order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlatRate(pub Money);

impl ShippingPolicy for FlatRate {
    fn fee(&self, _subtotal: Money, _lines: &[OrderLine]) -> Money {
        self.0
    }
}

/// A flat fee that is waived once the subtotal reaches a threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeShippingOver {
    pub threshold: Money,
    pub fee: Money,
}

impl ShippingPolicy for FreeShippingOver {
    fn fee(&self, subtotal: Money, _lines: &[OrderLine]) -> Money {
        if subtotal >= self.threshold {
            Money::zero()
        } else {
            self.fee
        }
    }
}
