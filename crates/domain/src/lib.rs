//! Domain model for the order workflow system.
//!
//! This crate provides the records the workflow pipelines move together:
//! - `Product` with its stock counter
//! - `Order` with its status machine and embedded payment summary
//! - `Payment` with its status machine
//! - `Money` and the pluggable shipping-fee policies used for pricing

pub mod error;
pub mod money;
pub mod order;
pub mod payment;
pub mod product;
pub mod shipping;

pub use common::{OrderId, PaymentId, UserId};
pub use error::DomainError;
pub use money::Money;
pub use order::{Order, OrderLine, OrderStatus, PaymentSummary, Pricing};
pub use payment::{DEFAULT_CURRENCY, Payment, PaymentStatus, PaymentType};
pub use product::{Product, ProductId};
pub use shipping::{FlatRate, FreeShippingOver, ShippingPolicy};

/// Outcome of applying a status change to a record.
///
/// Status changes driven by an external gateway can arrive more than once
/// and out of order, so "nothing to do" is a normal result and not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The record changed.
    Applied,
    /// The record already had the requested status.
    Unchanged,
    /// The change would move the record backwards and was not applied.
    Stale,
}

impl Transition {
    /// Returns true if the record changed.
    pub fn is_applied(&self) -> bool {
        matches!(self, Transition::Applied)
    }
}
