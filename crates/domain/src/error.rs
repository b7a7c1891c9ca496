//! Domain error types.

use thiserror::Error;

use crate::order::OrderStatus;
use crate::product::ProductId;

/// Errors raised by domain rules.
#[derive(Debug, Error)]
pub enum DomainError {
    /// An order must contain at least one line.
    #[error("Order has no items")]
    EmptyOrder,

    /// Quantities must be positive.
    #[error("Invalid quantity {quantity} for product {product_id} (must be greater than 0)")]
    InvalidQuantity { product_id: ProductId, quantity: u32 },

    /// The order is not in a state that allows the requested action.
    #[error("Invalid state transition: cannot {action} from {current} state")]
    InvalidStateTransition {
        current: OrderStatus,
        action: &'static str,
    },

    /// A price computation left the representable range.
    #[error("Amount out of range")]
    AmountOverflow,

    /// A persisted status or type string was not recognised.
    #[error("Unknown {kind}: {value}")]
    UnknownVariant { kind: &'static str, value: String },
}
