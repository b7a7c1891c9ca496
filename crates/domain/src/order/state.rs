//! Order status machine.

use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// The status of an order in its lifecycle.
///
/// State transitions:
/// ```text
/// Pending ──┬──► Processing ──► Shipped ──► Delivered ──► Completed
///           │        ▲
///           └──► PaymentFailed
///
/// Pending | Processing ──► Cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    /// Order placed, awaiting payment.
    #[default]
    Pending,

    /// Payment confirmed, order is being fulfilled.
    Processing,

    Shipped,

    Delivered,

    /// Order has been completed (terminal state).
    Completed,

    /// Order was cancelled (terminal state).
    Cancelled,

    /// The gateway reported the payment as failed. A later successful
    /// payment can still move the order to `Processing`.
    PaymentFailed,
}

impl OrderStatus {
    /// Returns true if a new payment may be initiated in this state.
    pub fn can_accept_payment(&self) -> bool {
        matches!(self, OrderStatus::Pending)
    }

    /// Returns true if a payment success can move the order to `Processing`.
    pub fn can_mark_paid(&self) -> bool {
        matches!(self, OrderStatus::Pending | OrderStatus::PaymentFailed)
    }

    /// Returns true if the order is already past payment.
    pub fn is_paid(&self) -> bool {
        matches!(
            self,
            OrderStatus::Processing
                | OrderStatus::Shipped
                | OrderStatus::Delivered
                | OrderStatus::Completed
        )
    }

    /// Returns the status name as stored and serialized.
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Processing => "processing",
            OrderStatus::Shipped => "shipped",
            OrderStatus::Delivered => "delivered",
            OrderStatus::Completed => "completed",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::PaymentFailed => "payment_failed",
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for OrderStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OrderStatus::Pending),
            "processing" => Ok(OrderStatus::Processing),
            "shipped" => Ok(OrderStatus::Shipped),
            "delivered" => Ok(OrderStatus::Delivered),
            "completed" => Ok(OrderStatus::Completed),
            "cancelled" => Ok(OrderStatus::Cancelled),
            "payment_failed" => Ok(OrderStatus::PaymentFailed),
            other => Err(DomainError::UnknownVariant {
                kind: "order status",
                value: other.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [OrderStatus; 7] = [
        OrderStatus::Pending,
        OrderStatus::Processing,
        OrderStatus::Shipped,
        OrderStatus::Delivered,
        OrderStatus::Completed,
        OrderStatus::Cancelled,
        OrderStatus::PaymentFailed,
    ];

    #[test]
    fn test_default_status_is_pending() {
        assert_eq!(OrderStatus::default(), OrderStatus::Pending);
    }

    #[test]
    fn test_only_pending_accepts_payment() {
        for status in ALL {
            assert_eq!(status.can_accept_payment(), status == OrderStatus::Pending);
        }
    }

    #[test]
    fn test_can_mark_paid() {
        assert!(OrderStatus::Pending.can_mark_paid());
        assert!(OrderStatus::PaymentFailed.can_mark_paid());
        assert!(!OrderStatus::Processing.can_mark_paid());
        assert!(!OrderStatus::Cancelled.can_mark_paid());
    }

    #[test]
    fn test_string_form_matches_serde() {
        for status in ALL {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status.as_str()));
            assert_eq!(status.as_str().parse::<OrderStatus>().unwrap(), status);
        }
        assert!("refunded".parse::<OrderStatus>().is_err());
    }
}
