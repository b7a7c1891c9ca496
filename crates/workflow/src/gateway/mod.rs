//! Payment gateway abstraction.

mod memory;
pub mod webhook;

use std::collections::BTreeMap;

use async_trait::async_trait;
use domain::{Money, PaymentStatus, PaymentType};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use memory::InMemoryPaymentGateway;

/// Errors reported by the payment gateway.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Payment method not found: {0}")]
    PaymentMethodNotFound(String),

    #[error("Card declined: {0}")]
    Declined(String),

    /// The gateway could not be reached or answered with a server error.
    #[error("Payment gateway unavailable: {0}")]
    Unavailable(String),

    #[error("Payment gateway timed out")]
    Timeout,

    #[error("Invalid webhook signature: {0}")]
    InvalidSignature(String),

    #[error("Malformed webhook payload: {0}")]
    MalformedPayload(String),
}

impl GatewayError {
    /// Returns true for transient failures worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, GatewayError::Unavailable(_) | GatewayError::Timeout)
    }
}

/// A stored payment method.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentMethod {
    pub id: String,
    /// Gateway type string, e.g. `card`.
    pub kind: String,
}

impl PaymentMethod {
    pub fn payment_type(&self) -> PaymentType {
        PaymentType::from_gateway(&self.kind)
    }
}

/// Parameters of a charge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChargeRequest {
    /// Amount in minor units.
    pub amount: Money,
    pub currency: String,
    pub payment_method_id: String,
    /// Requests with the same key return the charge created by the first one.
    pub idempotency_key: String,
    pub metadata: BTreeMap<String, String>,
}

/// Status of a charge as far as the payment record is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChargeStatus {
    Succeeded,
    Pending,
    Failed,
}

impl ChargeStatus {
    /// Maps a gateway intent status.
    ///
    /// `requires_payment_method` and `canceled` are failures; every state
    /// that can still complete is pending.
    pub fn from_gateway(status: &str) -> Self {
        match status {
            "succeeded" => ChargeStatus::Succeeded,
            "requires_payment_method" | "canceled" => ChargeStatus::Failed,
            _ => ChargeStatus::Pending,
        }
    }
}

impl From<ChargeStatus> for PaymentStatus {
    fn from(status: ChargeStatus) -> Self {
        match status {
            ChargeStatus::Succeeded => PaymentStatus::Succeeded,
            ChargeStatus::Pending => PaymentStatus::Pending,
            ChargeStatus::Failed => PaymentStatus::Failed,
        }
    }
}

/// A charge created at the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Charge {
    /// Gateway transaction id. Webhook events refer to it.
    pub id: String,
    pub status: ChargeStatus,
}

/// What a webhook event reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayEventKind {
    PaymentSucceeded {
        transaction_id: String,
    },
    PaymentFailed {
        transaction_id: String,
    },
    ChargeRefunded {
        transaction_id: String,
        /// Cumulative amount refunded so far.
        amount_refunded: Money,
    },
    /// An event type nothing reacts to.
    Other {
        event_type: String,
    },
}

impl GatewayEventKind {
    pub fn transaction_id(&self) -> Option<&str> {
        match self {
            GatewayEventKind::PaymentSucceeded { transaction_id }
            | GatewayEventKind::PaymentFailed { transaction_id }
            | GatewayEventKind::ChargeRefunded { transaction_id, .. } => Some(transaction_id),
            GatewayEventKind::Other { .. } => None,
        }
    }

    pub fn event_type(&self) -> &str {
        match self {
            GatewayEventKind::PaymentSucceeded { .. } => "payment_intent.succeeded",
            GatewayEventKind::PaymentFailed { .. } => "payment_intent.payment_failed",
            GatewayEventKind::ChargeRefunded { .. } => "charge.refunded",
            GatewayEventKind::Other { event_type } => event_type,
        }
    }
}

/// A verified webhook event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayEvent {
    pub id: String,
    pub kind: GatewayEventKind,
}

/// Trait for payment gateway operations.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Looks up a stored payment method.
    async fn retrieve_payment_method(&self, id: &str) -> Result<PaymentMethod, GatewayError>;

    /// Creates and confirms a charge.
    async fn create_charge(&self, request: ChargeRequest) -> Result<Charge, GatewayError>;

    /// Verifies a webhook signature and parses the payload. Fails closed.
    fn verify_webhook(&self, payload: &[u8], signature: &str) -> Result<GatewayEvent, GatewayError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_charge_status_mapping() {
        assert_eq!(ChargeStatus::from_gateway("succeeded"), ChargeStatus::Succeeded);
        assert_eq!(
            ChargeStatus::from_gateway("requires_payment_method"),
            ChargeStatus::Failed
        );
        assert_eq!(ChargeStatus::from_gateway("canceled"), ChargeStatus::Failed);
        assert_eq!(ChargeStatus::from_gateway("processing"), ChargeStatus::Pending);
        assert_eq!(ChargeStatus::from_gateway("requires_action"), ChargeStatus::Pending);
        assert_eq!(
            PaymentStatus::from(ChargeStatus::Failed),
            PaymentStatus::Failed
        );
    }

    #[test]
    fn test_payment_method_type() {
        let method = PaymentMethod {
            id: "pm_1".to_string(),
            kind: "card".to_string(),
        };
        assert_eq!(method.payment_type(), PaymentType::Card);

        let method = PaymentMethod {
            id: "pm_2".to_string(),
            kind: "sepa_debit".to_string(),
        };
        assert_eq!(method.payment_type(), PaymentType::Other);
    }

    #[test]
    fn test_only_transient_errors_are_retryable() {
        assert!(GatewayError::Timeout.is_retryable());
        assert!(GatewayError::Unavailable("503".to_string()).is_retryable());
        assert!(!GatewayError::Declined("insufficient_funds".to_string()).is_retryable());
        assert!(!GatewayError::InvalidSignature("bad".to_string()).is_retryable());
    }
}
