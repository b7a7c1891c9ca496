//! Payment status machine and payment types.

use serde::{Deserialize, Serialize};

use crate::Transition;
use crate::error::DomainError;

/// The status of a payment as reported by the gateway.
///
/// State transitions:
/// ```text
/// Pending ──┬──► Succeeded ──► PartiallyRefunded ──► Refunded
///           │        ▲    └────────────────────────────▲
///           └──► Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    #[default]
    Pending,
    Succeeded,
    Failed,
    Refunded,
    PartiallyRefunded,
}

impl PaymentStatus {
    /// Classifies a move from `self` to `next`.
    ///
    /// Moving to the current status is `Unchanged`; moves the lifecycle does
    /// not allow (e.g. a late failure after success) are `Stale`.
    pub fn transition_to(&self, next: PaymentStatus) -> Transition {
        use PaymentStatus::*;

        if *self == next && next != PartiallyRefunded {
            return Transition::Unchanged;
        }

        let allowed = matches!(
            (self, next),
            (Pending, Succeeded | Failed)
                | (Failed, Succeeded)
                | (Succeeded, Refunded | PartiallyRefunded)
                | (PartiallyRefunded, Refunded | PartiallyRefunded)
        );

        if allowed {
            Transition::Applied
        } else {
            Transition::Stale
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Succeeded => "succeeded",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Refunded => "refunded",
            PaymentStatus::PartiallyRefunded => "partially_refunded",
        }
    }
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for PaymentStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PaymentStatus::Pending),
            "succeeded" => Ok(PaymentStatus::Succeeded),
            "failed" => Ok(PaymentStatus::Failed),
            "refunded" => Ok(PaymentStatus::Refunded),
            "partially_refunded" => Ok(PaymentStatus::PartiallyRefunded),
            other => Err(DomainError::UnknownVariant {
                kind: "payment status",
                value: other.to_string(),
            }),
        }
    }
}

/// The kind of instrument a payment was made with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentType {
    Card,
    CreditCard,
    DebitCard,
    Paypal,
    BankTransfer,
    Other,
}

impl PaymentType {
    /// Maps a gateway payment-method type string, falling back to `Other`.
    pub fn from_gateway(kind: &str) -> Self {
        kind.parse().unwrap_or(PaymentType::Other)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentType::Card => "card",
            PaymentType::CreditCard => "credit_card",
            PaymentType::DebitCard => "debit_card",
            PaymentType::Paypal => "paypal",
            PaymentType::BankTransfer => "bank_transfer",
            PaymentType::Other => "other",
        }
    }
}

impl std::fmt::Display for PaymentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for PaymentType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "card" => Ok(PaymentType::Card),
            "credit_card" => Ok(PaymentType::CreditCard),
            "debit_card" => Ok(PaymentType::DebitCard),
            "paypal" => Ok(PaymentType::Paypal),
            "bank_transfer" => Ok(PaymentType::BankTransfer),
            "other" => Ok(PaymentType::Other),
            other => Err(DomainError::UnknownVariant {
                kind: "payment type",
                value: other.to_string(),
            }),
        }
    }
}
