//! Payment records and their status machine.

mod state;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use common::{OrderId, PaymentId, UserId};
use serde::{Deserialize, Serialize};

pub use state::{PaymentStatus, PaymentType};

use crate::Transition;
use crate::order::PaymentSummary;
use crate::money::Money;

/// Default currency for charges and payment records.
pub const DEFAULT_CURRENCY: &str = "usd";

/// A recorded charge attempt against an order.
///
/// Created by the payment pipeline; afterwards only gateway events change it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    pub id: PaymentId,
    pub order_id: OrderId,
    pub user_id: UserId,
    pub amount: Money,
    /// Gateway identifier of the stored payment method.
    pub payment_method: String,
    pub payment_type: PaymentType,
    pub status: PaymentStatus,
    /// Gateway-assigned charge id. Unique; webhook events are joined on it.
    pub transaction_id: String,
    pub currency: String,
    pub refunded_amount: Option<Money>,
    pub metadata: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Payment {
    /// Creates a pending card payment for a gateway transaction.
    pub fn new(
        order_id: OrderId,
        user_id: UserId,
        amount: Money,
        transaction_id: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: PaymentId::new(),
            order_id,
            user_id,
            amount,
            payment_method: String::new(),
            payment_type: PaymentType::Card,
            status: PaymentStatus::Pending,
            transaction_id: transaction_id.into(),
            currency: DEFAULT_CURRENCY.to_string(),
            refunded_amount: None,
            metadata: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Sets the stored payment method and its type.
    pub fn with_method(mut self, method_id: impl Into<String>, payment_type: PaymentType) -> Self {
        self.payment_method = method_id.into();
        self.payment_type = payment_type;
        self
    }

    pub fn with_status(mut self, status: PaymentStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_currency(mut self, currency: impl Into<String>) -> Self {
        self.currency = currency.into();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Moves the payment to `next` if the lifecycle allows it.
    pub fn apply_status(&mut self, next: PaymentStatus) -> Transition {
        let transition = self.status.transition_to(next);
        if transition.is_applied() {
            self.status = next;
            self.updated_at = Utc::now();
        }
        transition
    }

    /// Records a refund reported by the gateway.
    ///
    /// `total_refunded` is the cumulative refunded amount, as gateways report
    /// it, so replaying the same event (or reporting nothing refunded) is a
    /// no-op and an older, smaller amount is stale.
    pub fn record_refund(&mut self, total_refunded: Money) -> Transition {
        let previous = self.refunded_amount.unwrap_or_default();
        if total_refunded < previous {
            return Transition::Stale;
        }
        if total_refunded == previous {
            return Transition::Unchanged;
        }

        let next = if total_refunded >= self.amount {
            PaymentStatus::Refunded
        } else {
            PaymentStatus::PartiallyRefunded
        };

        let transition = self.apply_status(next);
        if transition.is_applied() {
            self.refunded_amount = Some(total_refunded);
        }
        transition
    }

    /// Returns the summary embedded into the owning order.
    pub fn summary(&self) -> PaymentSummary {
        PaymentSummary {
            id: Some(self.transaction_id.clone()),
            status: self.status,
            payment_type: Some(self.payment_type),
        }
    }
}
