//! Order records and their status machine.

mod state;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use common::{OrderId, UserId};
use serde::{Deserialize, Serialize};

pub use state::OrderStatus;

use crate::Transition;
use crate::error::DomainError;
use crate::payment::{PaymentStatus, PaymentType};
use crate::money::Money;
use crate::product::ProductId;
use crate::shipping::ShippingPolicy;

/// A line of an order with the unit price captured at creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLine {
    pub product_id: ProductId,
    pub product_name: String,
    pub quantity: u32,
    pub unit_price: Money,
}

impl OrderLine {
    pub fn new(
        product_id: impl Into<ProductId>,
        product_name: impl Into<String>,
        quantity: u32,
        unit_price: Money,
    ) -> Self {
        Self {
            product_id: product_id.into(),
            product_name: product_name.into(),
            quantity,
            unit_price,
        }
    }

    /// Returns quantity * unit_price.
    pub fn line_total(&self) -> Result<Money, DomainError> {
        self.unit_price.multiply(self.quantity)
    }
}

/// Payment state embedded into an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PaymentSummary {
    /// Gateway transaction id, once a payment has been reconciled.
    pub id: Option<String>,
    pub status: PaymentStatus,
    #[serde(rename = "type")]
    pub payment_type: Option<PaymentType>,
}

/// Totals computed when an order is priced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pricing {
    pub total_price: Money,
    pub shipping_fee: Money,
    pub final_price: Money,
}

impl Pricing {
    /// Sums the line totals.
    pub fn subtotal(lines: &[OrderLine]) -> Result<Money, DomainError> {
        lines
            .iter()
            .try_fold(Money::zero(), |total, line| total.checked_add(line.line_total()?))
    }

    /// Prices `lines` and adds the fee `shipping` charges for them.
    pub fn for_lines(
        lines: &[OrderLine],
        shipping: &dyn ShippingPolicy,
    ) -> Result<Self, DomainError> {
        let total_price = Self::subtotal(lines)?;
        let shipping_fee = shipping.fee(total_price, lines);
        Ok(Self {
            total_price,
            shipping_fee,
            final_price: total_price.checked_add(shipping_fee)?,
        })
    }
}

/// A placed order.
///
/// Prices are fixed at placement: `final_price` is never recomputed after the
/// order has been persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub user_id: UserId,
    pub lines: Vec<OrderLine>,
    pub total_price: Money,
    pub shipping_fee: Money,
    pub final_price: Money,
    pub status: OrderStatus,
    pub shipping_address: String,
    pub payment_info: PaymentSummary,
    pub paid_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// Places a new pending order from already-priced lines.
    pub fn place(
        user_id: UserId,
        lines: Vec<OrderLine>,
        pricing: Pricing,
        shipping_address: impl Into<String>,
    ) -> Result<Self, DomainError> {
        if lines.is_empty() {
            return Err(DomainError::EmptyOrder);
        }
        if let Some(line) = lines.iter().find(|line| line.quantity == 0) {
            return Err(DomainError::InvalidQuantity {
                product_id: line.product_id.clone(),
                quantity: line.quantity,
            });
        }

        let now = Utc::now();
        Ok(Self {
            id: OrderId::new(),
            user_id,
            lines,
            total_price: pricing.total_price,
            shipping_fee: pricing.shipping_fee,
            final_price: pricing.final_price,
            status: OrderStatus::Pending,
            shipping_address: shipping_address.into(),
            payment_info: PaymentSummary::default(),
            paid_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// Returns true if the order belongs to `user_id`.
    pub fn is_owned_by(&self, user_id: UserId) -> bool {
        self.user_id == user_id
    }

    /// Quantities per product, summed across lines.
    pub fn quantities(&self) -> BTreeMap<&ProductId, u32> {
        let mut quantities = BTreeMap::new();
        for line in &self.lines {
            *quantities.entry(&line.product_id).or_insert(0) += line.quantity;
        }
        quantities
    }

    /// Records a successful payment and moves the order to `Processing`.
    pub fn mark_paid(&mut self, summary: PaymentSummary) -> Result<Transition, DomainError> {
        if self.status.is_paid() {
            return Ok(self.mirror_payment(summary));
        }
        if !self.status.can_mark_paid() {
            return Err(DomainError::InvalidStateTransition {
                current: self.status,
                action: "mark paid",
            });
        }

        let now = Utc::now();
        self.status = OrderStatus::Processing;
        self.payment_info = summary;
        self.paid_at = Some(now);
        self.updated_at = now;
        Ok(Transition::Applied)
    }

    /// Records a failed payment.
    ///
    /// A failure reported after the order was paid is stale and leaves the
    /// order untouched.
    pub fn mark_payment_failed(
        &mut self,
        summary: PaymentSummary,
    ) -> Result<Transition, DomainError> {
        match self.status {
            OrderStatus::Pending => {
                self.status = OrderStatus::PaymentFailed;
                self.payment_info = summary;
                self.updated_at = Utc::now();
                Ok(Transition::Applied)
            }
            OrderStatus::PaymentFailed => Ok(self.mirror_payment(summary)),
            status if status.is_paid() => Ok(Transition::Stale),
            current => Err(DomainError::InvalidStateTransition {
                current,
                action: "mark payment failed",
            }),
        }
    }

    /// Copies the payment summary into the order without touching its status.
    pub fn mirror_payment(&mut self, summary: PaymentSummary) -> Transition {
        if self.payment_info == summary {
            return Transition::Unchanged;
        }
        self.payment_info = summary;
        self.updated_at = Utc::now();
        Transition::Applied
    }
}
