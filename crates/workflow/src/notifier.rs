//! Notification sink for pipeline side effects.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use common::{OrderId, PaymentId, UserId};
use domain::{Money, OrderStatus, PaymentStatus};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("Notification delivery failed: {0}")]
    Delivery(String),
}

/// A message emitted once a pipeline run has done its work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    OrderConfirmed {
        order_id: OrderId,
        user_id: UserId,
        final_price: Money,
    },
    PaymentInitiated {
        payment_id: PaymentId,
        order_id: OrderId,
        status: PaymentStatus,
    },
    PaymentReconciled {
        order_id: OrderId,
        transaction_id: String,
        payment_status: PaymentStatus,
        order_status: OrderStatus,
    },
}

impl Notification {
    pub fn kind(&self) -> &'static str {
        match self {
            Notification::OrderConfirmed { .. } => "order_confirmed",
            Notification::PaymentInitiated { .. } => "payment_initiated",
            Notification::PaymentReconciled { .. } => "payment_reconciled",
        }
    }

    pub fn order_id(&self) -> OrderId {
        match self {
            Notification::OrderConfirmed { order_id, .. }
            | Notification::PaymentInitiated { order_id, .. }
            | Notification::PaymentReconciled { order_id, .. } => *order_id,
        }
    }
}

/// Trait for delivering notifications.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: Notification) -> Result<(), NotifyError>;
}

/// Writes notifications to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(&self, notification: Notification) -> Result<(), NotifyError> {
        tracing::info!(
            kind = notification.kind(),
            order_id = %notification.order_id(),
            ?notification,
            "notification sent"
        );
        metrics::counter!("notifications_sent_total", "kind" => notification.kind()).increment(1);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct InMemoryNotifierState {
    sent: Vec<Notification>,
    fail: bool,
}

/// In-memory notifier for testing.
#[derive(Debug, Clone, Default)]
pub struct InMemoryNotifier {
    state: Arc<Mutex<InMemoryNotifierState>>,
}

impl InMemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, InMemoryNotifierState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Configures the notifier to fail every delivery.
    pub fn set_fail_on_notify(&self, fail: bool) {
        self.state().fail = fail;
    }

    /// Returns the notifications delivered so far.
    pub fn notifications(&self) -> Vec<Notification> {
        self.state().sent.clone()
    }

    pub fn count(&self) -> usize {
        self.state().sent.len()
    }
}

#[async_trait]
impl Notifier for InMemoryNotifier {
    async fn notify(&self, notification: Notification) -> Result<(), NotifyError> {
        let mut state = self.state();
        if state.fail {
            return Err(NotifyError::Delivery(format!(
                "{} for order {}",
                notification.kind(),
                notification.order_id()
            )));
        }
        state.sent.push(notification);
        Ok(())
    }
}
