//! Workflow error types.

use std::time::Duration;

use common::{OrderId, UserId};
use domain::{DomainError, OrderStatus, ProductId};
use store::StoreError;
use thiserror::Error;

use crate::engine::{StepFailure, WorkflowError};
use crate::gateway::GatewayError;
use crate::notifier::NotifyError;

/// Errors a pipeline step can raise.
#[derive(Debug, Error)]
pub enum StepError {
    /// The order request has no lines.
    #[error("Order has no items")]
    EmptyOrder,

    #[error("Invalid quantity {quantity} for product {product_id} (must be greater than 0)")]
    InvalidQuantity { product_id: ProductId, quantity: u32 },

    #[error("Product not found: {0}")]
    ProductNotFound(ProductId),

    #[error(
        "Insufficient stock for product {product_id}: requested {requested}, available {available}"
    )]
    InsufficientStock {
        product_id: ProductId,
        requested: u64,
        available: u32,
    },

    #[error("Order not found: {0}")]
    OrderNotFound(OrderId),

    /// The order belongs to another user.
    #[error("User {user_id} is not allowed to pay for order {order_id}")]
    Unauthorized { order_id: OrderId, user_id: UserId },

    /// The order cannot take a payment in its current status.
    #[error("Order {order_id} is {status} and cannot accept a payment")]
    InvalidOrderState { order_id: OrderId, status: OrderStatus },

    /// No payment is recorded for the gateway transaction id.
    #[error("No payment recorded for transaction {0}")]
    PaymentNotFound(String),

    /// A step attempt exceeded its deadline.
    #[error("Step {step} timed out after {limit:?}")]
    Timeout { step: &'static str, limit: Duration },

    /// A step received a context it cannot handle. Indicates a wiring bug.
    #[error("Step {step} cannot handle stage {stage}")]
    UnexpectedStage {
        step: &'static str,
        stage: &'static str,
    },

    #[error(transparent)]
    Store(StoreError),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Notify(#[from] NotifyError),
}

impl From<StoreError> for StepError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::ProductNotFound(id) => StepError::ProductNotFound(id),
            StoreError::OrderNotFound(id) => StepError::OrderNotFound(id),
            StoreError::InsufficientStock {
                product_id,
                requested,
                available,
            } => StepError::InsufficientStock {
                product_id,
                requested,
                available,
            },
            other => StepError::Store(other),
        }
    }
}

impl StepFailure for StepError {
    fn is_retryable(&self) -> bool {
        match self {
            StepError::Timeout { .. } => true,
            StepError::Store(e) => e.is_retryable(),
            StepError::Gateway(e) => e.is_retryable(),
            _ => false,
        }
    }

    fn timed_out(step: &'static str, limit: Duration) -> Self {
        StepError::Timeout { step, limit }
    }
}

/// Errors returned by the pipelines.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Order creation failed: {0}")]
    OrderCreation(#[source] WorkflowError),

    #[error("Payment processing failed: {0}")]
    PaymentProcessing(#[source] WorkflowError),

    #[error("Webhook reconciliation failed: {0}")]
    Reconciliation(#[source] WorkflowError),

    /// The workflow committed but did not reach its final stage.
    #[error("Workflow {workflow} finished in stage {stage}")]
    Incomplete {
        workflow: &'static str,
        stage: &'static str,
    },
}

impl PipelineError {
    pub fn workflow_error(&self) -> Option<&WorkflowError> {
        match self {
            PipelineError::OrderCreation(e)
            | PipelineError::PaymentProcessing(e)
            | PipelineError::Reconciliation(e) => Some(e),
            PipelineError::Incomplete { .. } => None,
        }
    }

    /// Returns the business or infrastructure error behind the failure,
    /// for callers that translate it into a response.
    pub fn step_error(&self) -> Option<&StepError> {
        self.workflow_error().and_then(WorkflowError::step_error)
    }

    /// Returns true if submitting the same request again may succeed.
    pub fn is_retryable(&self) -> bool {
        self.workflow_error().is_some_and(WorkflowError::is_retryable)
    }
}

/// Convenience type alias for pipeline results.
pub type Result<T> = std::result::Result<T, PipelineError>;
