//! The three pipelines built on the workflow engine.

pub mod order_fulfillment;
pub mod payment_processing;
pub mod webhook_reconciliation;

pub use order_fulfillment::{CreateOrderRequest, OrderFulfillment, OrderItemRequest, OrderStage};
pub use payment_processing::{PaymentContext, PaymentProcessing, PaymentRequest, PaymentStage};
pub use webhook_reconciliation::{
    ReconcileOutcome, ReconcileStage, Reconciliation, WebhookAck, WebhookDelivery,
    WebhookReconciliation,
};
