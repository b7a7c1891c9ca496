//! Transactional workflow orchestration for orders and payments.
//!
//! This crate provides a generic step engine and the pipelines built on it:
//! - Order fulfillment: validate, price, persist the order and take stock
//! - Payment processing: authorize the order, charge the gateway, record the payment
//! - Webhook reconciliation: apply gateway events to payments and orders
//!
//! Every pipeline run executes its steps inside one storage transaction.
//! A failing step is retried within that transaction up to the configured
//! number of attempts; if it still fails, nothing of the run is committed.

pub mod config;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod notifier;
pub mod pipelines;

pub use config::WorkflowConfig;
pub use engine::{
    Finalizer, FinalizerMode, RetryPolicy, Step, StepFailure, Workflow, WorkflowBuilder,
    WorkflowError,
};
pub use error::{PipelineError, Result, StepError};
pub use gateway::{
    Charge, ChargeRequest, ChargeStatus, GatewayError, GatewayEvent, GatewayEventKind,
    InMemoryPaymentGateway, PaymentGateway, PaymentMethod,
};
pub use notifier::{InMemoryNotifier, Notification, Notifier, NotifyError, TracingNotifier};
pub use pipelines::{
    CreateOrderRequest, OrderFulfillment, OrderItemRequest, PaymentProcessing, PaymentRequest,
    ReconcileOutcome, Reconciliation, WebhookAck, WebhookDelivery, WebhookReconciliation,
};
