//! Webhook reconciliation: mirror gateway events into payments and orders.
//!
//! Gateways deliver events at least once and in no particular order, so every
//! change is applied through the status machines of [`Payment`] and
//! [`Order`]: a repeated event is a no-op and an out-of-date event is skipped.

use async_trait::async_trait;
use domain::{Order, Payment, PaymentStatus, Transition};
use store::Storage;

use crate::config::WorkflowConfig;
use crate::engine::{Finalizer, Step, StepFailure, Workflow};
use crate::error::{PipelineError, StepError};
use crate::gateway::{GatewayEvent, GatewayEventKind, PaymentGateway};
use crate::notifier::{Notification, Notifier};

pub const WORKFLOW_NAME: &str = "webhook_reconciliation";

/// A raw inbound webhook call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookDelivery {
    pub payload: Vec<u8>,
    /// Value of the signature header.
    pub signature: String,
}

impl WebhookDelivery {
    pub fn new(payload: impl Into<Vec<u8>>, signature: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
            signature: signature.into(),
        }
    }
}

/// What a delivery did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The payment (and, where relevant, the order) changed.
    Applied,
    /// The records already reflected the event.
    AlreadyApplied,
    /// The event was not relevant or out of date.
    Ignored,
}

/// Context passed between the reconciliation steps.
#[derive(Debug, Clone)]
pub enum ReconcileStage {
    Received(WebhookDelivery),
    Verified(GatewayEvent),
    PaymentUpdated {
        event: GatewayEvent,
        payment: Payment,
        outcome: ReconcileOutcome,
    },
    Reconciled(Reconciliation),
}

impl ReconcileStage {
    fn name(&self) -> &'static str {
        match self {
            ReconcileStage::Received(_) => "received",
            ReconcileStage::Verified(_) => "verified",
            ReconcileStage::PaymentUpdated { .. } => "payment_updated",
            ReconcileStage::Reconciled(_) => "reconciled",
        }
    }

    fn unexpected(&self, step: &'static str) -> StepError {
        StepError::UnexpectedStage {
            step,
            stage: self.name(),
        }
    }
}

/// Result of a reconciliation run.
#[derive(Debug, Clone)]
pub struct Reconciliation {
    pub event_id: String,
    pub event_type: String,
    pub outcome: ReconcileOutcome,
    pub payment: Option<Payment>,
    pub order: Option<Order>,
}

impl Reconciliation {
    fn ignored(event: GatewayEvent) -> Self {
        Self {
            event_type: event.kind.event_type().to_string(),
            event_id: event.id,
            outcome: ReconcileOutcome::Ignored,
            payment: None,
            order: None,
        }
    }
}

/// How the HTTP layer should answer the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookAck {
    Processed,
    Ignored,
    /// The delivery failed. `retry` is true when the gateway should redeliver.
    Rejected { reason: String, retry: bool },
}

/// Checks the signature and parses the event.
struct VerifyEvent<G> {
    gateway: G,
}

#[async_trait]
impl<G: PaymentGateway, Sess: Send> Step<ReconcileStage, Sess, StepError> for VerifyEvent<G> {
    fn name(&self) -> &'static str {
        "verify_event"
    }

    async fn execute(
        &self,
        stage: ReconcileStage,
        _session: &mut Sess,
    ) -> Result<ReconcileStage, StepError> {
        let delivery = match stage {
            ReconcileStage::Received(delivery) => delivery,
            other => return Err(other.unexpected("verify_event")),
        };

        let event = self
            .gateway
            .verify_webhook(&delivery.payload, &delivery.signature)?;
        tracing::debug!(
            event_id = %event.id,
            event_type = event.kind.event_type(),
            "webhook verified"
        );

        Ok(ReconcileStage::Verified(event))
    }
}

/// Applies the event to the payment it refers to.
struct UpdatePayment<S> {
    store: S,
}

#[async_trait]
impl<S: Storage> Step<ReconcileStage, S::Session, StepError> for UpdatePayment<S> {
    fn name(&self) -> &'static str {
        "update_payment"
    }

    async fn execute(
        &self,
        stage: ReconcileStage,
        session: &mut S::Session,
    ) -> Result<ReconcileStage, StepError> {
        let event = match stage {
            ReconcileStage::Verified(event) => event,
            other => return Err(other.unexpected(self.name())),
        };

        if let GatewayEventKind::Other { .. } = event.kind {
            tracing::info!(
                event_id = %event.id,
                event_type = event.kind.event_type(),
                "unhandled event type"
            );
            return Ok(ReconcileStage::Reconciled(Reconciliation::ignored(event)));
        }

        let transaction_id = event.kind.transaction_id().unwrap_or_default().to_string();
        let mut payment = self
            .store
            .find_payment_by_transaction_id(session, &transaction_id)
            .await?
            .ok_or(StepError::PaymentNotFound(transaction_id))?;

        let transition = match &event.kind {
            GatewayEventKind::PaymentSucceeded { .. } => {
                payment.apply_status(PaymentStatus::Succeeded)
            }
            GatewayEventKind::PaymentFailed { .. } => payment.apply_status(PaymentStatus::Failed),
            GatewayEventKind::ChargeRefunded {
                amount_refunded, ..
            } => payment.record_refund(*amount_refunded),
            GatewayEventKind::Other { .. } => Transition::Unchanged,
        };

        let outcome = match transition {
            Transition::Applied => {
                self.store.update_payment(session, &payment).await?;
                ReconcileOutcome::Applied
            }
            Transition::Unchanged => ReconcileOutcome::AlreadyApplied,
            Transition::Stale => {
                tracing::warn!(
                    event_id = %event.id,
                    transaction_id = %payment.transaction_id,
                    current = %payment.status,
                    event_type = event.kind.event_type(),
                    "stale payment event ignored"
                );
                ReconcileOutcome::Ignored
            }
        };

        Ok(ReconcileStage::PaymentUpdated {
            event,
            payment,
            outcome,
        })
    }
}

/// Brings the order in line with the payment.
struct UpdateOrder<S> {
    store: S,
}

#[async_trait]
impl<S: Storage> Step<ReconcileStage, S::Session, StepError> for UpdateOrder<S> {
    fn name(&self) -> &'static str {
        "update_order"
    }

    async fn execute(
        &self,
        stage: ReconcileStage,
        session: &mut S::Session,
    ) -> Result<ReconcileStage, StepError> {
        let (event, payment, outcome) = match stage {
            ReconcileStage::PaymentUpdated {
                event,
                payment,
                outcome,
            } => (event, payment, outcome),
            ReconcileStage::Reconciled(done) => return Ok(ReconcileStage::Reconciled(done)),
            other => return Err(other.unexpected(self.name())),
        };

        let mut reconciliation = Reconciliation {
            event_type: event.kind.event_type().to_string(),
            event_id: event.id.clone(),
            outcome,
            payment: None,
            order: None,
        };

        if outcome == ReconcileOutcome::Ignored {
            reconciliation.payment = Some(payment);
            return Ok(ReconcileStage::Reconciled(reconciliation));
        }

        // The payment may already carry the status (a synchronous charge
        // result, or a redelivery), but the order can still lag behind it.
        let mut order = self
            .store
            .find_order(session, payment.order_id)
            .await?
            .ok_or(StepError::OrderNotFound(payment.order_id))?;

        let summary = payment.summary();
        let transition = match &event.kind {
            GatewayEventKind::PaymentSucceeded { .. } => order.mark_paid(summary)?,
            GatewayEventKind::PaymentFailed { .. } => order.mark_payment_failed(summary)?,
            _ => order.mirror_payment(summary),
        };

        match transition {
            Transition::Applied => {
                self.store.update_order(session, &order).await?;
                reconciliation.outcome = ReconcileOutcome::Applied;
            }
            Transition::Unchanged => {}
            Transition::Stale => tracing::warn!(
                order_id = %order.id,
                status = %order.status,
                event_type = event.kind.event_type(),
                "stale order transition ignored"
            ),
        }

        reconciliation.payment = Some(payment);
        reconciliation.order = Some(order);
        Ok(ReconcileStage::Reconciled(reconciliation))
    }
}

struct AnnounceReconciliation<N> {
    notifier: N,
}

#[async_trait]
impl<N: Notifier, Sess: Send> Finalizer<ReconcileStage, Sess, StepError>
    for AnnounceReconciliation<N>
{
    async fn finalize(
        &self,
        stage: &ReconcileStage,
        _session: Option<&mut Sess>,
    ) -> Result<(), StepError> {
        let ReconcileStage::Reconciled(reconciliation) = stage else {
            return Err(stage.unexpected("announce_reconciliation"));
        };
        if reconciliation.outcome != ReconcileOutcome::Applied {
            return Ok(());
        }
        let (Some(payment), Some(order)) = (&reconciliation.payment, &reconciliation.order) else {
            return Ok(());
        };

        self.notifier
            .notify(Notification::PaymentReconciled {
                order_id: order.id,
                transaction_id: payment.transaction_id.clone(),
                payment_status: payment.status,
                order_status: order.status,
            })
            .await?;
        Ok(())
    }
}

/// Applies verified gateway events to payments and orders.
pub struct WebhookReconciliation<S: Storage> {
    workflow: Workflow<S, ReconcileStage>,
}

impl<S> WebhookReconciliation<S>
where
    S: Storage + Clone + 'static,
{
    pub fn new<G, N>(store: S, gateway: G, notifier: N, config: &WorkflowConfig) -> Self
    where
        G: PaymentGateway + 'static,
        N: Notifier + 'static,
    {
        let workflow = Workflow::builder(WORKFLOW_NAME, store.clone(), config.retry)
            .step(VerifyEvent { gateway })
            .step(UpdatePayment {
                store: store.clone(),
            })
            .step(UpdateOrder { store })
            .finally(AnnounceReconciliation { notifier })
            .finalizer_mode(config.finalizer_mode)
            .build();

        Self { workflow }
    }

    pub fn workflow(&self) -> &Workflow<S, ReconcileStage> {
        &self.workflow
    }

    /// Verifies and applies one webhook delivery.
    #[tracing::instrument(skip_all, fields(payload_len = delivery.payload.len()))]
    pub async fn reconcile(&self, delivery: WebhookDelivery) -> crate::Result<Reconciliation> {
        let stage = self
            .workflow
            .run(ReconcileStage::Received(delivery))
            .await
            .map_err(PipelineError::Reconciliation)?;

        match stage {
            ReconcileStage::Reconciled(reconciliation) => {
                tracing::info!(
                    event_id = %reconciliation.event_id,
                    event_type = %reconciliation.event_type,
                    outcome = ?reconciliation.outcome,
                    "webhook reconciled"
                );
                metrics::counter!(
                    "webhook_events_total",
                    "outcome" => outcome_label(reconciliation.outcome)
                )
                .increment(1);
                Ok(reconciliation)
            }
            other => Err(PipelineError::Incomplete {
                workflow: WORKFLOW_NAME,
                stage: other.name(),
            }),
        }
    }

    /// Reconciles a delivery and turns the result into a response for the
    /// gateway. Never fails; errors are logged.
    pub async fn acknowledge(&self, delivery: WebhookDelivery) -> WebhookAck {
        match self.reconcile(delivery).await {
            Ok(reconciliation) if reconciliation.outcome == ReconcileOutcome::Ignored => {
                WebhookAck::Ignored
            }
            Ok(_) => WebhookAck::Processed,
            Err(err) => {
                let retry = err.is_retryable();
                tracing::error!(error = %err, retry, "webhook rejected");
                metrics::counter!("webhook_events_total", "outcome" => "rejected").increment(1);
                WebhookAck::Rejected {
                    reason: rejection_reason(&err),
                    retry,
                }
            }
        }
    }
}

fn outcome_label(outcome: ReconcileOutcome) -> &'static str {
    match outcome {
        ReconcileOutcome::Applied => "applied",
        ReconcileOutcome::AlreadyApplied => "already_applied",
        ReconcileOutcome::Ignored => "ignored",
    }
}

fn rejection_reason(err: &PipelineError) -> String {
    match err.step_error() {
        Some(step) if !step.is_retryable() => step.to_string(),
        _ => err.to_string(),
    }
}
