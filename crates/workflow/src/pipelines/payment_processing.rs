//! Payment initiation: authorize the order, charge the gateway, record the payment.

use std::collections::BTreeMap;

use async_trait::async_trait;
use common::{OrderId, UserId};
use domain::{Order, Payment};
use serde::{Deserialize, Serialize};
use store::Storage;

use crate::config::WorkflowConfig;
use crate::engine::{Finalizer, Step, Workflow};
use crate::error::{PipelineError, StepError};
use crate::gateway::{Charge, ChargeRequest, PaymentGateway, PaymentMethod};
use crate::notifier::{Notification, Notifier};

pub const WORKFLOW_NAME: &str = "payment_processing";

/// Input of the payment pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRequest {
    pub order_id: OrderId,
    pub payment_method_id: String,
    pub user_id: UserId,
}

#[derive(Debug, Clone)]
pub enum PaymentStage {
    Requested,
    Authorized {
        order: Order,
    },
    MethodResolved {
        order: Order,
        method: PaymentMethod,
    },
    Charged {
        order: Order,
        method: PaymentMethod,
        charge: Charge,
    },
    Recorded(Payment),
}

impl PaymentStage {
    fn name(&self) -> &'static str {
        match self {
            PaymentStage::Requested => "requested",
            PaymentStage::Authorized { .. } => "authorized",
            PaymentStage::MethodResolved { .. } => "method_resolved",
            PaymentStage::Charged { .. } => "charged",
            PaymentStage::Recorded(_) => "recorded",
        }
    }
}

/// Context passed between the payment steps.
///
/// The idempotency key is fixed when the run starts, so every attempt of the
/// charge step sends the same key and the gateway creates at most one charge.
#[derive(Debug, Clone)]
pub struct PaymentContext {
    pub request: PaymentRequest,
    pub idempotency_key: String,
    pub stage: PaymentStage,
}

impl PaymentContext {
    fn new(request: PaymentRequest) -> Self {
        let idempotency_key = format!("{}-{}", request.order_id, uuid::Uuid::new_v4());
        Self {
            request,
            idempotency_key,
            stage: PaymentStage::Requested,
        }
    }

    fn advance(self, stage: PaymentStage) -> Self {
        Self { stage, ..self }
    }

    fn unexpected(&self, step: &'static str) -> StepError {
        StepError::UnexpectedStage {
            step,
            stage: self.stage.name(),
        }
    }
}

/// Loads the order and checks that the caller may pay for it now.
struct AuthorizeOrder<S> {
    store: S,
}

#[async_trait]
impl<S: Storage> Step<PaymentContext, S::Session, StepError> for AuthorizeOrder<S> {
    fn name(&self) -> &'static str {
        "authorize_order"
    }

    async fn execute(
        &self,
        context: PaymentContext,
        session: &mut S::Session,
    ) -> Result<PaymentContext, StepError> {
        if !matches!(context.stage, PaymentStage::Requested) {
            return Err(context.unexpected(self.name()));
        }
        let request = &context.request;

        let order = self
            .store
            .find_order(session, request.order_id)
            .await?
            .ok_or(StepError::OrderNotFound(request.order_id))?;

        if !order.is_owned_by(request.user_id) {
            return Err(StepError::Unauthorized {
                order_id: order.id,
                user_id: request.user_id,
            });
        }
        if !order.status.can_accept_payment() {
            return Err(StepError::InvalidOrderState {
                order_id: order.id,
                status: order.status,
            });
        }

        Ok(context.advance(PaymentStage::Authorized { order }))
    }
}

/// Fetches the stored payment method from the gateway.
struct ResolvePaymentMethod<G> {
    gateway: G,
}

#[async_trait]
impl<G, Sess> Step<PaymentContext, Sess, StepError> for ResolvePaymentMethod<G>
where
    G: PaymentGateway,
    Sess: Send,
{
    fn name(&self) -> &'static str {
        "resolve_payment_method"
    }

    async fn execute(
        &self,
        context: PaymentContext,
        _session: &mut Sess,
    ) -> Result<PaymentContext, StepError> {
        let order = match &context.stage {
            PaymentStage::Authorized { order } => order.clone(),
            _ => return Err(context.unexpected("resolve_payment_method")),
        };

        let method = self
            .gateway
            .retrieve_payment_method(&context.request.payment_method_id)
            .await?;

        Ok(context.advance(PaymentStage::MethodResolved { order, method }))
    }
}

/// Charges the order's final price.
struct CreateCharge<G> {
    gateway: G,
    currency: String,
}

#[async_trait]
impl<G: PaymentGateway, Sess: Send> Step<PaymentContext, Sess, StepError> for CreateCharge<G> {
    fn name(&self) -> &'static str {
        "create_charge"
    }

    async fn execute(
        &self,
        context: PaymentContext,
        _session: &mut Sess,
    ) -> Result<PaymentContext, StepError> {
        let (order, method) = match &context.stage {
            PaymentStage::MethodResolved { order, method } => (order.clone(), method.clone()),
            _ => return Err(context.unexpected("create_charge")),
        };

        let metadata = BTreeMap::from([
            ("order_id".to_string(), order.id.to_string()),
            ("user_id".to_string(), context.request.user_id.to_string()),
        ]);
        let charge = self
            .gateway
            .create_charge(ChargeRequest {
                amount: order.final_price,
                currency: self.currency.clone(),
                payment_method_id: method.id.clone(),
                idempotency_key: context.idempotency_key.clone(),
                metadata,
            })
            .await?;

        tracing::info!(
            order_id = %order.id,
            transaction_id = %charge.id,
            status = ?charge.status,
            "charge created"
        );

        Ok(context.advance(PaymentStage::Charged {
            order,
            method,
            charge,
        }))
    }
}

/// Records the payment with the status the charge reported.
struct RecordPayment<S> {
    store: S,
    currency: String,
}

#[async_trait]
impl<S: Storage> Step<PaymentContext, S::Session, StepError> for RecordPayment<S> {
    fn name(&self) -> &'static str {
        "record_payment"
    }

    async fn execute(
        &self,
        context: PaymentContext,
        session: &mut S::Session,
    ) -> Result<PaymentContext, StepError> {
        let payment = match &context.stage {
            PaymentStage::Charged {
                order,
                method,
                charge,
            } => Payment::new(order.id, context.request.user_id, order.final_price, &charge.id)
                .with_method(&method.id, method.payment_type())
                .with_status(charge.status.into())
                .with_currency(&self.currency)
                .with_metadata("order_id", order.id.to_string())
                .with_metadata("user_id", context.request.user_id.to_string()),
            _ => return Err(context.unexpected(self.name())),
        };

        self.store.insert_payment(session, &payment).await?;

        Ok(context.advance(PaymentStage::Recorded(payment)))
    }
}

struct AnnouncePayment<N> {
    notifier: N,
}

#[async_trait]
impl<N: Notifier, Sess: Send> Finalizer<PaymentContext, Sess, StepError> for AnnouncePayment<N> {
    async fn finalize(
        &self,
        context: &PaymentContext,
        _session: Option<&mut Sess>,
    ) -> Result<(), StepError> {
        let PaymentStage::Recorded(payment) = &context.stage else {
            return Err(context.unexpected("announce_payment"));
        };

        self.notifier
            .notify(Notification::PaymentInitiated {
                payment_id: payment.id,
                order_id: payment.order_id,
                status: payment.status,
            })
            .await?;
        Ok(())
    }
}

/// Initiates payments for pending orders.
///
/// The order itself is left untouched; its status follows the gateway's
/// webhook events.
pub struct PaymentProcessing<S: Storage> {
    workflow: Workflow<S, PaymentContext>,
}

impl<S> PaymentProcessing<S>
where
    S: Storage + Clone + 'static,
{
    pub fn new<G, N>(store: S, gateway: G, notifier: N, config: &WorkflowConfig) -> Self
    where
        G: PaymentGateway + Clone + 'static,
        N: Notifier + 'static,
    {
        let workflow = Workflow::builder(WORKFLOW_NAME, store.clone(), config.retry)
            .step(AuthorizeOrder {
                store: store.clone(),
            })
            .step(ResolvePaymentMethod {
                gateway: gateway.clone(),
            })
            .step(CreateCharge {
                gateway,
                currency: config.currency.clone(),
            })
            .step(RecordPayment {
                store,
                currency: config.currency.clone(),
            })
            .finally(AnnouncePayment { notifier })
            .finalizer_mode(config.finalizer_mode)
            .build();

        Self { workflow }
    }

    pub fn workflow(&self) -> &Workflow<S, PaymentContext> {
        &self.workflow
    }

    /// Charges the order and records the resulting payment.
    #[tracing::instrument(
        skip(self, request),
        fields(order_id = %request.order_id, user_id = %request.user_id)
    )]
    pub async fn process_payment(&self, request: PaymentRequest) -> crate::Result<Payment> {
        let context = self
            .workflow
            .run(PaymentContext::new(request))
            .await
            .map_err(PipelineError::PaymentProcessing)?;

        match context.stage {
            PaymentStage::Recorded(payment) => {
                tracing::info!(
                    payment_id = %payment.id,
                    transaction_id = %payment.transaction_id,
                    status = %payment.status,
                    "payment recorded"
                );
                Ok(payment)
            }
            other => Err(PipelineError::Incomplete {
                workflow: WORKFLOW_NAME,
                stage: other.name(),
            }),
        }
    }
}
