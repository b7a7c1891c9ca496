//! Order creation: validate, price, persist, and take stock in one transaction.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use common::UserId;
use domain::{Order, OrderLine, Pricing, Product, ProductId, ShippingPolicy};
use serde::{Deserialize, Serialize};
use store::Storage;

use crate::config::WorkflowConfig;
use crate::engine::{Finalizer, Step, Workflow};
use crate::error::{PipelineError, StepError};
use crate::notifier::{Notification, Notifier};

pub const WORKFLOW_NAME: &str = "order_fulfillment";

/// One requested line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderItemRequest {
    pub product_id: ProductId,
    pub quantity: u32,
}

impl OrderItemRequest {
    pub fn new(product_id: impl Into<ProductId>, quantity: u32) -> Self {
        Self {
            product_id: product_id.into(),
            quantity,
        }
    }
}

/// Input of the order pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateOrderRequest {
    pub user_id: UserId,
    pub items: Vec<OrderItemRequest>,
    pub shipping_address: String,
}

/// Context passed between the order steps.
#[derive(Debug, Clone)]
pub enum OrderStage {
    Requested(CreateOrderRequest),
    Validated {
        request: CreateOrderRequest,
        lines: Vec<OrderLine>,
    },
    Priced {
        request: CreateOrderRequest,
        lines: Vec<OrderLine>,
        pricing: Pricing,
    },
    Placed(Order),
}

impl OrderStage {
    fn name(&self) -> &'static str {
        match self {
            OrderStage::Requested(_) => "requested",
            OrderStage::Validated { .. } => "validated",
            OrderStage::Priced { .. } => "priced",
            OrderStage::Placed(_) => "placed",
        }
    }

    fn unexpected(&self, step: &'static str) -> StepError {
        StepError::UnexpectedStage {
            step,
            stage: self.name(),
        }
    }
}

/// Checks the request and snapshots product names and prices into lines.
struct ResolveItems<S> {
    store: S,
}

#[async_trait]
impl<S: Storage> Step<OrderStage, S::Session, StepError> for ResolveItems<S> {
    fn name(&self) -> &'static str {
        "resolve_items"
    }

    async fn execute(
        &self,
        stage: OrderStage,
        session: &mut S::Session,
    ) -> Result<OrderStage, StepError> {
        let request = match stage {
            OrderStage::Requested(request) => request,
            other => return Err(other.unexpected(self.name())),
        };

        if request.items.is_empty() {
            return Err(StepError::EmptyOrder);
        }
        if let Some(item) = request.items.iter().find(|item| item.quantity == 0) {
            return Err(StepError::InvalidQuantity {
                product_id: item.product_id.clone(),
                quantity: item.quantity,
            });
        }

        let ids: Vec<ProductId> = request
            .items
            .iter()
            .map(|item| item.product_id.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let products: HashMap<ProductId, Product> = self
            .store
            .find_products(session, &ids)
            .await?
            .into_iter()
            .map(|p| (p.id.clone(), p))
            .collect();

        let mut requested: BTreeMap<&ProductId, u64> = BTreeMap::new();
        for item in &request.items {
            *requested.entry(&item.product_id).or_insert(0) += u64::from(item.quantity);
        }

        for (product_id, quantity) in &requested {
            let product = products
                .get(*product_id)
                .ok_or_else(|| StepError::ProductNotFound((*product_id).clone()))?;
            if !product.has_stock_for(*quantity) {
                return Err(StepError::InsufficientStock {
                    product_id: product.id.clone(),
                    requested: *quantity,
                    available: product.stock,
                });
            }
        }

        let lines = request
            .items
            .iter()
            .filter_map(|item| products.get(&item.product_id).map(|p| (item, p)))
            .map(|(item, product)| {
                OrderLine::new(
                    product.id.clone(),
                    product.name.clone(),
                    item.quantity,
                    product.price,
                )
            })
            .collect();

        Ok(OrderStage::Validated { request, lines })
    }
}

/// Computes the totals with the configured shipping policy.
struct PriceOrder {
    shipping: Arc<dyn ShippingPolicy>,
}

#[async_trait]
impl<Sess: Send> Step<OrderStage, Sess, StepError> for PriceOrder {
    fn name(&self) -> &'static str {
        "price_order"
    }

    async fn execute(
        &self,
        stage: OrderStage,
        _session: &mut Sess,
    ) -> Result<OrderStage, StepError> {
        let (request, lines) = match stage {
            OrderStage::Validated { request, lines } => (request, lines),
            other => return Err(other.unexpected("price_order")),
        };

        let pricing = Pricing::for_lines(&lines, self.shipping.as_ref())?;

        tracing::debug!(
            total = %pricing.total_price,
            shipping = %pricing.shipping_fee,
            final_price = %pricing.final_price,
            "order priced"
        );

        Ok(OrderStage::Priced {
            request,
            lines,
            pricing,
        })
    }
}

/// Inserts the pending order.
struct PersistOrder<S> {
    store: S,
}

#[async_trait]
impl<S: Storage> Step<OrderStage, S::Session, StepError> for PersistOrder<S> {
    fn name(&self) -> &'static str {
        "persist_order"
    }

    async fn execute(
        &self,
        stage: OrderStage,
        session: &mut S::Session,
    ) -> Result<OrderStage, StepError> {
        let (request, lines, pricing) = match stage {
            OrderStage::Priced {
                request,
                lines,
                pricing,
            } => (request, lines, pricing),
            other => return Err(other.unexpected(self.name())),
        };

        let order = Order::place(request.user_id, lines, pricing, request.shipping_address)?;
        self.store.insert_order(session, &order).await?;

        Ok(OrderStage::Placed(order))
    }
}

/// Takes the ordered quantities from stock.
struct ReserveStock<S> {
    store: S,
}

#[async_trait]
impl<S: Storage> Step<OrderStage, S::Session, StepError> for ReserveStock<S> {
    fn name(&self) -> &'static str {
        "reserve_stock"
    }

    async fn execute(
        &self,
        stage: OrderStage,
        session: &mut S::Session,
    ) -> Result<OrderStage, StepError> {
        let order = match stage {
            OrderStage::Placed(order) => order,
            other => return Err(other.unexpected(self.name())),
        };

        for (product_id, quantity) in order.quantities() {
            let product = self
                .store
                .adjust_stock(session, product_id, -i64::from(quantity))
                .await?;
            tracing::debug!(product_id = %product.id, remaining = product.stock, "stock reserved");
        }

        Ok(OrderStage::Placed(order))
    }
}

struct ConfirmOrder<N> {
    notifier: N,
}

#[async_trait]
impl<N: Notifier, Sess: Send> Finalizer<OrderStage, Sess, StepError> for ConfirmOrder<N> {
    async fn finalize(
        &self,
        stage: &OrderStage,
        _session: Option<&mut Sess>,
    ) -> Result<(), StepError> {
        let OrderStage::Placed(order) = stage else {
            return Err(stage.unexpected("confirm_order"));
        };

        self.notifier
            .notify(Notification::OrderConfirmed {
                order_id: order.id,
                user_id: order.user_id,
                final_price: order.final_price,
            })
            .await?;
        Ok(())
    }
}

/// Creates orders atomically.
///
/// A run resolves the requested products, prices the order, persists it as
/// pending and decrements stock. Either all of that commits or none of it.
pub struct OrderFulfillment<S: Storage> {
    workflow: Workflow<S, OrderStage>,
}

impl<S> OrderFulfillment<S>
where
    S: Storage + Clone + 'static,
{
    pub fn new<N>(store: S, notifier: N, config: &WorkflowConfig) -> Self
    where
        N: Notifier + 'static,
    {
        let workflow = Workflow::builder(WORKFLOW_NAME, store.clone(), config.retry)
            .step(ResolveItems {
                store: store.clone(),
            })
            .step(PriceOrder {
                shipping: config.shipping.clone(),
            })
            .step(PersistOrder {
                store: store.clone(),
            })
            .step(ReserveStock { store })
            .finally(ConfirmOrder { notifier })
            .finalizer_mode(config.finalizer_mode)
            .build();

        Self { workflow }
    }

    pub fn workflow(&self) -> &Workflow<S, OrderStage> {
        &self.workflow
    }

    /// Creates a pending order and reserves its stock.
    #[tracing::instrument(
        skip(self, request),
        fields(user_id = %request.user_id, items = request.items.len())
    )]
    pub async fn create_order(&self, request: CreateOrderRequest) -> crate::Result<Order> {
        let stage = self
            .workflow
            .run(OrderStage::Requested(request))
            .await
            .map_err(PipelineError::OrderCreation)?;

        match stage {
            OrderStage::Placed(order) => {
                tracing::info!(
                    order_id = %order.id,
                    final_price = %order.final_price,
                    "order created"
                );
                Ok(order)
            }
            other => Err(PipelineError::Incomplete {
                workflow: WORKFLOW_NAME,
                stage: other.name(),
            }),
        }
    }
}
