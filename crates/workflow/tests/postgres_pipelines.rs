//! Pipelines running against PostgreSQL.
//!
//! The store is opened through `WorkflowConfig::connect_store`, so these
//! tests also cover migrations on a fresh database. Run with:
//!
//! ```bash
//! cargo test -p workflow --test postgres_pipelines -- --test-threads=1
//! ```

use std::sync::Arc;

use common::{OrderId, UserId};
use domain::{Money, Order, OrderStatus, PaymentStatus, Product, ProductId};
use serial_test::serial;
use store::{OrderRepository, PostgresStore, ProductRepository, TransactionProvider};
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;
use workflow::{
    ChargeStatus, CreateOrderRequest, InMemoryNotifier, InMemoryPaymentGateway, OrderFulfillment,
    OrderItemRequest, PaymentProcessing, PaymentRequest, ReconcileOutcome, RetryPolicy, StepError,
    WebhookDelivery, WebhookReconciliation, WorkflowConfig,
};

const CARD: &str = "pm_card_visa";

struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Postgres>,
    connection_string: String,
}

static CONTAINER: OnceCell<Arc<ContainerInfo>> = OnceCell::const_new();

async fn connection_string() -> String {
    let info = CONTAINER
        .get_or_init(|| async {
            let container = Postgres::default().start().await.unwrap();
            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(5432).await.unwrap();

            Arc::new(ContainerInfo {
                container,
                connection_string: format!(
                    "postgres://postgres:postgres@{}:{}/postgres",
                    host, port
                ),
            })
        })
        .await;
    info.connection_string.clone()
}

struct Pipelines {
    orders: OrderFulfillment<PostgresStore>,
    payments: PaymentProcessing<PostgresStore>,
    webhooks: WebhookReconciliation<PostgresStore>,
    store: PostgresStore,
    gateway: InMemoryPaymentGateway,
}

impl Pipelines {
    async fn new() -> Self {
        let config = WorkflowConfig {
            retry: RetryPolicy::immediate(3),
            database_url: Some(connection_string().await),
            max_connections: 5,
            ..WorkflowConfig::default()
        };
        let store = config
            .connect_store()
            .await
            .unwrap()
            .expect("database configured");

        sqlx::query("TRUNCATE TABLE payments, orders, products")
            .execute(store.pool())
            .await
            .unwrap();
        store
            .upsert_product(&Product::new("SKU-001", "Widget", Money::from_dollars(10), 10))
            .await
            .unwrap();
        store
            .upsert_product(&Product::new("SKU-002", "Gadget", Money::from_dollars(20), 5))
            .await
            .unwrap();

        let gateway = InMemoryPaymentGateway::from_config(&config);
        gateway.register_payment_method(CARD, "card");
        let notifier = InMemoryNotifier::new();

        Self {
            orders: OrderFulfillment::new(store.clone(), notifier.clone(), &config),
            payments: PaymentProcessing::new(
                store.clone(),
                gateway.clone(),
                notifier.clone(),
                &config,
            ),
            webhooks: WebhookReconciliation::new(store.clone(), gateway.clone(), notifier, &config),
            store,
            gateway,
        }
    }

    fn request(items: &[(&str, u32)]) -> CreateOrderRequest {
        CreateOrderRequest {
            user_id: UserId::new(),
            items: items
                .iter()
                .map(|(id, qty)| OrderItemRequest::new(*id, *qty))
                .collect(),
            shipping_address: "1 Main St, Springfield".to_string(),
        }
    }

    async fn order(&self, id: OrderId) -> Option<Order> {
        let mut session = self.store.begin().await.unwrap();
        let order = self.store.find_order(&mut session, id).await.unwrap();
        self.store.end_session(session).await;
        order
    }

    async fn stock(&self, id: &str) -> u32 {
        let mut session = self.store.begin().await.unwrap();
        let products = self
            .store
            .find_products(&mut session, &[ProductId::new(id)])
            .await
            .unwrap();
        self.store.end_session(session).await;
        products[0].stock
    }

    fn succeeded(&self, transaction_id: &str) -> WebhookDelivery {
        let payload = serde_json::json!({
            "id": "evt_1",
            "type": "payment_intent.succeeded",
            "data": { "object": { "id": transaction_id } }
        })
        .to_string();
        let signature = self.gateway.sign(payload.as_bytes()).unwrap();
        WebhookDelivery::new(payload, signature)
    }
}

#[tokio::test]
#[serial]
async fn test_order_paid_and_reconciled() {
    let p = Pipelines::new().await;
    p.gateway.set_charge_status(ChargeStatus::Pending);

    let order = p
        .orders
        .create_order(Pipelines::request(&[("SKU-001", 2), ("SKU-002", 1)]))
        .await
        .unwrap();
    assert_eq!(order.final_price, Money::from_dollars(50));
    assert_eq!(p.stock("SKU-001").await, 8);

    let payment = p
        .payments
        .process_payment(PaymentRequest {
            order_id: order.id,
            payment_method_id: CARD.to_string(),
            user_id: order.user_id,
        })
        .await
        .unwrap();
    assert_eq!(payment.status, PaymentStatus::Pending);

    let reconciliation = p
        .webhooks
        .reconcile(p.succeeded(&payment.transaction_id))
        .await
        .unwrap();
    assert_eq!(reconciliation.outcome, ReconcileOutcome::Applied);

    let stored = p.order(order.id).await.unwrap();
    assert_eq!(stored.status, OrderStatus::Processing);
    assert_eq!(stored.payment_info.status, PaymentStatus::Succeeded);
    assert!(stored.paid_at.is_some());
}

#[tokio::test]
#[serial]
async fn test_rejected_order_leaves_no_rows() {
    let p = Pipelines::new().await;

    let err = p
        .orders
        .create_order(Pipelines::request(&[("SKU-001", 3), ("SKU-002", 6)]))
        .await
        .unwrap_err();

    assert!(matches!(
        err.step_error(),
        Some(StepError::InsufficientStock { available: 5, .. })
    ));
    assert_eq!(p.stock("SKU-001").await, 10);
    assert_eq!(p.stock("SKU-002").await, 5);

    let orders: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM orders")
        .fetch_one(p.store.pool())
        .await
        .unwrap();
    assert_eq!(orders, 0);
}
