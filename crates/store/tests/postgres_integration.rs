//! PostgreSQL integration tests
//!
//! These tests use a shared PostgreSQL container for efficiency.
//! Run with:
//!
//! ```bash
//! cargo test -p store --test postgres_integration -- --test-threads=1
//! ```

use std::sync::Arc;

use domain::{
    FlatRate, Money, Order, OrderLine, OrderStatus, Payment, PaymentStatus, PaymentType, Pricing,
    Product, ProductId, UserId,
};
use serial_test::serial;
use store::{
    OrderRepository, PaymentRepository, PostgresStore, ProductRepository, StoreError,
    TransactionProvider,
};
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

/// Shared container info - container stays alive for all tests
struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Postgres>,
    connection_string: String,
}

/// Global shared container
static CONTAINER: OnceCell<Arc<ContainerInfo>> = OnceCell::const_new();

async fn get_container_info() -> Arc<ContainerInfo> {
    CONTAINER
        .get_or_init(|| async {
            let container = Postgres::default().start().await.unwrap();

            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(5432).await.unwrap();

            let connection_string =
                format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

            Arc::new(ContainerInfo {
                container,
                connection_string,
            })
        })
        .await
        .clone()
}

/// Get a fresh store with its own pool and cleared tables
async fn get_test_store() -> PostgresStore {
    let info = get_container_info().await;

    let store = PostgresStore::connect(&info.connection_string, 5)
        .await
        .unwrap();

    sqlx::query("TRUNCATE TABLE payments, orders, products")
        .execute(store.pool())
        .await
        .unwrap();

    store
}

fn widget(stock: u32) -> Product {
    Product::new("SKU-001", "Widget", Money::from_dollars(10), stock)
}

fn order() -> Order {
    let lines = vec![OrderLine::new("SKU-001", "Widget", 2, Money::from_dollars(10))];
    let pricing = Pricing::for_lines(&lines, &FlatRate(Money::from_dollars(10))).unwrap();
    Order::place(UserId::new(), lines, pricing, "1 Main St").unwrap()
}

async fn committed_stock(store: &PostgresStore, id: &str) -> u32 {
    let mut session = store.begin().await.unwrap();
    let products = store
        .find_products(&mut session, &[ProductId::new(id)])
        .await
        .unwrap();
    store.end_session(session).await;
    products[0].stock
}

#[tokio::test]
#[serial]
async fn test_migrations_rerun_cleanly() {
    let store = get_test_store().await;
    store.upsert_product(&widget(3)).await.unwrap();

    store.run_migrations().await.unwrap();

    let applied: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM _sqlx_migrations")
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(applied, 1);
    assert_eq!(committed_stock(&store, "SKU-001").await, 3);
}

#[tokio::test]
#[serial]
async fn test_order_round_trip() {
    let store = get_test_store().await;
    let order = order();

    let mut session = store.begin().await.unwrap();
    store.insert_order(&mut session, &order).await.unwrap();
    store.commit(&mut session).await.unwrap();
    store.end_session(session).await;

    let mut session = store.begin().await.unwrap();
    let loaded = store
        .find_order(&mut session, order.id)
        .await
        .unwrap()
        .unwrap();
    store.end_session(session).await;

    assert_eq!(loaded.id, order.id);
    assert_eq!(loaded.lines, order.lines);
    assert_eq!(loaded.final_price, Money::from_dollars(30));
    assert_eq!(loaded.status, OrderStatus::Pending);
    assert_eq!(loaded.payment_info, order.payment_info);
}

#[tokio::test]
#[serial]
async fn test_abort_discards_writes() {
    let store = get_test_store().await;
    store.upsert_product(&widget(5)).await.unwrap();
    let order = order();

    let mut session = store.begin().await.unwrap();
    store.insert_order(&mut session, &order).await.unwrap();
    store
        .adjust_stock(&mut session, &ProductId::new("SKU-001"), -2)
        .await
        .unwrap();
    store.abort(&mut session).await.unwrap();
    store.end_session(session).await;

    let mut session = store.begin().await.unwrap();
    assert!(store.find_order(&mut session, order.id).await.unwrap().is_none());
    store.end_session(session).await;
    assert_eq!(committed_stock(&store, "SKU-001").await, 5);
}

#[tokio::test]
#[serial]
async fn test_ended_session_rolls_back() {
    let store = get_test_store().await;
    store.upsert_product(&widget(5)).await.unwrap();

    let mut session = store.begin().await.unwrap();
    store
        .adjust_stock(&mut session, &ProductId::new("SKU-001"), -5)
        .await
        .unwrap();
    store.end_session(session).await;

    assert_eq!(committed_stock(&store, "SKU-001").await, 5);
}

#[tokio::test]
#[serial]
async fn test_adjust_stock_rejects_negative_result() {
    let store = get_test_store().await;
    store.upsert_product(&widget(2)).await.unwrap();

    let mut session = store.begin().await.unwrap();
    let result = store
        .adjust_stock(&mut session, &ProductId::new("SKU-001"), -3)
        .await;
    assert!(matches!(
        result,
        Err(StoreError::InsufficientStock {
            requested: 3,
            available: 2,
            ..
        })
    ));

    let result = store
        .adjust_stock(&mut session, &ProductId::new("SKU-404"), -1)
        .await;
    assert!(matches!(result, Err(StoreError::ProductNotFound(_))));
    store.end_session(session).await;
}

#[tokio::test]
#[serial]
async fn test_savepoint_rollback_keeps_earlier_writes() {
    let store = get_test_store().await;
    store.upsert_product(&widget(5)).await.unwrap();
    let id = ProductId::new("SKU-001");

    let mut session = store.begin().await.unwrap();
    store.adjust_stock(&mut session, &id, -1).await.unwrap();

    store.savepoint(&mut session).await.unwrap();
    store.adjust_stock(&mut session, &id, -2).await.unwrap();
    store.rollback_to_savepoint(&mut session).await.unwrap();

    store.savepoint(&mut session).await.unwrap();
    store.adjust_stock(&mut session, &id, -3).await.unwrap();
    store.release_savepoint(&mut session).await.unwrap();

    store.commit(&mut session).await.unwrap();
    store.end_session(session).await;

    assert_eq!(committed_stock(&store, "SKU-001").await, 1);
}

#[tokio::test]
#[serial]
async fn test_payment_round_trip_and_duplicate_transaction_id() {
    let store = get_test_store().await;
    let order = order();
    let payment = Payment::new(order.id, order.user_id, order.final_price, "pi_0001")
        .with_method("pm_card_visa", PaymentType::Card)
        .with_metadata("order_id", order.id.to_string());

    let mut session = store.begin().await.unwrap();
    store.insert_order(&mut session, &order).await.unwrap();
    store.insert_payment(&mut session, &payment).await.unwrap();
    store.commit(&mut session).await.unwrap();
    store.end_session(session).await;

    let mut session = store.begin().await.unwrap();
    let mut loaded = store
        .find_payment_by_transaction_id(&mut session, "pi_0001")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(loaded.id, payment.id);
    assert_eq!(loaded.metadata, payment.metadata);
    assert_eq!(loaded.payment_type, PaymentType::Card);

    loaded.apply_status(PaymentStatus::Succeeded);
    store.update_payment(&mut session, &loaded).await.unwrap();

    let duplicate = Payment::new(order.id, order.user_id, order.final_price, "pi_0001");
    let result = store.insert_payment(&mut session, &duplicate).await;
    assert!(matches!(result, Err(StoreError::DuplicateTransactionId(_))));
    store.end_session(session).await;
}

#[tokio::test]
#[serial]
async fn test_concurrent_decrements_never_oversell() {
    let store = get_test_store().await;
    store.upsert_product(&widget(3)).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..6 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            let mut session = store.begin().await.unwrap();
            let result = store
                .adjust_stock(&mut session, &ProductId::new("SKU-001"), -1)
                .await;
            if result.is_ok() {
                store.commit(&mut session).await.unwrap();
            }
            store.end_session(session).await;
            result.is_ok()
        }));
    }

    let mut succeeded = 0;
    for handle in handles {
        if handle.await.unwrap() {
            succeeded += 1;
        }
    }

    assert_eq!(succeeded, 3);
    assert_eq!(committed_stock(&store, "SKU-001").await, 0);
}
