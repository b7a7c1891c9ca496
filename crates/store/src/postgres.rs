use std::collections::BTreeMap;

use async_trait::async_trait;
use common::{OrderId, PaymentId, UserId};
use domain::{Money, Order, OrderLine, Payment, PaymentSummary, Product, ProductId};
use sqlx::{
    PgConnection, PgPool, Postgres, Row, Transaction,
    postgres::{PgPoolOptions, PgRow},
};
use tracing::info;
use uuid::Uuid;

use crate::{
    Result, StoreError,
    store::{OrderRepository, PaymentRepository, ProductRepository, TransactionProvider},
};

const UNIQUE_TRANSACTION_ID: &str = "unique_transaction_id";

/// PostgreSQL-backed store implementation.
///
/// Sessions run at READ COMMITTED. Stock is decremented with a conditional
/// `UPDATE`, and rows read by [`ProductRepository::find_products`] are locked
/// with `FOR UPDATE`, so concurrent orders for the same product serialize on
/// the product row.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

/// A transaction against a [`PostgresStore`].
///
/// Dropping a session with an open transaction rolls it back.
pub struct PgSession {
    tx: Option<Transaction<'static, Postgres>>,
}

impl PgSession {
    fn conn(&mut self) -> Result<&mut PgConnection> {
        match self.tx.as_mut() {
            Some(tx) => Ok(&mut **tx),
            None => Err(StoreError::SessionClosed),
        }
    }
}

impl PostgresStore {
    /// Creates a new PostgreSQL store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connects to `database_url` and brings the schema up to date.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        let store = Self::new(pool);
        store.run_migrations().await?;
        info!(max_connections, "connected to postgres");
        Ok(store)
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Inserts or replaces a product outside of any session.
    pub async fn upsert_product(&self, product: &Product) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO products (id, name, price_cents, stock, updated_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO UPDATE
            SET name = EXCLUDED.name,
                price_cents = EXCLUDED.price_cents,
                stock = EXCLUDED.stock,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(product.id.as_str())
        .bind(&product.name)
        .bind(product.price.cents())
        .bind(i64::from(product.stock))
        .bind(product.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    fn row_to_product(row: PgRow) -> Result<Product> {
        let stock: i64 = row.try_get("stock")?;
        let stock = u32::try_from(stock).map_err(|e| sqlx::Error::Decode(Box::new(e)))?;

        Ok(Product {
            id: ProductId::new(row.try_get::<String, _>("id")?),
            name: row.try_get("name")?,
            price: Money::from_cents(row.try_get("price_cents")?),
            stock,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn row_to_order(row: PgRow) -> Result<Order> {
        let lines: Vec<OrderLine> = serde_json::from_value(row.try_get("lines")?)?;
        let payment_info: PaymentSummary = serde_json::from_value(row.try_get("payment_info")?)?;
        let status: String = row.try_get("status")?;

        Ok(Order {
            id: OrderId::from_uuid(row.try_get::<Uuid, _>("id")?),
            user_id: UserId::from_uuid(row.try_get::<Uuid, _>("user_id")?),
            lines,
            total_price: Money::from_cents(row.try_get("total_cents")?),
            shipping_fee: Money::from_cents(row.try_get("shipping_fee_cents")?),
            final_price: Money::from_cents(row.try_get("final_cents")?),
            status: status.parse()?,
            shipping_address: row.try_get("shipping_address")?,
            payment_info,
            paid_at: row.try_get("paid_at")?,
            completed_at: row.try_get("completed_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn row_to_payment(row: PgRow) -> Result<Payment> {
        let metadata: BTreeMap<String, String> = serde_json::from_value(row.try_get("metadata")?)?;
        let payment_type: String = row.try_get("payment_type")?;
        let status: String = row.try_get("status")?;
        let refunded: Option<i64> = row.try_get("refunded_cents")?;

        Ok(Payment {
            id: PaymentId::from_uuid(row.try_get::<Uuid, _>("id")?),
            order_id: OrderId::from_uuid(row.try_get::<Uuid, _>("order_id")?),
            user_id: UserId::from_uuid(row.try_get::<Uuid, _>("user_id")?),
            amount: Money::from_cents(row.try_get("amount_cents")?),
            payment_method: row.try_get("payment_method")?,
            payment_type: payment_type.parse()?,
            status: status.parse()?,
            transaction_id: row.try_get("transaction_id")?,
            currency: row.try_get("currency")?,
            refunded_amount: refunded.map(Money::from_cents),
            metadata,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[async_trait]
impl TransactionProvider for PostgresStore {
    type Session = PgSession;

    async fn begin(&self) -> Result<PgSession> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL READ COMMITTED")
            .execute(&mut *tx)
            .await?;
        metrics::counter!("store_sessions_opened_total").increment(1);
        Ok(PgSession { tx: Some(tx) })
    }

    async fn commit(&self, session: &mut PgSession) -> Result<()> {
        let tx = session.tx.take().ok_or(StoreError::SessionClosed)?;
        tx.commit().await?;
        metrics::counter!("store_sessions_committed_total").increment(1);
        Ok(())
    }

    async fn abort(&self, session: &mut PgSession) -> Result<()> {
        let tx = session.tx.take().ok_or(StoreError::SessionClosed)?;
        tx.rollback().await?;
        metrics::counter!("store_sessions_aborted_total").increment(1);
        Ok(())
    }

    async fn end_session(&self, mut session: PgSession) {
        if let Some(tx) = session.tx.take()
            && let Err(e) = tx.rollback().await
        {
            tracing::warn!(error = %e, "Failed to roll back open session");
        }
    }

    async fn savepoint(&self, session: &mut PgSession) -> Result<()> {
        sqlx::query("SAVEPOINT workflow_step")
            .execute(session.conn()?)
            .await?;
        Ok(())
    }

    async fn rollback_to_savepoint(&self, session: &mut PgSession) -> Result<()> {
        let conn = session.conn()?;
        sqlx::query("ROLLBACK TO SAVEPOINT workflow_step")
            .execute(&mut *conn)
            .await?;
        sqlx::query("RELEASE SAVEPOINT workflow_step")
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    async fn release_savepoint(&self, session: &mut PgSession) -> Result<()> {
        sqlx::query("RELEASE SAVEPOINT workflow_step")
            .execute(session.conn()?)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ProductRepository for PostgresStore {
    async fn find_products(
        &self,
        session: &mut PgSession,
        ids: &[ProductId],
    ) -> Result<Vec<Product>> {
        let ids: Vec<String> = ids.iter().map(|id| id.as_str().to_string()).collect();
        let rows = sqlx::query(
            r#"
            SELECT id, name, price_cents, stock, updated_at
            FROM products
            WHERE id = ANY($1)
            ORDER BY id
            FOR UPDATE
            "#,
        )
        .bind(&ids)
        .fetch_all(session.conn()?)
        .await?;

        rows.into_iter().map(Self::row_to_product).collect()
    }

    async fn adjust_stock(
        &self,
        session: &mut PgSession,
        id: &ProductId,
        delta: i64,
    ) -> Result<Product> {
        let conn = session.conn()?;
        let row = sqlx::query(
            r#"
            UPDATE products
            SET stock = stock + $2, updated_at = NOW()
            WHERE id = $1 AND stock + $2 >= 0
            RETURNING id, name, price_cents, stock, updated_at
            "#,
        )
        .bind(id.as_str())
        .bind(delta)
        .fetch_optional(&mut *conn)
        .await?;

        if let Some(row) = row {
            return Self::row_to_product(row);
        }

        // Nothing updated: either the product is missing or stock is short
        let available: Option<i64> = sqlx::query_scalar("SELECT stock FROM products WHERE id = $1")
            .bind(id.as_str())
            .fetch_optional(&mut *conn)
            .await?;

        match available {
            Some(available) => Err(StoreError::InsufficientStock {
                product_id: id.clone(),
                requested: delta.unsigned_abs(),
                available: u32::try_from(available).unwrap_or(0),
            }),
            None => Err(StoreError::ProductNotFound(id.clone())),
        }
    }
}

#[async_trait]
impl OrderRepository for PostgresStore {
    async fn insert_order(&self, session: &mut PgSession, order: &Order) -> Result<()> {
        let lines = serde_json::to_value(&order.lines)?;
        let payment_info = serde_json::to_value(&order.payment_info)?;

        sqlx::query(
            r#"
            INSERT INTO orders (
                id, user_id, lines, total_cents, shipping_fee_cents, final_cents, status,
                shipping_address, payment_info, paid_at, completed_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(order.id.as_uuid())
        .bind(order.user_id.as_uuid())
        .bind(lines)
        .bind(order.total_price.cents())
        .bind(order.shipping_fee.cents())
        .bind(order.final_price.cents())
        .bind(order.status.as_str())
        .bind(&order.shipping_address)
        .bind(payment_info)
        .bind(order.paid_at)
        .bind(order.completed_at)
        .bind(order.created_at)
        .bind(order.updated_at)
        .execute(session.conn()?)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(ref db_err) = e
                && db_err.is_unique_violation()
            {
                return StoreError::DuplicateOrder(order.id);
            }
            StoreError::from(e)
        })?;

        Ok(())
    }

    async fn find_order(&self, session: &mut PgSession, id: OrderId) -> Result<Option<Order>> {
        let row = sqlx::query(
            r#"
            SELECT id, user_id, lines, total_cents, shipping_fee_cents, final_cents, status,
                   shipping_address, payment_info, paid_at, completed_at, created_at, updated_at
            FROM orders
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(session.conn()?)
        .await?;

        row.map(Self::row_to_order).transpose()
    }

    async fn update_order(&self, session: &mut PgSession, order: &Order) -> Result<()> {
        let payment_info = serde_json::to_value(&order.payment_info)?;

        let result = sqlx::query(
            r#"
            UPDATE orders
            SET status = $2, payment_info = $3, paid_at = $4, completed_at = $5, updated_at = $6
            WHERE id = $1
            "#,
        )
        .bind(order.id.as_uuid())
        .bind(order.status.as_str())
        .bind(payment_info)
        .bind(order.paid_at)
        .bind(order.completed_at)
        .bind(order.updated_at)
        .execute(session.conn()?)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::OrderNotFound(order.id));
        }
        Ok(())
    }
}

#[async_trait]
impl PaymentRepository for PostgresStore {
    async fn insert_payment(&self, session: &mut PgSession, payment: &Payment) -> Result<()> {
        let metadata = serde_json::to_value(&payment.metadata)?;

        sqlx::query(
            r#"
            INSERT INTO payments (
                id, order_id, user_id, amount_cents, payment_method, payment_type, status,
                transaction_id, currency, refunded_cents, metadata, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(payment.id.as_uuid())
        .bind(payment.order_id.as_uuid())
        .bind(payment.user_id.as_uuid())
        .bind(payment.amount.cents())
        .bind(&payment.payment_method)
        .bind(payment.payment_type.as_str())
        .bind(payment.status.as_str())
        .bind(&payment.transaction_id)
        .bind(&payment.currency)
        .bind(payment.refunded_amount.map(|m| m.cents()))
        .bind(metadata)
        .bind(payment.created_at)
        .bind(payment.updated_at)
        .execute(session.conn()?)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(ref db_err) = e
                && db_err.constraint() == Some(UNIQUE_TRANSACTION_ID)
            {
                return StoreError::DuplicateTransactionId(payment.transaction_id.clone());
            }
            StoreError::from(e)
        })?;

        Ok(())
    }

    async fn find_payment_by_transaction_id(
        &self,
        session: &mut PgSession,
        transaction_id: &str,
    ) -> Result<Option<Payment>> {
        let row = sqlx::query(
            r#"
            SELECT id, order_id, user_id, amount_cents, payment_method, payment_type, status,
                   transaction_id, currency, refunded_cents, metadata, created_at, updated_at
            FROM payments
            WHERE transaction_id = $1
            FOR UPDATE
            "#,
        )
        .bind(transaction_id)
        .fetch_optional(session.conn()?)
        .await?;

        row.map(Self::row_to_payment).transpose()
    }

    async fn update_payment(&self, session: &mut PgSession, payment: &Payment) -> Result<()> {
        let metadata = serde_json::to_value(&payment.metadata)?;

        let result = sqlx::query(
            r#"
            UPDATE payments
            SET status = $2, refunded_cents = $3, metadata = $4, updated_at = $5
            WHERE id = $1
            "#,
        )
        .bind(payment.id.as_uuid())
        .bind(payment.status.as_str())
        .bind(payment.refunded_amount.map(|m| m.cents()))
        .bind(metadata)
        .bind(payment.updated_at)
        .execute(session.conn()?)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::PaymentNotFound(payment.id));
        }
        Ok(())
    }
}
