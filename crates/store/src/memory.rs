use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use common::OrderId;
use domain::{Order, Payment, PaymentId, Product, ProductId};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::{
    Result, StoreError,
    store::{OrderRepository, PaymentRepository, ProductRepository, TransactionProvider},
};

#[derive(Debug, Clone, Default)]
struct Tables {
    products: HashMap<ProductId, Product>,
    orders: HashMap<OrderId, Order>,
    payments: HashMap<PaymentId, Payment>,
}

#[derive(Debug, Default)]
struct Counters {
    opened: AtomicU64,
    committed: AtomicU64,
    aborted: AtomicU64,
    ended: AtomicU64,
}

/// Snapshot of how many sessions went through each lifecycle stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionCounts {
    pub opened: u64,
    pub committed: u64,
    pub aborted: u64,
    pub ended: u64,
}

/// In-memory store implementation for testing.
///
/// A session holds the table lock for its whole lifetime and works on a
/// private copy of the tables, which replaces the shared tables on commit.
/// Sessions are therefore fully serialized, which gives the check-then-write
/// paths of the pipelines serializable isolation.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    tables: Arc<Mutex<Tables>>,
    counters: Arc<Counters>,
    pending_conflicts: Arc<AtomicU32>,
}

/// A transaction against an [`InMemoryStore`].
pub struct InMemorySession {
    guard: Option<OwnedMutexGuard<Tables>>,
    working: Tables,
    savepoint: Option<Tables>,
}

impl InMemorySession {
    fn tables(&mut self) -> Result<&mut Tables> {
        if self.guard.is_none() {
            return Err(StoreError::SessionClosed);
        }
        Ok(&mut self.working)
    }
}

impl std::fmt::Debug for InMemorySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemorySession")
            .field("open", &self.guard.is_some())
            .field("savepoint", &self.savepoint.is_some())
            .finish()
    }
}

impl InMemoryStore {
    /// Creates a new empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` writes fail with a retryable write conflict.
    pub fn inject_write_conflicts(&self, count: u32) {
        self.pending_conflicts.store(count, Ordering::SeqCst);
    }

    /// Returns the session lifecycle counters.
    pub fn session_counts(&self) -> SessionCounts {
        SessionCounts {
            opened: self.counters.opened.load(Ordering::SeqCst),
            committed: self.counters.committed.load(Ordering::SeqCst),
            aborted: self.counters.aborted.load(Ordering::SeqCst),
            ended: self.counters.ended.load(Ordering::SeqCst),
        }
    }

    /// Inserts or replaces a product outside of any session.
    pub async fn seed_product(&self, product: Product) {
        self.tables
            .lock()
            .await
            .products
            .insert(product.id.clone(), product);
    }

    /// Inserts or replaces an order outside of any session.
    pub async fn seed_order(&self, order: Order) {
        self.tables.lock().await.orders.insert(order.id, order);
    }

    /// Inserts or replaces a payment outside of any session.
    pub async fn seed_payment(&self, payment: Payment) {
        self.tables.lock().await.payments.insert(payment.id, payment);
    }

    /// Returns the committed state of a product.
    pub async fn product(&self, id: &ProductId) -> Option<Product> {
        self.tables.lock().await.products.get(id).cloned()
    }

    /// Returns the committed state of an order.
    pub async fn order(&self, id: OrderId) -> Option<Order> {
        self.tables.lock().await.orders.get(&id).cloned()
    }

    pub async fn orders(&self) -> Vec<Order> {
        self.tables.lock().await.orders.values().cloned().collect()
    }

    pub async fn payments(&self) -> Vec<Payment> {
        self.tables.lock().await.payments.values().cloned().collect()
    }

    /// Returns the committed payment with the given gateway transaction id.
    pub async fn payment_by_transaction_id(&self, transaction_id: &str) -> Option<Payment> {
        self.tables
            .lock()
            .await
            .payments
            .values()
            .find(|p| p.transaction_id == transaction_id)
            .cloned()
    }

    /// Consumes one injected conflict, if any is pending.
    fn check_conflict(&self) -> Result<()> {
        let injected = self
            .pending_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::WriteConflict(
                "injected write conflict".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl TransactionProvider for InMemoryStore {
    type Session = InMemorySession;

    async fn begin(&self) -> Result<InMemorySession> {
        let guard = self.tables.clone().lock_owned().await;
        let working = guard.clone();
        self.counters.opened.fetch_add(1, Ordering::SeqCst);
        Ok(InMemorySession {
            guard: Some(guard),
            working,
            savepoint: None,
        })
    }

    async fn commit(&self, session: &mut InMemorySession) -> Result<()> {
        let mut guard = session.guard.take().ok_or(StoreError::SessionClosed)?;
        *guard = std::mem::take(&mut session.working);
        session.savepoint = None;
        self.counters.committed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn abort(&self, session: &mut InMemorySession) -> Result<()> {
        session.guard.take().ok_or(StoreError::SessionClosed)?;
        session.working = Tables::default();
        session.savepoint = None;
        self.counters.aborted.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn end_session(&self, session: InMemorySession) {
        if session.guard.is_some() {
            tracing::debug!("ending open in-memory session, discarding writes");
        }
        drop(session);
        self.counters.ended.fetch_add(1, Ordering::SeqCst);
    }

    async fn savepoint(&self, session: &mut InMemorySession) -> Result<()> {
        let snapshot = session.tables()?.clone();
        session.savepoint = Some(snapshot);
        Ok(())
    }

    async fn rollback_to_savepoint(&self, session: &mut InMemorySession) -> Result<()> {
        session.tables()?;
        if let Some(snapshot) = session.savepoint.take() {
            session.working = snapshot;
        }
        Ok(())
    }

    async fn release_savepoint(&self, session: &mut InMemorySession) -> Result<()> {
        session.tables()?;
        session.savepoint = None;
        Ok(())
    }
}

#[async_trait]
impl ProductRepository for InMemoryStore {
    async fn find_products(
        &self,
        session: &mut InMemorySession,
        ids: &[ProductId],
    ) -> Result<Vec<Product>> {
        let tables = session.tables()?;
        Ok(ids
            .iter()
            .filter_map(|id| tables.products.get(id).cloned())
            .collect())
    }

    async fn adjust_stock(
        &self,
        session: &mut InMemorySession,
        id: &ProductId,
        delta: i64,
    ) -> Result<Product> {
        self.check_conflict()?;
        let tables = session.tables()?;
        let product = tables
            .products
            .get_mut(id)
            .ok_or_else(|| StoreError::ProductNotFound(id.clone()))?;

        let stock = product
            .stock_after(delta)
            .ok_or(StoreError::InsufficientStock {
                product_id: id.clone(),
                requested: delta.unsigned_abs(),
                available: product.stock,
            })?;

        product.stock = stock;
        product.updated_at = Utc::now();
        Ok(product.clone())
    }
}

#[async_trait]
impl OrderRepository for InMemoryStore {
    async fn insert_order(&self, session: &mut InMemorySession, order: &Order) -> Result<()> {
        self.check_conflict()?;
        let tables = session.tables()?;
        if tables.orders.contains_key(&order.id) {
            return Err(StoreError::DuplicateOrder(order.id));
        }
        tables.orders.insert(order.id, order.clone());
        Ok(())
    }

    async fn find_order(
        &self,
        session: &mut InMemorySession,
        id: OrderId,
    ) -> Result<Option<Order>> {
        Ok(session.tables()?.orders.get(&id).cloned())
    }

    async fn update_order(&self, session: &mut InMemorySession, order: &Order) -> Result<()> {
        self.check_conflict()?;
        let tables = session.tables()?;
        let existing = tables
            .orders
            .get_mut(&order.id)
            .ok_or(StoreError::OrderNotFound(order.id))?;
        *existing = order.clone();
        Ok(())
    }
}

#[async_trait]
impl PaymentRepository for InMemoryStore {
    async fn insert_payment(&self, session: &mut InMemorySession, payment: &Payment) -> Result<()> {
        self.check_conflict()?;
        let tables = session.tables()?;
        if tables
            .payments
            .values()
            .any(|p| p.transaction_id == payment.transaction_id)
        {
            return Err(StoreError::DuplicateTransactionId(
                payment.transaction_id.clone(),
            ));
        }
        tables.payments.insert(payment.id, payment.clone());
        Ok(())
    }

    async fn find_payment_by_transaction_id(
        &self,
        session: &mut InMemorySession,
        transaction_id: &str,
    ) -> Result<Option<Payment>> {
        Ok(session
            .tables()?
            .payments
            .values()
            .find(|p| p.transaction_id == transaction_id)
            .cloned())
    }

    async fn update_payment(&self, session: &mut InMemorySession, payment: &Payment) -> Result<()> {
        self.check_conflict()?;
        let tables = session.tables()?;
        let existing = tables
            .payments
            .get_mut(&payment.id)
            .ok_or(StoreError::PaymentNotFound(payment.id))?;
        *existing = payment.clone();
        Ok(())
    }
}
