use async_trait::async_trait;
use common::OrderId;
use domain::{Order, Payment, Product, ProductId};

use crate::Result;

/// Opens and closes atomic units of work against the persistent store.
///
/// A session is acquired once per workflow run and must be handed back to
/// [`end_session`](TransactionProvider::end_session) exactly once, whatever
/// the outcome. Implementations must also release the session's resources
/// when it is dropped without being ended, and dropping an uncommitted
/// session must discard its writes.
///
/// Savepoints let a caller undo the writes of one failed attempt while
/// keeping the surrounding transaction open. At most one savepoint is
/// active at a time.
#[async_trait]
pub trait TransactionProvider: Send + Sync {
    /// The handle all repository operations of one unit of work share.
    type Session: Send;

    /// Starts a new transaction.
    async fn begin(&self) -> Result<Self::Session>;

    /// Makes every write of the session visible atomically.
    async fn commit(&self, session: &mut Self::Session) -> Result<()>;

    /// Discards every write of the session.
    async fn abort(&self, session: &mut Self::Session) -> Result<()>;

    /// Releases the session. Ending an uncommitted session discards its writes.
    async fn end_session(&self, session: Self::Session);

    /// Marks the current state of the session as a rollback point.
    async fn savepoint(&self, session: &mut Self::Session) -> Result<()>;

    /// Discards writes made since the last savepoint and removes it.
    async fn rollback_to_savepoint(&self, session: &mut Self::Session) -> Result<()>;

    /// Keeps writes made since the last savepoint and removes it.
    async fn release_savepoint(&self, session: &mut Self::Session) -> Result<()>;
}

/// Session-scoped product access.
#[async_trait]
pub trait ProductRepository: TransactionProvider {
    /// Loads the products with the given ids.
    ///
    /// Missing ids are skipped, so callers compare the result against the
    /// ids they asked for. Implementations lock the returned rows for the
    /// rest of the session where the engine supports it.
    async fn find_products(
        &self,
        session: &mut Self::Session,
        ids: &[ProductId],
    ) -> Result<Vec<Product>>;

    /// Atomically adds `delta` to a product's stock counter.
    ///
    /// Fails with `InsufficientStock` instead of taking stock below zero.
    async fn adjust_stock(
        &self,
        session: &mut Self::Session,
        id: &ProductId,
        delta: i64,
    ) -> Result<Product>;
}

/// Session-scoped order access.
#[async_trait]
pub trait OrderRepository: TransactionProvider {
    async fn insert_order(&self, session: &mut Self::Session, order: &Order) -> Result<()>;

    async fn find_order(&self, session: &mut Self::Session, id: OrderId) -> Result<Option<Order>>;

    /// Persists the mutable fields of an existing order.
    async fn update_order(&self, session: &mut Self::Session, order: &Order) -> Result<()>;
}

/// Session-scoped payment access.
#[async_trait]
pub trait PaymentRepository: TransactionProvider {
    /// Inserts a payment. Fails with `DuplicateTransactionId` if the
    /// transaction id is already recorded.
    async fn insert_payment(&self, session: &mut Self::Session, payment: &Payment) -> Result<()>;

    async fn find_payment_by_transaction_id(
        &self,
        session: &mut Self::Session,
        transaction_id: &str,
    ) -> Result<Option<Payment>>;

    /// Persists the mutable fields of an existing payment.
    async fn update_payment(&self, session: &mut Self::Session, payment: &Payment) -> Result<()>;
}

/// Everything the workflow pipelines need from storage.
pub trait Storage: ProductRepository + OrderRepository + PaymentRepository {}

// Blanket implementation for all stores providing every repository
impl<T> Storage for T where T: ProductRepository + OrderRepository + PaymentRepository {}
