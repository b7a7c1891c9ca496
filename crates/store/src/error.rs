use common::{OrderId, PaymentId};
use domain::{DomainError, ProductId};
use thiserror::Error;

/// Errors that can occur when interacting with the store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A concurrent transaction touched the same rows. Retrying usually helps.
    #[error("Write conflict: {0}")]
    WriteConflict(String),

    #[error("Product not found: {0}")]
    ProductNotFound(ProductId),

    #[error("Order not found: {0}")]
    OrderNotFound(OrderId),

    #[error("Payment not found: {0}")]
    PaymentNotFound(PaymentId),

    /// A stock adjustment would take the counter below zero.
    #[error(
        "Insufficient stock for product {product_id}: requested {requested}, available {available}"
    )]
    InsufficientStock {
        product_id: ProductId,
        requested: u64,
        available: u32,
    },

    #[error("Order already exists: {0}")]
    DuplicateOrder(OrderId),

    /// The gateway transaction id is already recorded on another payment.
    #[error("Duplicate transaction id: {0}")]
    DuplicateTransactionId(String),

    /// The session was already committed or aborted.
    #[error("Session is closed")]
    SessionClosed,

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A persisted row could not be mapped back to the domain model.
    #[error("Corrupt row: {0}")]
    Corrupt(#[from] DomainError),
}

impl StoreError {
    /// Returns true if the operation may succeed when attempted again.
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::WriteConflict(_) => true,
            StoreError::Database(err) => matches!(
                err,
                sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::WorkerCrashed
            ),
            _ => false,
        }
    }
}

/// Postgres SQLSTATE codes for serialization failure and deadlock.
const RETRYABLE_SQLSTATES: [&str; 2] = ["40001", "40P01"];

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(ref db_err) = err
            && let Some(code) = db_err.code()
            && RETRYABLE_SQLSTATES.contains(&code.as_ref())
        {
            return StoreError::WriteConflict(db_err.message().to_string());
        }
        StoreError::Database(err)
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
