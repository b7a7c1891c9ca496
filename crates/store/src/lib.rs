//! Transactional storage for the order workflow system.
//!
//! Every repository operation takes the session opened by
//! [`TransactionProvider::begin`], so all writes of one workflow run commit
//! or roll back together.

pub mod error;
pub mod memory;
pub mod postgres;
pub mod store;

pub use error::{Result, StoreError};
pub use memory::{InMemorySession, InMemoryStore, SessionCounts};
pub use postgres::{PgSession, PostgresStore};
pub use store::{
    OrderRepository, PaymentRepository, ProductRepository, Storage, TransactionProvider,
};
