//! Identifier types shared by every layer of the workflow system.

mod types;

pub use types::{OrderId, PaymentId, UserId};
