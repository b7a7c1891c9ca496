//! Products and their stock counter.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::money::Money;

/// Stock-keeping unit identifying a product.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProductId(String);

impl ProductId {
    pub fn new(sku: impl Into<String>) -> Self {
        Self(sku.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ProductId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProductId {
    fn from(sku: &str) -> Self {
        Self::new(sku)
    }
}

impl From<String> for ProductId {
    fn from(sku: String) -> Self {
        Self(sku)
    }
}

/// A sellable product.
///
/// Only the fields the pipelines need are modelled; catalogue data such as
/// descriptions, categories and images lives with the CRUD layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub id: ProductId,
    pub name: String,
    /// Current unit price. Orders snapshot this at creation.
    pub price: Money,
    /// Units available. Never negative.
    pub stock: u32,
    pub updated_at: DateTime<Utc>,
}

impl Product {
    pub fn new(
        id: impl Into<ProductId>,
        name: impl Into<String>,
        price: Money,
        stock: u32,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            price,
            stock,
            updated_at: Utc::now(),
        }
    }

    /// Returns true if `quantity` units, summed over all lines of an
    /// order, can be taken from stock.
    pub fn has_stock_for(&self, quantity: u64) -> bool {
        u64::from(self.stock) >= quantity
    }

    /// Returns the stock level after applying `delta`, or `None` if the
    /// result would be negative or overflow.
    pub fn stock_after(&self, delta: i64) -> Option<u32> {
        let next = i64::from(self.stock).checked_add(delta)?;
        u32::try_from(next).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn widget(stock: u32) -> Product {
        Product::new("SKU-001", "Widget", Money::from_dollars(10), stock)
    }

    #[test]
    fn test_product_id_is_a_plain_string() {
        let id: ProductId = "SKU-001".into();
        assert_eq!(id.to_string(), "SKU-001");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"SKU-001\"");
    }

    #[test]
    fn test_has_stock_for_summed_quantity() {
        let product = widget(5);
        assert!(product.has_stock_for(5));
        assert!(!product.has_stock_for(6));
        assert!(!product.has_stock_for(u64::from(u32::MAX) + 1));
    }

    #[test]
    fn test_stock_after_never_negative() {
        let product = widget(5);
        assert_eq!(product.stock_after(-5), Some(0));
        assert_eq!(product.stock_after(-6), None);
        assert_eq!(product.stock_after(3), Some(8));
        assert_eq!(product.stock_after(i64::MAX), None);
    }
}
