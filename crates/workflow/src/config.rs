//! Workflow configuration loaded from environment variables.

use std::sync::Arc;
use std::time::Duration;

use domain::{DEFAULT_CURRENCY, FlatRate, FreeShippingOver, Money, ShippingPolicy};
use store::PostgresStore;

use crate::engine::{FinalizerMode, RetryPolicy};
use crate::gateway::webhook::DEFAULT_TOLERANCE;

/// Settings shared by the pipelines.
///
/// Reads from environment variables:
/// - `WORKFLOW_MAX_ATTEMPTS`: attempts per step (default: `3`)
/// - `WORKFLOW_BACKOFF_MS`: delay before the first retry (default: `50`)
/// - `WORKFLOW_MAX_BACKOFF_MS`: backoff cap (default: `2000`)
/// - `WORKFLOW_STEP_TIMEOUT_MS`: per-attempt deadline, `0` disables (default: `10000`)
/// - `WORKFLOW_NOTIFY_AFTER_COMMIT`: send notifications after commit (default: `false`)
/// - `SHIPPING_FLAT_FEE_CENTS`: flat shipping fee (default: `1000`)
/// - `SHIPPING_FREE_OVER_CENTS`: waive shipping from this subtotal (default: unset)
/// - `PAYMENT_CURRENCY`: charge currency (default: `"usd"`)
/// - `PAYMENT_WEBHOOK_SECRET`: webhook signing secret (default: `"whsec_test"`)
/// - `PAYMENT_WEBHOOK_TOLERANCE_SECS`: signature timestamp tolerance (default: `300`)
/// - `DATABASE_URL`: PostgreSQL connection string (default: unset)
/// - `DATABASE_MAX_CONNECTIONS`: pool size for `DATABASE_URL` (default: `10`)
#[derive(Debug, Clone)]
pub struct WorkflowConfig {
    pub retry: RetryPolicy,
    pub finalizer_mode: FinalizerMode,
    pub shipping: Arc<dyn ShippingPolicy>,
    pub currency: String,
    pub webhook_secret: String,
    pub webhook_tolerance: Duration,
    pub database_url: Option<String>,
    pub max_connections: u32,
}

impl WorkflowConfig {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let number = |key: &str, default: u64| -> u64 {
            var(key).and_then(|v| v.parse().ok()).unwrap_or(default)
        };
        let cents = |key: &str| -> Option<Money> {
            var(key)
                .and_then(|v| v.parse::<i64>().ok())
                .filter(|c| *c >= 0)
                .map(Money::from_cents)
        };

        let max_attempts = u32::try_from(number("WORKFLOW_MAX_ATTEMPTS", 3)).unwrap_or(u32::MAX);
        let retry = RetryPolicy::exponential(
            max_attempts,
            Duration::from_millis(number("WORKFLOW_BACKOFF_MS", 50)),
            Duration::from_millis(number("WORKFLOW_MAX_BACKOFF_MS", 2000)),
        )
        .with_step_timeout(Some(Duration::from_millis(number(
            "WORKFLOW_STEP_TIMEOUT_MS",
            10_000,
        ))));

        let finalizer_mode = match var("WORKFLOW_NOTIFY_AFTER_COMMIT").as_deref() {
            Some("true" | "1") => FinalizerMode::AfterCommit,
            _ => FinalizerMode::Transactional,
        };

        let fee = cents("SHIPPING_FLAT_FEE_CENTS").unwrap_or(Money::from_cents(1000));
        let shipping: Arc<dyn ShippingPolicy> = match cents("SHIPPING_FREE_OVER_CENTS") {
            Some(threshold) => Arc::new(FreeShippingOver { threshold, fee }),
            None => Arc::new(FlatRate(fee)),
        };

        Self {
            retry,
            finalizer_mode,
            shipping,
            currency: var("PAYMENT_CURRENCY").unwrap_or_else(|| DEFAULT_CURRENCY.to_string()),
            webhook_secret: var("PAYMENT_WEBHOOK_SECRET")
                .unwrap_or_else(|| "whsec_test".to_string()),
            webhook_tolerance: Duration::from_secs(number(
                "PAYMENT_WEBHOOK_TOLERANCE_SECS",
                DEFAULT_TOLERANCE.as_secs(),
            )),
            database_url: var("DATABASE_URL"),
            max_connections: u32::try_from(number("DATABASE_MAX_CONNECTIONS", 10))
                .unwrap_or(u32::MAX),
        }
    }

    /// Opens the PostgreSQL store at `database_url` with migrations applied.
    ///
    /// Returns `None` when no database is configured.
    pub async fn connect_store(&self) -> store::Result<Option<PostgresStore>> {
        match self.database_url.as_deref() {
            Some(url) => Ok(Some(PostgresStore::connect(url, self.max_connections).await?)),
            None => Ok(None),
        }
    }
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use domain::OrderLine;

    use super::*;

    fn config(vars: &[(&str, &str)]) -> WorkflowConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        WorkflowConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_default_config() {
        let config = WorkflowConfig::default();
        assert_eq!(config.retry.max_attempts(), 3);
        assert_eq!(config.retry.backoff(1), Duration::from_millis(50));
        assert_eq!(config.retry.step_timeout(), Some(Duration::from_secs(10)));
        assert_eq!(config.finalizer_mode, FinalizerMode::Transactional);
        assert_eq!(
            config.shipping.fee(Money::from_dollars(500), &[]),
            Money::from_dollars(10)
        );
        assert_eq!(config.currency, "usd");
        assert_eq!(config.webhook_secret, "whsec_test");
        assert_eq!(config.webhook_tolerance, Duration::from_secs(300));
        assert!(config.database_url.is_none());
        assert_eq!(config.max_connections, 10);
    }

    #[tokio::test]
    async fn test_no_database_configured() {
        let config = WorkflowConfig::default();
        assert!(config.connect_store().await.unwrap().is_none());
    }

    #[test]
    fn test_overrides() {
        let config = config(&[
            ("WORKFLOW_MAX_ATTEMPTS", "5"),
            ("WORKFLOW_STEP_TIMEOUT_MS", "0"),
            ("WORKFLOW_NOTIFY_AFTER_COMMIT", "true"),
            ("SHIPPING_FLAT_FEE_CENTS", "500"),
            ("SHIPPING_FREE_OVER_CENTS", "10000"),
            ("PAYMENT_CURRENCY", "eur"),
            ("PAYMENT_WEBHOOK_SECRET", "whsec_live"),
            ("PAYMENT_WEBHOOK_TOLERANCE_SECS", "60"),
            ("DATABASE_URL", "postgres://localhost/orders"),
            ("DATABASE_MAX_CONNECTIONS", "4"),
        ]);
        assert_eq!(config.retry.max_attempts(), 5);
        assert_eq!(config.retry.step_timeout(), None);
        assert_eq!(config.finalizer_mode, FinalizerMode::AfterCommit);
        let lines: [OrderLine; 0] = [];
        assert_eq!(
            config.shipping.fee(Money::from_dollars(99), &lines),
            Money::from_cents(500)
        );
        assert_eq!(
            config.shipping.fee(Money::from_dollars(100), &lines),
            Money::zero()
        );
        assert_eq!(config.currency, "eur");
        assert_eq!(config.webhook_secret, "whsec_live");
        assert_eq!(config.webhook_tolerance, Duration::from_secs(60));
        assert_eq!(
            config.database_url.as_deref(),
            Some("postgres://localhost/orders")
        );
        assert_eq!(config.max_connections, 4);
    }

    #[test]
    fn test_unparsable_values_fall_back_to_defaults() {
        let config = config(&[
            ("WORKFLOW_MAX_ATTEMPTS", "lots"),
            ("SHIPPING_FLAT_FEE_CENTS", "-5"),
        ]);
        assert_eq!(config.retry.max_attempts(), 3);
        assert_eq!(
            config.shipping.fee(Money::zero(), &[]),
            Money::from_cents(1000)
        );
    }
}
