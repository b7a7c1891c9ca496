//! In-memory payment gateway for tests and local runs.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use super::webhook;
use super::{
    Charge, ChargeRequest, ChargeStatus, GatewayError, GatewayEvent, PaymentGateway, PaymentMethod,
};
use crate::config::WorkflowConfig;

#[derive(Debug)]
struct InMemoryGatewayState {
    methods: HashMap<String, PaymentMethod>,
    /// Charges by idempotency key.
    charges: HashMap<String, (ChargeRequest, Charge)>,
    next_id: u32,
    charge_status: ChargeStatus,
    decline: bool,
    unavailable_lookups: u32,
    unavailable_charges: u32,
    lost_charge_responses: u32,
}

impl Default for InMemoryGatewayState {
    fn default() -> Self {
        Self {
            methods: HashMap::new(),
            charges: HashMap::new(),
            next_id: 0,
            charge_status: ChargeStatus::Succeeded,
            decline: false,
            unavailable_lookups: 0,
            unavailable_charges: 0,
            lost_charge_responses: 0,
        }
    }
}

/// In-memory payment gateway.
///
/// Charges are keyed by idempotency key, so repeating a request returns the
/// charge the first request created.
#[derive(Debug, Clone)]
pub struct InMemoryPaymentGateway {
    state: Arc<Mutex<InMemoryGatewayState>>,
    webhook_secret: String,
    tolerance: Duration,
}

impl Default for InMemoryPaymentGateway {
    fn default() -> Self {
        Self::from_config(&WorkflowConfig::default())
    }
}

impl InMemoryPaymentGateway {
    /// Creates a gateway that verifies webhooks with `webhook_secret`.
    pub fn new(webhook_secret: impl Into<String>, tolerance: Duration) -> Self {
        Self {
            state: Arc::default(),
            webhook_secret: webhook_secret.into(),
            tolerance,
        }
    }

    /// Creates a gateway using the configured webhook secret and tolerance.
    pub fn from_config(config: &WorkflowConfig) -> Self {
        Self::new(config.webhook_secret.clone(), config.webhook_tolerance)
    }

    fn state(&self) -> MutexGuard<'_, InMemoryGatewayState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a stored payment method of the given gateway type.
    pub fn register_payment_method(&self, id: impl Into<String>, kind: impl Into<String>) {
        let id = id.into();
        let method = PaymentMethod {
            id: id.clone(),
            kind: kind.into(),
        };
        self.state().methods.insert(id, method);
    }

    /// Sets the status new charges are created with.
    pub fn set_charge_status(&self, status: ChargeStatus) {
        self.state().charge_status = status;
    }

    /// Configures the gateway to decline every charge.
    pub fn set_decline(&self, decline: bool) {
        self.state().decline = decline;
    }

    /// Makes the next `count` payment method lookups fail as unavailable.
    pub fn fail_next_method_lookups(&self, count: u32) {
        self.state().unavailable_lookups = count;
    }

    /// Makes the next `count` charge calls fail as unavailable before
    /// anything is created.
    pub fn fail_next_charges(&self, count: u32) {
        self.state().unavailable_charges = count;
    }

    /// Makes the next `count` charge calls create the charge but report a
    /// timeout, as if the response was lost on the way back.
    pub fn lose_next_charge_responses(&self, count: u32) {
        self.state().lost_charge_responses = count;
    }

    /// Returns the number of distinct charges created.
    pub fn charge_count(&self) -> usize {
        self.state().charges.len()
    }

    /// Returns the requests that created a charge.
    pub fn charge_requests(&self) -> Vec<ChargeRequest> {
        self.state()
            .charges
            .values()
            .map(|(request, _)| request.clone())
            .collect()
    }

    /// Signs `payload` with the webhook secret at the current time.
    pub fn sign(&self, payload: &[u8]) -> Result<String, GatewayError> {
        webhook::sign(&self.webhook_secret, Utc::now().timestamp(), payload)
    }
}

#[async_trait]
impl PaymentGateway for InMemoryPaymentGateway {
    async fn retrieve_payment_method(&self, id: &str) -> Result<PaymentMethod, GatewayError> {
        let mut state = self.state();

        if state.unavailable_lookups > 0 {
            state.unavailable_lookups -= 1;
            return Err(GatewayError::Unavailable("injected failure".to_string()));
        }

        state
            .methods
            .get(id)
            .cloned()
            .ok_or_else(|| GatewayError::PaymentMethodNotFound(id.to_string()))
    }

    async fn create_charge(&self, request: ChargeRequest) -> Result<Charge, GatewayError> {
        let mut state = self.state();

        if state.unavailable_charges > 0 {
            state.unavailable_charges -= 1;
            return Err(GatewayError::Unavailable("injected failure".to_string()));
        }

        if let Some((_, charge)) = state.charges.get(&request.idempotency_key) {
            return Ok(charge.clone());
        }

        if state.decline {
            return Err(GatewayError::Declined("card_declined".to_string()));
        }
        if !state.methods.contains_key(&request.payment_method_id) {
            return Err(GatewayError::PaymentMethodNotFound(
                request.payment_method_id.clone(),
            ));
        }

        state.next_id += 1;
        let charge = Charge {
            id: format!("pi_{:04}", state.next_id),
            status: state.charge_status,
        };
        state
            .charges
            .insert(request.idempotency_key.clone(), (request, charge.clone()));

        if state.lost_charge_responses > 0 {
            state.lost_charge_responses -= 1;
            return Err(GatewayError::Timeout);
        }

        Ok(charge)
    }

    fn verify_webhook(
        &self,
        payload: &[u8],
        signature: &str,
    ) -> Result<GatewayEvent, GatewayError> {
        webhook::verify(
            &self.webhook_secret,
            signature,
            payload,
            self.tolerance,
            Utc::now().timestamp(),
        )?;
        webhook::parse_event(payload)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use domain::Money;

    use super::*;
    use crate::gateway::GatewayEventKind;

    const SUCCEEDED: &[u8] =
        br#"{"id":"evt_1","type":"payment_intent.succeeded","data":{"object":{"id":"pi_0001"}}}"#;

    fn request(key: &str) -> ChargeRequest {
        ChargeRequest {
            amount: Money::from_dollars(50),
            currency: "usd".to_string(),
            payment_method_id: "pm_card_visa".to_string(),
            idempotency_key: key.to_string(),
            metadata: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_sequential_charge_ids() {
        let gateway = InMemoryPaymentGateway::default();
        gateway.register_payment_method("pm_card_visa", "card");

        let c1 = gateway.create_charge(request("k1")).await.unwrap();
        let c2 = gateway.create_charge(request("k2")).await.unwrap();

        assert_eq!(c1.id, "pi_0001");
        assert_eq!(c2.id, "pi_0002");
        assert_eq!(c1.status, ChargeStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_idempotency_key_returns_first_charge() {
        let gateway = InMemoryPaymentGateway::default();
        gateway.register_payment_method("pm_card_visa", "card");
        gateway.lose_next_charge_responses(1);

        let lost = gateway.create_charge(request("k1")).await;
        assert!(matches!(lost, Err(GatewayError::Timeout)));

        let charge = gateway.create_charge(request("k1")).await.unwrap();
        assert_eq!(charge.id, "pi_0001");
        assert_eq!(gateway.charge_count(), 1);
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let gateway = InMemoryPaymentGateway::default();
        gateway.register_payment_method("pm_card_visa", "card");
        gateway.fail_next_method_lookups(1);
        gateway.fail_next_charges(1);

        assert!(gateway.retrieve_payment_method("pm_card_visa").await.is_err());
        assert!(gateway.retrieve_payment_method("pm_card_visa").await.is_ok());
        assert!(gateway.create_charge(request("k1")).await.is_err());
        assert!(gateway.create_charge(request("k1")).await.is_ok());
        assert_eq!(gateway.charge_count(), 1);
    }

    #[tokio::test]
    async fn test_unknown_method_and_decline() {
        let gateway = InMemoryPaymentGateway::default();
        assert!(matches!(
            gateway.retrieve_payment_method("pm_missing").await,
            Err(GatewayError::PaymentMethodNotFound(_))
        ));

        gateway.register_payment_method("pm_card_visa", "card");
        gateway.set_decline(true);
        assert!(matches!(
            gateway.create_charge(request("k1")).await,
            Err(GatewayError::Declined(_))
        ));
        assert_eq!(gateway.charge_count(), 0);
    }

    #[test]
    fn test_signed_webhook_round_trip() {
        let gateway = InMemoryPaymentGateway::default();
        let signature = gateway.sign(SUCCEEDED).unwrap();

        let event = gateway.verify_webhook(SUCCEEDED, &signature).unwrap();
        assert_eq!(event.kind.transaction_id(), Some("pi_0001"));
        assert!(matches!(event.kind, GatewayEventKind::PaymentSucceeded { .. }));

        let other = InMemoryPaymentGateway::new("whsec_other", webhook::DEFAULT_TOLERANCE);
        assert!(other.verify_webhook(SUCCEEDED, &signature).is_err());
    }

    #[test]
    fn test_from_config_uses_configured_secret() {
        let config = WorkflowConfig {
            webhook_secret: "whsec_live".to_string(),
            ..WorkflowConfig::default()
        };
        let gateway = InMemoryPaymentGateway::from_config(&config);
        let signature = webhook::sign("whsec_live", Utc::now().timestamp(), SUCCEEDED).unwrap();

        assert!(gateway.verify_webhook(SUCCEEDED, &signature).is_ok());
        assert!(
            InMemoryPaymentGateway::default()
                .verify_webhook(SUCCEEDED, &signature)
                .is_err()
        );
    }
}
