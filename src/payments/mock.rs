//! Scriptable in-process gateway for tests and `SKIP_EXTERNALS` runs.

use crate::payments::error::{GatewayError, GatewayResult};
use crate::payments::gateway::PaymentGateway;
use crate::payments::types::{
    CreateIntentRequest, GatewayCustomer, GatewayRefund, IntentSnapshot, IntentStatus,
    PaymentIntent, SetupIntent,
};
use async_trait::async_trait;
use bigdecimal::BigDecimal;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::Mutex;

#[derive(Default)]
struct State {
    next_id: u64,
    intents: HashMap<String, IntentSnapshot>,
    requests: Vec<CreateIntentRequest>,
    canceled: Vec<String>,
    refunds: Vec<GatewayRefund>,
    refunds_by_key: HashMap<String, GatewayRefund>,
    create_failures: Vec<GatewayError>,
    refund_failures: Vec<GatewayError>,
    unreachable_intents: HashSet<String>,
    create_delay: Option<Duration>,
    refund_delay: Option<Duration>,
}

impl State {
    fn next(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}_mock_{}", prefix, self.next_id)
    }
}

#[derive(Default)]
pub struct InMemoryGateway {
    state: Mutex<State>,
}

impl InMemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets what `retrieve_payment_intent` reports for an intent.
    pub async fn set_intent_status(
        &self,
        intent_id: &str,
        status: IntentStatus,
        charge_id: Option<&str>,
        gateway_fee: Option<BigDecimal>,
    ) {
        let mut state = self.state.lock().await;
        state.intents.insert(
            intent_id.to_string(),
            IntentSnapshot {
                id: intent_id.to_string(),
                status,
                charge_id: charge_id.map(str::to_string),
                gateway_fee,
                last_error: None,
            },
        );
    }

    /// The next `create_payment_intent` call fails with `error`.
    pub async fn fail_next_create(&self, error: GatewayError) {
        self.state.lock().await.create_failures.push(error);
    }

    pub async fn fail_next_refund(&self, error: GatewayError) {
        self.state.lock().await.refund_failures.push(error);
    }

    /// `create_payment_intent` sleeps this long before answering.
    pub async fn set_create_delay(&self, delay: Duration) {
        self.state.lock().await.create_delay = Some(delay);
    }

    /// `refund_charge` sleeps this long before answering.
    pub async fn set_refund_delay(&self, delay: Duration) {
        self.state.lock().await.refund_delay = Some(delay);
    }

    /// `retrieve_payment_intent` fails with a network error for this intent.
    pub async fn make_unreachable(&self, intent_id: &str) {
        self.state
            .lock()
            .await
            .unreachable_intents
            .insert(intent_id.to_string());
    }

    pub async fn created_requests(&self) -> Vec<CreateIntentRequest> {
        self.state.lock().await.requests.clone()
    }

    pub async fn canceled_intents(&self) -> Vec<String> {
        self.state.lock().await.canceled.clone()
    }

    /// Refunds actually issued; idempotent replays are not repeated here.
    pub async fn refunds(&self) -> Vec<GatewayRefund> {
        self.state.lock().await.refunds.clone()
    }

    pub async fn refund_keys(&self) -> Vec<String> {
        self.state.lock().await.refunds_by_key.keys().cloned().collect()
    }
}

#[async_trait]
impl PaymentGateway for InMemoryGateway {
    async fn create_payment_intent(
        &self,
        request: CreateIntentRequest,
    ) -> GatewayResult<PaymentIntent> {
        request.validate()?;

        let delay = self.state.lock().await.create_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().await;
        if let Some(error) = state.create_failures.pop() {
            return Err(error);
        }

        let id = state.next("pi");
        state.requests.push(request);
        state.intents.insert(
            id.clone(),
            IntentSnapshot {
                id: id.clone(),
                status: IntentStatus::RequiresPaymentMethod,
                charge_id: None,
                gateway_fee: None,
                last_error: None,
            },
        );
        Ok(PaymentIntent {
            client_secret: Some(format!("{}_secret", id)),
            id,
            status: IntentStatus::RequiresPaymentMethod,
        })
    }

    async fn retrieve_payment_intent(&self, intent_id: &str) -> GatewayResult<IntentSnapshot> {
        let state = self.state.lock().await;
        if state.unreachable_intents.contains(intent_id) {
            return Err(GatewayError::Network {
                message: format!("connection reset retrieving {}", intent_id),
            });
        }
        state
            .intents
            .get(intent_id)
            .cloned()
            .ok_or_else(|| GatewayError::NotFound {
                resource: intent_id.to_string(),
            })
    }

    async fn cancel_payment_intent(&self, intent_id: &str) -> GatewayResult<()> {
        let mut state = self.state.lock().await;
        if let Some(intent) = state.intents.get_mut(intent_id) {
            if intent.status == IntentStatus::Succeeded {
                return Err(GatewayError::Provider {
                    message: format!("payment intent {} has already succeeded", intent_id),
                    gateway_code: Some("payment_intent_unexpected_state".to_string()),
                    retryable: false,
                });
            }
            intent.status = IntentStatus::Canceled;
        }
        state.canceled.push(intent_id.to_string());
        Ok(())
    }

    async fn refund_charge(
        &self,
        charge_id: &str,
        amount: &BigDecimal,
        idempotency_key: &str,
    ) -> GatewayResult<GatewayRefund> {
        let delay = self.state.lock().await.refund_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().await;
        if let Some(error) = state.refund_failures.pop() {
            return Err(error);
        }
        if let Some(existing) = state.refunds_by_key.get(idempotency_key) {
            return Ok(existing.clone());
        }
        let refund = GatewayRefund {
            id: state.next("re"),
            charge_id: charge_id.to_string(),
            amount: amount.clone(),
            status: "succeeded".to_string(),
        };
        state.refunds.push(refund.clone());
        state
            .refunds_by_key
            .insert(idempotency_key.to_string(), refund.clone());
        Ok(refund)
    }

    async fn create_customer(
        &self,
        email: &str,
        _name: Option<&str>,
    ) -> GatewayResult<GatewayCustomer> {
        let mut state = self.state.lock().await;
        Ok(GatewayCustomer {
            id: state.next("cus"),
            email: email.to_string(),
        })
    }

    async fn create_setup_intent(&self, customer_id: &str) -> GatewayResult<SetupIntent> {
        let mut state = self.state.lock().await;
        let id = state.next("seti");
        Ok(SetupIntent {
            client_secret: Some(format!("{}_secret", id)),
            id,
            customer_id: customer_id.to_string(),
        })
    }

    fn name(&self) -> &'static str {
        "in-memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> CreateIntentRequest {
        CreateIntentRequest {
            amount: BigDecimal::from(1100),
            currency: "USD".to_string(),
            payment_method: None,
            customer_id: None,
            description: None,
            metadata: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn created_intents_are_retrievable() {
        let gateway = InMemoryGateway::new();
        let intent = gateway.create_payment_intent(request()).await.unwrap();
        let snapshot = gateway.retrieve_payment_intent(&intent.id).await.unwrap();
        assert_eq!(snapshot.status, IntentStatus::RequiresPaymentMethod);
    }

    #[tokio::test]
    async fn scripted_failure_is_returned_once() {
        let gateway = InMemoryGateway::new();
        gateway
            .fail_next_create(GatewayError::Network {
                message: "down".to_string(),
            })
            .await;
        assert!(gateway.create_payment_intent(request()).await.is_err());
        assert!(gateway.create_payment_intent(request()).await.is_ok());
    }

    #[tokio::test]
    async fn refunds_replay_by_idempotency_key() {
        let gateway = InMemoryGateway::new();
        let amount = BigDecimal::from(500);
        let first = gateway.refund_charge("ch_1", &amount, "refund-a").await.unwrap();
        let again = gateway.refund_charge("ch_1", &amount, "refund-a").await.unwrap();
        assert_eq!(first, again);
        assert_eq!(gateway.refunds().await.len(), 1);
    }

    #[tokio::test]
    async fn succeeded_intents_cannot_be_canceled() {
        let gateway = InMemoryGateway::new();
        let intent = gateway.create_payment_intent(request()).await.unwrap();
        gateway
            .set_intent_status(&intent.id, IntentStatus::Succeeded, Some("ch_1"), None)
            .await;
        assert!(gateway.cancel_payment_intent(&intent.id).await.is_err());
        assert!(gateway.canceled_intents().await.is_empty());
    }

    #[tokio::test]
    async fn unknown_intent_is_not_found() {
        let gateway = InMemoryGateway::new();
        let err = gateway.retrieve_payment_intent("pi_missing").await.unwrap_err();
        assert!(matches!(err, GatewayError::NotFound { .. }));
    }
}
