use crate::payments::error::GatewayResult;
use crate::payments::types::{
    CreateIntentRequest, GatewayCustomer, GatewayRefund, IntentSnapshot, PaymentIntent,
    SetupIntent,
};
use async_trait::async_trait;
use bigdecimal::BigDecimal;

/// External payment processor. Treated as trusted and at-least-once delivering.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_payment_intent(
        &self,
        request: CreateIntentRequest,
    ) -> GatewayResult<PaymentIntent>;

    async fn retrieve_payment_intent(&self, intent_id: &str) -> GatewayResult<IntentSnapshot>;

    async fn cancel_payment_intent(&self, intent_id: &str) -> GatewayResult<()>;

    /// Repeating a call with the same `idempotency_key` returns the first
    /// refund instead of issuing another.
    async fn refund_charge(
        &self,
        charge_id: &str,
        amount: &BigDecimal,
        idempotency_key: &str,
    ) -> GatewayResult<GatewayRefund>;

    /// Customer record for stored payment methods.
    async fn create_customer(&self, email: &str, name: Option<&str>)
        -> GatewayResult<GatewayCustomer>;

    async fn create_setup_intent(&self, customer_id: &str) -> GatewayResult<SetupIntent>;

    fn name(&self) -> &'static str;
}
