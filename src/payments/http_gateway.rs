use crate::payments::error::{GatewayError, GatewayResult};
use crate::payments::gateway::PaymentGateway;
use crate::payments::types::{
    from_minor_units, to_minor_units, CreateIntentRequest, GatewayCustomer, GatewayRefund,
    IntentSnapshot, IntentStatus, PaymentIntent, SetupIntent,
};
use crate::payments::utils::PaymentHttpClient;
use async_trait::async_trait;
use bigdecimal::BigDecimal;
use reqwest::Method;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct HttpGatewayConfig {
    pub base_url: String,
    pub secret_key: String,
    pub timeout: Duration,
    pub max_retries: u32,
}

/// JSON REST client for a card processor exposing intents, refunds,
/// customers and setup intents.
pub struct HttpGateway {
    config: HttpGatewayConfig,
    http: PaymentHttpClient,
}

#[derive(Debug, Deserialize)]
struct IntentBody {
    id: String,
    client_secret: Option<String>,
    status: IntentStatus,
    latest_charge: Option<String>,
    /// Processor fee in minor units, present once the charge settles
    fee: Option<i64>,
    last_payment_error: Option<ErrorBody>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RefundBody {
    id: String,
    charge: String,
    amount: i64,
    status: String,
}

#[derive(Debug, Deserialize)]
struct CustomerBody {
    id: String,
    email: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SetupIntentBody {
    id: String,
    client_secret: Option<String>,
    customer: String,
}

impl HttpGateway {
    pub fn new(config: HttpGatewayConfig) -> GatewayResult<Self> {
        if config.secret_key.trim().is_empty() {
            return Err(GatewayError::Validation {
                message: "gateway secret key is required".to_string(),
                field: Some("GATEWAY_SECRET_KEY".to_string()),
            });
        }
        let http = PaymentHttpClient::new(config.timeout, config.max_retries)?;
        Ok(Self { config, http })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn send<T: serde::de::DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
        idempotency_key: Option<&str>,
    ) -> GatewayResult<T> {
        let url = self.url(path);
        let headers: Vec<(&str, &str)> = idempotency_key
            .map(|key| vec![("Idempotency-Key", key)])
            .unwrap_or_default();
        debug!(method = %method, url = %url, "gateway request");
        self.http
            .request_json(
                method,
                &url,
                Some(&self.config.secret_key),
                body.as_ref(),
                &headers,
            )
            .await
    }
}

impl From<IntentBody> for IntentSnapshot {
    fn from(body: IntentBody) -> Self {
        IntentSnapshot {
            id: body.id,
            status: body.status,
            charge_id: body.latest_charge,
            gateway_fee: body.fee.map(from_minor_units),
            last_error: body.last_payment_error.and_then(|e| e.message),
        }
    }
}

#[async_trait]
impl PaymentGateway for HttpGateway {
    async fn create_payment_intent(
        &self,
        request: CreateIntentRequest,
    ) -> GatewayResult<PaymentIntent> {
        request.validate()?;
        let amount = to_minor_units(&request.amount)?;
        let idempotency_key = request.metadata.get("payment_reference").cloned();
        let payload = json!({
            "amount": amount,
            "currency": request.currency.to_lowercase(),
            "payment_method": request.payment_method,
            "customer": request.customer_id,
            "description": request.description,
            "metadata": request.metadata,
        });

        let body: IntentBody = self
            .send(
                Method::POST,
                "v1/payment_intents",
                Some(payload),
                idempotency_key.as_deref(),
            )
            .await?;

        info!(intent_id = %body.id, amount_minor = amount, "Gateway payment intent created");
        Ok(PaymentIntent {
            id: body.id,
            client_secret: body.client_secret,
            status: body.status,
        })
    }

    async fn retrieve_payment_intent(&self, intent_id: &str) -> GatewayResult<IntentSnapshot> {
        let body: IntentBody = self
            .send(
                Method::GET,
                &format!("v1/payment_intents/{}", intent_id),
                None,
                None,
            )
            .await?;
        Ok(body.into())
    }

    async fn cancel_payment_intent(&self, intent_id: &str) -> GatewayResult<()> {
        let _: IntentBody = self
            .send(
                Method::POST,
                &format!("v1/payment_intents/{}/cancel", intent_id),
                Some(json!({})),
                None,
            )
            .await?;
        info!(intent_id = %intent_id, "Gateway payment intent canceled");
        Ok(())
    }

    async fn refund_charge(
        &self,
        charge_id: &str,
        amount: &BigDecimal,
        idempotency_key: &str,
    ) -> GatewayResult<GatewayRefund> {
        let payload = json!({
            "charge": charge_id,
            "amount": to_minor_units(amount)?,
        });
        let body: RefundBody = self
            .send(Method::POST, "v1/refunds", Some(payload), Some(idempotency_key))
            .await?;
        Ok(GatewayRefund {
            id: body.id,
            charge_id: body.charge,
            amount: from_minor_units(body.amount),
            status: body.status,
        })
    }

    async fn create_customer(
        &self,
        email: &str,
        name: Option<&str>,
    ) -> GatewayResult<GatewayCustomer> {
        let body: CustomerBody = self
            .send(
                Method::POST,
                "v1/customers",
                Some(json!({ "email": email, "name": name })),
                None,
            )
            .await?;
        Ok(GatewayCustomer {
            id: body.id,
            email: body.email.unwrap_or_else(|| email.to_string()),
        })
    }

    async fn create_setup_intent(&self, customer_id: &str) -> GatewayResult<SetupIntent> {
        let body: SetupIntentBody = self
            .send(
                Method::POST,
                "v1/setup_intents",
                Some(json!({ "customer": customer_id })),
                None,
            )
            .await?;
        Ok(SetupIntent {
            id: body.id,
            client_secret: body.client_secret,
            customer_id: body.customer,
        })
    }

    fn name(&self) -> &'static str {
        "http"
    }
}
