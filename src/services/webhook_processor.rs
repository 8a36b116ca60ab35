use bigdecimal::BigDecimal;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::database::error::DatabaseError;
use crate::database::ledger_repository::LedgerStatus;
use crate::database::payment_repository::PaymentRecord;
use crate::database::webhook_repository::WebhookEventStore;
use crate::payments::signature::WebhookVerifier;
use crate::payments::state::PaymentStatus;
use crate::payments::types::from_minor_units;
use crate::services::ledger::{LedgerError, LedgerService};
use crate::services::notification::{dispatch, Notifier, PaymentNotification};
use crate::services::payment_service::{PaymentService, SettlementError};

#[derive(Debug, Error)]
pub enum WebhookProcessorError {
    #[error("Invalid signature: {0}")]
    InvalidSignature(String),
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),
    #[error("Payment not found for intent {0}")]
    UnknownPayment(String),
    #[error("Handler error: {0}")]
    Handler(#[from] SettlementError),
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

impl WebhookProcessorError {
    /// Rejections the gateway should not redeliver.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            WebhookProcessorError::InvalidSignature(_) | WebhookProcessorError::MalformedPayload(_)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    Processed { event_id: String, event_type: String },
    /// The event id was already recorded
    Skipped { event_id: String },
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: EventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventData {
    pub object: JsonValue,
}

pub struct WebhookProcessor {
    verifier: WebhookVerifier,
    events: Arc<dyn WebhookEventStore>,
    payments: PaymentService,
    ledger: LedgerService,
    notifier: Arc<dyn Notifier>,
}

impl WebhookProcessor {
    pub fn new(
        verifier: WebhookVerifier,
        events: Arc<dyn WebhookEventStore>,
        payments: PaymentService,
        ledger: LedgerService,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            verifier,
            events,
            payments,
            ledger,
            notifier,
        }
    }

    /// Verifies, deduplicates and dispatches one delivery. The event id is
    /// recorded only after its handler succeeds, so a failed delivery is
    /// redelivered by the gateway.
    pub async fn process(
        &self,
        raw_body: &[u8],
        signature: Option<&str>,
    ) -> Result<WebhookOutcome, WebhookProcessorError> {
        self.verifier
            .verify(raw_body, signature.unwrap_or_default())
            .map_err(|e| {
                warn!(error = %e, "Rejected webhook with invalid signature");
                WebhookProcessorError::InvalidSignature(e.to_string())
            })?;

        let event: GatewayEvent = serde_json::from_slice(raw_body)
            .map_err(|e| WebhookProcessorError::MalformedPayload(e.to_string()))?;
        if event.id.trim().is_empty() {
            return Err(WebhookProcessorError::MalformedPayload(
                "event id is empty".to_string(),
            ));
        }

        if self.events.find(&event.id).await?.is_some() {
            info!(event_id = %event.id, event_type = %event.event_type, "Webhook already processed");
            return Ok(WebhookOutcome::Skipped { event_id: event.id });
        }

        self.dispatch_event(&event).await.map_err(|e| {
            warn!(
                event_id = %event.id,
                event_type = %event.event_type,
                error = %e,
                "Webhook handler failed, leaving event for redelivery"
            );
            e
        })?;

        if !self
            .events
            .record_processed(&event.id, &event.event_type)
            .await?
        {
            debug!(event_id = %event.id, "Concurrent delivery recorded the event first");
        }

        info!(event_id = %event.id, event_type = %event.event_type, "Webhook processed successfully");
        Ok(WebhookOutcome::Processed {
            event_id: event.id,
            event_type: event.event_type,
        })
    }

    async fn dispatch_event(&self, event: &GatewayEvent) -> Result<(), WebhookProcessorError> {
        let object = &event.data.object;
        let result = match event.event_type.as_str() {
            "payment_intent.succeeded" => self.handle_intent_succeeded(object).await,
            "charge.succeeded" => self.handle_charge_succeeded(object).await,
            "payment_intent.processing" => self.handle_intent_processing(object).await,
            "payment_intent.payment_failed" | "payment_intent.canceled" => {
                self.handle_intent_failed(&event.event_type, object).await
            }
            "charge.refunded" => self.handle_charge_refunded(object).await,
            "account.updated" => {
                info!(
                    account_id = str_field(object, "id").unwrap_or("unknown"),
                    "Connected account updated"
                );
                Ok(())
            }
            "charge.dispute.created" => self.handle_dispute_created(object).await,
            other if other.starts_with("transfer.") || other.starts_with("payout.") => {
                self.handle_payout_event(other, object).await
            }
            other => {
                warn!(event_type = %other, event_id = %event.id, "Unknown webhook event type");
                Ok(())
            }
        };

        match result {
            // A stale event for a payment that already moved on is not retryable.
            Err(WebhookProcessorError::Handler(SettlementError::InvalidTransition { from, to })) => {
                warn!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    from = %from,
                    to = %to,
                    "Ignoring webhook that no longer applies to the payment"
                );
                Ok(())
            }
            other => other,
        }
    }

    // ------------------------------------------------------------------
    // Handlers
    // ------------------------------------------------------------------

    async fn handle_intent_succeeded(&self, object: &JsonValue) -> Result<(), WebhookProcessorError> {
        let intent_id = required_str(object, "id")?;
        let Some(payment) = self.payment_for_intent(intent_id, object).await? else {
            return Ok(());
        };
        let charge_id = str_field(object, "latest_charge").unwrap_or(intent_id);
        let fee = minor_amount(object, "fee");
        if !payment.is_current_intent(intent_id) {
            self.payments
                .complete_from_replaced_intent(payment.id, intent_id, charge_id, fee)
                .await?;
            return Ok(());
        }
        let outcome = self
            .payments
            .complete_payment(payment.id, charge_id, fee)
            .await?;
        debug!(payment_id = %payment.id, status = %outcome.payment().status, "Intent success handled");
        Ok(())
    }

    async fn handle_charge_succeeded(&self, object: &JsonValue) -> Result<(), WebhookProcessorError> {
        let charge_id = required_str(object, "id")?;
        let intent_id = required_str(object, "payment_intent")?;
        let Some(payment) = self.payment_for_intent(intent_id, object).await? else {
            return Ok(());
        };
        let fee = minor_amount(object, "fee");
        if !payment.is_current_intent(intent_id) {
            self.payments
                .complete_from_replaced_intent(payment.id, intent_id, charge_id, fee)
                .await?;
            return Ok(());
        }
        self.payments
            .complete_payment(payment.id, charge_id, fee)
            .await?;
        Ok(())
    }

    async fn handle_intent_processing(&self, object: &JsonValue) -> Result<(), WebhookProcessorError> {
        let intent_id = required_str(object, "id")?;
        let Some(payment) = self.payment_for_intent(intent_id, object).await? else {
            return Ok(());
        };
        if !payment.is_current_intent(intent_id) {
            info!(payment_id = %payment.id, intent_id = %intent_id, "Processing event for replaced intent, ignoring");
            return Ok(());
        }
        self.payments.mark_processing(payment.id).await?;
        Ok(())
    }

    async fn handle_intent_failed(
        &self,
        event_type: &str,
        object: &JsonValue,
    ) -> Result<(), WebhookProcessorError> {
        let intent_id = required_str(object, "id")?;
        let Some(payment) = self.payment_for_intent(intent_id, object).await? else {
            return Ok(());
        };
        // The retry that replaced this intent already canceled it.
        if !payment.is_current_intent(intent_id) {
            info!(
                payment_id = %payment.id,
                intent_id = %intent_id,
                event_type = %event_type,
                "Failure event for replaced intent, ignoring"
            );
            return Ok(());
        }
        let reason = object
            .get("last_payment_error")
            .and_then(|e| e.get("message"))
            .and_then(JsonValue::as_str)
            .or_else(|| str_field(object, "cancellation_reason"))
            .unwrap_or(if event_type == "payment_intent.canceled" {
                "payment intent canceled"
            } else {
                "payment failed"
            });
        self.payments.fail_payment(payment.id, reason).await?;
        Ok(())
    }

    async fn handle_charge_refunded(&self, object: &JsonValue) -> Result<(), WebhookProcessorError> {
        let charge_id = required_str(object, "id")?;
        let intent_id = required_str(object, "payment_intent")?;
        let Some(payment) = self.payment_for_intent(intent_id, object).await? else {
            return Ok(());
        };
        if payment.status != PaymentStatus::Completed {
            info!(
                payment_id = %payment.id,
                status = %payment.status,
                "Refund webhook for payment that is not completed, ignoring"
            );
            return Ok(());
        }
        let refunded = minor_amount(object, "amount_refunded");
        self.payments
            .record_refund(payment.id, refunded, Some(charge_id.to_string()))
            .await?;
        Ok(())
    }

    async fn handle_dispute_created(&self, object: &JsonValue) -> Result<(), WebhookProcessorError> {
        let charge_id = str_field(object, "charge").unwrap_or("unknown").to_string();
        let payment_id = match str_field(object, "payment_intent") {
            Some(intent_id) => self.payments.find_by_intent(intent_id).await?.map(|p| p.id),
            None => None,
        };
        let reason = str_field(object, "reason").map(str::to_string);
        warn!(
            charge_id = %charge_id,
            payment_id = ?payment_id,
            reason = ?reason,
            "⚠️ Dispute opened against charge"
        );
        dispatch(
            self.notifier.as_ref(),
            PaymentNotification::DisputeOpened {
                charge_id,
                payment_id,
                reason,
            },
        )
        .await;
        Ok(())
    }

    async fn handle_payout_event(
        &self,
        event_type: &str,
        object: &JsonValue,
    ) -> Result<(), WebhookProcessorError> {
        let reference = required_str(object, "id")?;
        let status = match event_type.rsplit('.').next() {
            Some("paid") => LedgerStatus::Completed,
            Some("failed") => LedgerStatus::Failed,
            Some("reversed") | Some("canceled") => LedgerStatus::Cancelled,
            _ => {
                info!(event_type = %event_type, reference = %reference, "Payout event logged");
                return Ok(());
            }
        };
        self.ledger.settle_withdrawal(reference, status).await?;
        Ok(())
    }

    /// Resolves the local record for an intent, current or replaced by a
    /// retry. Retry intents also carry the `payment_id` in their metadata.
    /// Intents created by this service carry a `payment_reference`; a missing
    /// record for one of those is an error so the gateway redelivers. Foreign
    /// intents are ignored.
    async fn payment_for_intent(
        &self,
        intent_id: &str,
        object: &JsonValue,
    ) -> Result<Option<PaymentRecord>, WebhookProcessorError> {
        if let Some(payment) = self.payments.find_by_intent(intent_id).await? {
            return Ok(Some(payment));
        }
        let metadata = object.get("metadata");
        let payment_id = metadata
            .and_then(|m| m.get("payment_id"))
            .and_then(JsonValue::as_str)
            .and_then(|id| Uuid::parse_str(id).ok());
        if let Some(payment_id) = payment_id {
            match self.payments.get_payment(payment_id).await {
                Ok(payment) => return Ok(Some(payment)),
                Err(SettlementError::NotFound { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }
        let ours = metadata.and_then(|m| m.get("payment_reference")).is_some();
        if ours {
            return Err(WebhookProcessorError::UnknownPayment(intent_id.to_string()));
        }
        info!(intent_id = %intent_id, "Webhook for unknown intent, ignoring");
        Ok(None)
    }
}

fn str_field<'a>(object: &'a JsonValue, key: &str) -> Option<&'a str> {
    object.get(key).and_then(JsonValue::as_str)
}

fn required_str<'a>(object: &'a JsonValue, key: &str) -> Result<&'a str, WebhookProcessorError> {
    str_field(object, key).ok_or_else(|| {
        WebhookProcessorError::MalformedPayload(format!("data.object.{} is missing", key))
    })
}

/// Gateway amounts arrive as integer minor units.
fn minor_amount(object: &JsonValue, key: &str) -> Option<BigDecimal> {
    object.get(key).and_then(JsonValue::as_i64).map(from_minor_units)
}
