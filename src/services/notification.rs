use async_trait::async_trait;
use bigdecimal::BigDecimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PaymentNotification {
    PaymentCompleted {
        payment_id: Uuid,
        payer_id: Uuid,
        payee_id: Uuid,
        amount: BigDecimal,
        currency: String,
    },
    PaymentFailed {
        payment_id: Uuid,
        payer_id: Uuid,
        reason: String,
        retry_count: i32,
    },
    PaymentRefunded {
        payment_id: Uuid,
        payer_id: Uuid,
        payee_id: Uuid,
        refund_amount: BigDecimal,
        currency: String,
    },
    DisputeOpened {
        charge_id: String,
        payment_id: Option<Uuid>,
        reason: Option<String>,
    },
    OperationalAlert {
        title: String,
        details: Vec<String>,
    },
}

impl PaymentNotification {
    pub fn kind(&self) -> &'static str {
        match self {
            PaymentNotification::PaymentCompleted { .. } => "payment_completed",
            PaymentNotification::PaymentFailed { .. } => "payment_failed",
            PaymentNotification::PaymentRefunded { .. } => "payment_refunded",
            PaymentNotification::DisputeOpened { .. } => "dispute_opened",
            PaymentNotification::OperationalAlert { .. } => "operational_alert",
        }
    }
}

#[derive(Debug, Error)]
#[error("notification delivery failed: {0}")]
pub struct NotificationError(pub String);

/// Fire-and-forget delivery channel (email, push, chat, pager).
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &PaymentNotification) -> Result<(), NotificationError>;
}

/// Sends a notification and swallows failures after logging them.
pub async fn dispatch(notifier: &dyn Notifier, notification: PaymentNotification) {
    if let Err(e) = notifier.notify(&notification).await {
        warn!(
            kind = notification.kind(),
            error = %e,
            "Notification dispatch failed"
        );
    }
}

/// Notifier that writes structured log lines.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

impl LogNotifier {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: &PaymentNotification) -> Result<(), NotificationError> {
        match notification {
            PaymentNotification::PaymentCompleted {
                payment_id,
                payee_id,
                amount,
                currency,
                ..
            } => {
                info!(
                    payment_id = %payment_id,
                    payee_id = %payee_id,
                    amount = %amount,
                    currency = %currency,
                    "🔔 NOTIFICATION: Payment completed"
                );
            }
            PaymentNotification::PaymentFailed {
                payment_id,
                payer_id,
                reason,
                retry_count,
            } => {
                warn!(
                    payment_id = %payment_id,
                    payer_id = %payer_id,
                    retry_count = retry_count,
                    "🔔 NOTIFICATION: Payment failed - {}", reason
                );
            }
            PaymentNotification::PaymentRefunded {
                payment_id,
                payer_id,
                refund_amount,
                currency,
                ..
            } => {
                info!(
                    payment_id = %payment_id,
                    payer_id = %payer_id,
                    amount = %refund_amount,
                    currency = %currency,
                    "🔔 NOTIFICATION: Payment refunded"
                );
            }
            PaymentNotification::DisputeOpened {
                charge_id,
                payment_id,
                reason,
            } => {
                warn!(
                    charge_id = %charge_id,
                    payment_id = ?payment_id,
                    reason = ?reason,
                    "🔔 NOTIFICATION: Dispute opened"
                );
            }
            PaymentNotification::OperationalAlert { title, details } => {
                error!(
                    details = ?details,
                    "🔔 ALERT: {}", title
                );
            }
        }
        Ok(())
    }
}
