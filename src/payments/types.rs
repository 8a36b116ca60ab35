use crate::payments::error::GatewayError;
use bigdecimal::{BigDecimal, RoundingMode, ToPrimitive};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Gateway-side lifecycle of a payment intent.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IntentStatus {
    RequiresPaymentMethod,
    RequiresConfirmation,
    RequiresAction,
    Processing,
    RequiresCapture,
    Canceled,
    Succeeded,
    #[serde(other)]
    Unknown,
}

impl IntentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntentStatus::RequiresPaymentMethod => "requires_payment_method",
            IntentStatus::RequiresConfirmation => "requires_confirmation",
            IntentStatus::RequiresAction => "requires_action",
            IntentStatus::Processing => "processing",
            IntentStatus::RequiresCapture => "requires_capture",
            IntentStatus::Canceled => "canceled",
            IntentStatus::Succeeded => "succeeded",
            IntentStatus::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for IntentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateIntentRequest {
    /// Major units; converted to minor units on the wire
    pub amount: BigDecimal,
    pub currency: String,
    pub payment_method: Option<String>,
    pub customer_id: Option<String>,
    pub description: Option<String>,
    pub metadata: HashMap<String, String>,
}

impl CreateIntentRequest {
    pub fn validate(&self) -> Result<(), GatewayError> {
        if self.amount <= BigDecimal::from(0) {
            return Err(GatewayError::Validation {
                message: "amount must be greater than zero".to_string(),
                field: Some("amount".to_string()),
            });
        }
        if self.currency.trim().is_empty() {
            return Err(GatewayError::Validation {
                message: "currency is required".to_string(),
                field: Some("currency".to_string()),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PaymentIntent {
    pub id: String,
    pub client_secret: Option<String>,
    pub status: IntentStatus,
}

/// Authoritative gateway view of an intent, used by reconciliation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IntentSnapshot {
    pub id: String,
    pub status: IntentStatus,
    pub charge_id: Option<String>,
    pub gateway_fee: Option<BigDecimal>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GatewayRefund {
    pub id: String,
    pub charge_id: String,
    pub amount: BigDecimal,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GatewayCustomer {
    pub id: String,
    pub email: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SetupIntent {
    pub id: String,
    pub client_secret: Option<String>,
    pub customer_id: String,
}

/// Converts a major-unit amount to the gateway's integer minor units (cents).
pub fn to_minor_units(amount: &BigDecimal) -> Result<i64, GatewayError> {
    (amount * BigDecimal::from(100))
        .with_scale_round(0, RoundingMode::HalfUp)
        .to_i64()
        .ok_or_else(|| GatewayError::Validation {
            message: format!("amount out of range: {}", amount),
            field: Some("amount".to_string()),
        })
}

pub fn from_minor_units(minor: i64) -> BigDecimal {
    (BigDecimal::from(minor) / BigDecimal::from(100)).with_scale(2)
}
