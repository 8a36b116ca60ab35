//! Payment status state machine.
//!
//! ```text
//! PENDING --(gateway success)--> COMPLETED
//! PENDING --(gateway failure)--> FAILED
//! PENDING --(processing ack)--> PROCESSING --(success)--> COMPLETED
//! PROCESSING --(failure)--> FAILED
//! FAILED --(manual retry, retry_count < 3)--> PENDING
//! COMPLETED --(refund)--> REFUNDED
//! ```
//!
//! Every status change goes through [`check_transition`]; stores repeat the
//! same guard in their conditional update so a racing writer cannot slip past it.

use bigdecimal::BigDecimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A failed payment may be retried while its retry count is below this bound.
pub const MAX_PAYMENT_RETRIES: i32 = 3;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Refunded,
}

impl PaymentStatus {
    pub const ALL: [PaymentStatus; 5] = [
        PaymentStatus::Pending,
        PaymentStatus::Processing,
        PaymentStatus::Completed,
        PaymentStatus::Failed,
        PaymentStatus::Refunded,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "PENDING",
            PaymentStatus::Processing => "PROCESSING",
            PaymentStatus::Completed => "COMPLETED",
            PaymentStatus::Failed => "FAILED",
            PaymentStatus::Refunded => "REFUNDED",
        }
    }

    /// Statuses the reconciliation sweep treats as unresolved.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, PaymentStatus::Pending | PaymentStatus::Processing)
    }

    /// Statuses that block a second payment for the same contract or milestone.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            PaymentStatus::Pending | PaymentStatus::Processing | PaymentStatus::Completed
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PaymentStatus::Refunded)
    }

    pub fn valid_transitions(&self) -> &'static [PaymentStatus] {
        match self {
            PaymentStatus::Pending => &[
                PaymentStatus::Processing,
                PaymentStatus::Completed,
                PaymentStatus::Failed,
            ],
            PaymentStatus::Processing => &[PaymentStatus::Completed, PaymentStatus::Failed],
            PaymentStatus::Failed => &[PaymentStatus::Pending],
            PaymentStatus::Completed => &[PaymentStatus::Refunded],
            PaymentStatus::Refunded => &[],
        }
    }

    pub fn can_transition_to(&self, target: PaymentStatus) -> bool {
        self.valid_transitions().contains(&target)
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_uppercase().as_str() {
            "PENDING" => Ok(PaymentStatus::Pending),
            "PROCESSING" => Ok(PaymentStatus::Processing),
            "COMPLETED" => Ok(PaymentStatus::Completed),
            "FAILED" => Ok(PaymentStatus::Failed),
            "REFUNDED" => Ok(PaymentStatus::Refunded),
            other => Err(format!("unknown payment status: {}", other)),
        }
    }
}

/// A requested status change together with the fields it writes.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusChange {
    Processing,
    Completed {
        charge_id: String,
        gateway_fee: Option<BigDecimal>,
    },
    Failed {
        error: String,
    },
    Refunded {
        amount: BigDecimal,
    },
    Retried {
        intent_id: String,
    },
}

impl StatusChange {
    pub fn target(&self) -> PaymentStatus {
        match self {
            StatusChange::Processing => PaymentStatus::Processing,
            StatusChange::Completed { .. } => PaymentStatus::Completed,
            StatusChange::Failed { .. } => PaymentStatus::Failed,
            StatusChange::Refunded { .. } => PaymentStatus::Refunded,
            StatusChange::Retried { .. } => PaymentStatus::Pending,
        }
    }

    /// Prior statuses from which this change may be applied.
    pub fn allowed_from(&self) -> Vec<PaymentStatus> {
        let target = self.target();
        PaymentStatus::ALL
            .iter()
            .copied()
            .filter(|s| s.can_transition_to(target))
            .collect()
    }

    /// Whether the conditional write must also require `retry_count < MAX_PAYMENT_RETRIES`.
    pub fn requires_retry_budget(&self) -> bool {
        matches!(self, StatusChange::Retried { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("invalid payment transition from {from} to {to}")]
    Invalid { from: PaymentStatus, to: PaymentStatus },

    #[error("retry limit reached ({retry_count}/{max})")]
    RetryExhausted { retry_count: i32, max: i32 },
}

/// Validates `change` against the current status and retry count.
pub fn check_transition(
    current: PaymentStatus,
    retry_count: i32,
    change: &StatusChange,
) -> Result<(), TransitionError> {
    let target = change.target();
    if !current.can_transition_to(target) {
        return Err(TransitionError::Invalid {
            from: current,
            to: target,
        });
    }
    if change.requires_retry_budget() && retry_count >= MAX_PAYMENT_RETRIES {
        return Err(TransitionError::RetryExhausted {
            retry_count,
            max: MAX_PAYMENT_RETRIES,
        });
    }
    Ok(())
}
