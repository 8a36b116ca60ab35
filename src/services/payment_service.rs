//! Payment Service
//!
//! Orchestrates the payment lifecycle: intent creation, status transitions,
//! settlement, refunds and retries. Every status change goes through
//! [`check_transition`] and a conditional store update, so concurrent callers
//! (webhook delivery, the reconciliation sweep, API requests) cannot apply the
//! same transition twice. Side effects without money impact (notifications)
//! run only after the state change is durable.

use crate::database::contract_repository::{ContractDirectory, ContractTerms};
use crate::database::error::DatabaseError;
use crate::database::ledger_repository::{
    LedgerEntryType, LedgerStatus, LedgerStore, NewLedgerEntry, RelatedType,
};
use crate::database::payment_repository::{NewPaymentRecord, PaymentRecord, PaymentStore};
use crate::database::settlement::{
    payment_ledger_entry, CompletionOutcome, CompletionWrite, CreditOutcome, SettlementStore,
};
use crate::payments::error::GatewayError;
use crate::payments::gateway::PaymentGateway;
use crate::payments::state::{check_transition, PaymentStatus, StatusChange, TransitionError};
use crate::payments::types::{CreateIntentRequest, IntentStatus, PaymentIntent, SetupIntent};
use crate::services::balance::BalanceUpdater;
use crate::services::fee_calculation::{
    calculate_fees, round_money, verify_recorded_fees, FeeBreakdown, FeeError, FeeMismatch,
};
use crate::services::notification::{dispatch, Notifier, PaymentNotification};
use bigdecimal::BigDecimal;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

/// A refund claim older than this is assumed abandoned by a crashed request.
pub const REFUND_CLAIM_TTL_MINUTES: i64 = 15;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum SettlementError {
    #[error("Validation error: {message}")]
    Validation {
        message: String,
        field: Option<String>,
    },

    #[error("Not authorized: {0}")]
    Authorization(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Invalid payment transition from {from} to {to}")]
    InvalidTransition {
        from: PaymentStatus,
        to: PaymentStatus,
    },

    #[error("Retry limit reached ({retry_count}/{max})")]
    RetryExhausted { retry_count: i32, max: i32 },

    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] DatabaseError),
}

impl SettlementError {
    pub fn validation(message: impl Into<String>, field: &str) -> Self {
        SettlementError::Validation {
            message: message.into(),
            field: Some(field.to_string()),
        }
    }

    fn not_found(entity: &'static str, id: impl ToString) -> Self {
        SettlementError::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

impl From<TransitionError> for SettlementError {
    fn from(err: TransitionError) -> Self {
        match err {
            TransitionError::Invalid { from, to } => SettlementError::InvalidTransition { from, to },
            TransitionError::RetryExhausted { retry_count, max } => {
                SettlementError::RetryExhausted { retry_count, max }
            }
        }
    }
}

impl From<FeeError> for SettlementError {
    fn from(err: FeeError) -> Self {
        let field = match err {
            FeeError::NonPositiveAmount(_) => "amount",
            FeeError::PercentageOutOfRange(_) => "platform_fee_percentage",
        };
        SettlementError::validation(err.to_string(), field)
    }
}

pub type SettlementResult<T> = Result<T, SettlementError>;

// ============================================================================
// Requests and responses
// ============================================================================

/// Business object a payment is made against.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PaymentContext {
    pub contract_id: Uuid,
    /// Milestone payments leave the contract status untouched on completion
    pub milestone_id: Option<Uuid>,
    pub payment_method: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatePaymentIntent {
    /// Base amount owed to the payee, before the platform fee
    pub amount: BigDecimal,
    /// Defaults to the contract currency
    pub currency: Option<String>,
    pub payer_id: Uuid,
    pub payee_id: Uuid,
    pub context: PaymentContext,
}

#[derive(Debug, Clone, Serialize)]
pub struct PaymentIntentHandle {
    pub payment_id: Uuid,
    pub intent_id: String,
    pub client_secret: Option<String>,
    pub fees: FeeBreakdown,
}

#[derive(Debug, Clone)]
pub struct PaymentServiceConfig {
    pub gateway_timeout: Duration,
    pub default_currency: String,
}

impl Default for PaymentServiceConfig {
    fn default() -> Self {
        Self {
            gateway_timeout: Duration::from_secs(15),
            default_currency: "USD".to_string(),
        }
    }
}

/// Collaborators the service is built from.
#[derive(Clone)]
pub struct PaymentServiceDeps {
    pub payments: Arc<dyn PaymentStore>,
    pub ledger: Arc<dyn LedgerStore>,
    pub contracts: Arc<dyn ContractDirectory>,
    pub gateway: Arc<dyn PaymentGateway>,
    pub settlement: Arc<dyn SettlementStore>,
    pub balances: BalanceUpdater,
    pub notifier: Arc<dyn Notifier>,
}

// ============================================================================
// Service
// ============================================================================

#[derive(Clone)]
pub struct PaymentService {
    payments: Arc<dyn PaymentStore>,
    ledger: Arc<dyn LedgerStore>,
    contracts: Arc<dyn ContractDirectory>,
    gateway: Arc<dyn PaymentGateway>,
    settlement: Arc<dyn SettlementStore>,
    balances: BalanceUpdater,
    notifier: Arc<dyn Notifier>,
    config: PaymentServiceConfig,
}

impl PaymentService {
    pub fn new(deps: PaymentServiceDeps, config: PaymentServiceConfig) -> Self {
        Self {
            payments: deps.payments,
            ledger: deps.ledger,
            contracts: deps.contracts,
            gateway: deps.gateway,
            settlement: deps.settlement,
            balances: deps.balances,
            notifier: deps.notifier,
            config,
        }
    }

    pub fn gateway(&self) -> &Arc<dyn PaymentGateway> {
        &self.gateway
    }

    pub fn config(&self) -> &PaymentServiceConfig {
        &self.config
    }

    // ------------------------------------------------------------------
    // Intent creation
    // ------------------------------------------------------------------

    /// Creates a gateway intent for the fee-inclusive total and a `PENDING`
    /// record referencing it. A gateway failure leaves no local state; a
    /// persistence failure cancels the intent best-effort.
    pub async fn create_payment_intent(
        &self,
        request: CreatePaymentIntent,
    ) -> SettlementResult<PaymentIntentHandle> {
        if round_money(&request.amount) <= BigDecimal::from(0) {
            return Err(SettlementError::validation(
                "amount must be at least 0.01",
                "amount",
            ));
        }
        if request.payer_id == request.payee_id {
            return Err(SettlementError::validation(
                "payer and payee must differ",
                "payee_id",
            ));
        }

        let context = &request.context;
        let contract = self.load_contract(context.contract_id).await?;
        self.authorize_parties(&contract, request.payer_id, request.payee_id)?;

        if let Some(milestone_id) = context.milestone_id {
            let milestone = self
                .contracts
                .find_milestone(milestone_id)
                .await?
                .ok_or_else(|| SettlementError::not_found("milestone", milestone_id))?;
            if milestone.contract_id != contract.id {
                return Err(SettlementError::validation(
                    "milestone does not belong to the contract",
                    "milestone_id",
                ));
            }
        }

        let contract_currency = if contract.currency.trim().is_empty() {
            self.config.default_currency.as_str()
        } else {
            contract.currency.as_str()
        };
        let currency = normalize_currency(request.currency.as_deref().unwrap_or(contract_currency))?;
        if !contract_currency.eq_ignore_ascii_case(&currency) {
            return Err(SettlementError::validation(
                format!(
                    "currency {} does not match contract currency {}",
                    currency, contract_currency
                ),
                "currency",
            ));
        }

        if let Some(active) = self
            .payments
            .find_active_for_relation(Some(contract.id), context.milestone_id)
            .await?
        {
            return Err(SettlementError::Conflict(format!(
                "payment {} is already {} for this {}",
                active.id,
                active.status,
                if context.milestone_id.is_some() {
                    "milestone"
                } else {
                    "contract"
                }
            )));
        }

        let fees = calculate_fees(&request.amount, &contract.platform_fee_percentage)?;

        let mut metadata = HashMap::new();
        metadata.insert("payer_id".to_string(), request.payer_id.to_string());
        metadata.insert("payee_id".to_string(), request.payee_id.to_string());
        metadata.insert("contract_id".to_string(), contract.id.to_string());
        if let Some(milestone_id) = context.milestone_id {
            metadata.insert("milestone_id".to_string(), milestone_id.to_string());
        }
        metadata.insert("payment_reference".to_string(), Uuid::new_v4().to_string());

        let intent = self
            .create_gateway_intent(CreateIntentRequest {
                amount: fees.total_charge.clone(),
                currency: currency.clone(),
                payment_method: context.payment_method.clone(),
                customer_id: None,
                description: context.description.clone(),
                metadata,
            })
            .await?;

        let inserted = self
            .payments
            .insert(NewPaymentRecord {
                gateway_intent_id: Some(intent.id.clone()),
                payer_id: request.payer_id,
                payee_id: request.payee_id,
                contract_id: Some(contract.id),
                milestone_id: context.milestone_id,
                amount: fees.base_amount.clone(),
                platform_fee: fees.platform_fee.clone(),
                platform_fee_percentage: fees.fee_percentage.clone(),
                total_charge: fees.total_charge.clone(),
                currency,
            })
            .await;

        let payment = match inserted {
            Ok(payment) => payment,
            Err(e) => {
                error!(
                    intent_id = %intent.id,
                    contract_id = %contract.id,
                    error = %e,
                    "Failed to persist payment record, canceling gateway intent"
                );
                self.cancel_intent_best_effort(&intent.id).await;
                return Err(if e.is_unique_violation() {
                    SettlementError::Conflict("an active payment already exists".to_string())
                } else {
                    SettlementError::Persistence(e)
                });
            }
        };

        if let Err(e) = self
            .ledger
            .insert(payment_ledger_entry(&payment, LedgerStatus::Pending))
            .await
        {
            // Completion inserts the payment entry when no pending one exists.
            warn!(
                payment_id = %payment.id,
                error = %e,
                "Failed to write pending ledger entry"
            );
        }

        info!(
            payment_id = %payment.id,
            intent_id = %intent.id,
            amount = %payment.amount,
            platform_fee = %payment.platform_fee,
            total_charge = %payment.total_charge,
            "Payment intent created"
        );

        Ok(PaymentIntentHandle {
            payment_id: payment.id,
            intent_id: intent.id,
            client_secret: intent.client_secret,
            fees,
        })
    }

    // ------------------------------------------------------------------
    // Transitions
    // ------------------------------------------------------------------

    /// `PENDING -> PROCESSING` on the gateway's processing acknowledgement.
    pub async fn mark_processing(&self, payment_id: Uuid) -> SettlementResult<PaymentRecord> {
        let payment = self.transition(payment_id, StatusChange::Processing).await?;
        info!(payment_id = %payment_id, status = %payment.status, "Payment processing");
        Ok(payment)
    }

    /// Settles a payment. Completing an already settled payment is a no-op
    /// that returns [`CompletionOutcome::AlreadySettled`].
    pub async fn complete_payment(
        &self,
        payment_id: Uuid,
        gateway_charge_id: &str,
        gateway_fee: Option<BigDecimal>,
    ) -> SettlementResult<CompletionOutcome> {
        let current = self.get_payment(payment_id).await?;
        if matches!(
            current.status,
            PaymentStatus::Completed | PaymentStatus::Refunded
        ) {
            info!(
                payment_id = %payment_id,
                status = %current.status,
                "Payment already settled, skipping completion"
            );
            return Ok(CompletionOutcome::AlreadySettled { payment: current });
        }

        let change = StatusChange::Completed {
            charge_id: gateway_charge_id.to_string(),
            gateway_fee: gateway_fee.clone(),
        };
        check_transition(current.status, current.retry_count, &change)?;

        if let Ok(Some(mismatch)) = self.audit_record(&current) {
            error!(
                payment_id = %payment_id,
                recorded_fee = %mismatch.recorded_fee,
                expected_fee = %mismatch.expected.platform_fee,
                "Recorded fee breakdown does not match recomputation"
            );
        }

        let outcome = self
            .settlement
            .commit_completion(CompletionWrite {
                payment_id,
                charge_id: gateway_charge_id.to_string(),
                gateway_fee,
            })
            .await?;

        match &outcome {
            CompletionOutcome::Applied {
                payment,
                credit,
                ledger_complete,
                ..
            } => {
                match credit {
                    CreditOutcome::Applied => {}
                    CreditOutcome::Deferred {
                        failed_update_id,
                        error,
                    } => error!(
                        payment_id = %payment.id,
                        payee_id = %payment.payee_id,
                        failed_update_id = %failed_update_id,
                        error = %error,
                        "Payee credit deferred for completed payment"
                    ),
                    CreditOutcome::Unrecorded { error } => error!(
                        payment_id = %payment.id,
                        payee_id = %payment.payee_id,
                        amount = %payment.amount,
                        error = %error,
                        manual_reconciliation = true,
                        "Payee credit lost for completed payment"
                    ),
                }

                info!(
                    payment_id = %payment.id,
                    charge_id = %gateway_charge_id,
                    credit_applied = credit.is_applied(),
                    ledger_complete = *ledger_complete,
                    "✅ Payment completed"
                );

                dispatch(
                    self.notifier.as_ref(),
                    PaymentNotification::PaymentCompleted {
                        payment_id: payment.id,
                        payer_id: payment.payer_id,
                        payee_id: payment.payee_id,
                        amount: payment.amount.clone(),
                        currency: payment.currency.clone(),
                    },
                )
                .await;
            }
            CompletionOutcome::AlreadySettled { payment } => {
                info!(
                    payment_id = %payment.id,
                    status = %payment.status,
                    "Concurrent completion won, skipping"
                );
            }
        }

        Ok(outcome)
    }

    /// `PENDING|PROCESSING -> FAILED`, consuming one retry.
    pub async fn fail_payment(
        &self,
        payment_id: Uuid,
        error_message: &str,
    ) -> SettlementResult<PaymentRecord> {
        let current = self.get_payment(payment_id).await?;
        if current.status == PaymentStatus::Failed {
            return Ok(current);
        }

        let change = StatusChange::Failed {
            error: error_message.to_string(),
        };
        check_transition(current.status, current.retry_count, &change)?;

        let Some(payment) = self.payments.apply_transition(payment_id, &change).await? else {
            let latest = self.get_payment(payment_id).await?;
            info!(
                payment_id = %payment_id,
                status = %latest.status,
                "Payment changed concurrently, failure not applied"
            );
            return Ok(latest);
        };

        if let Err(e) = self
            .ledger
            .settle_payment_entries(payment_id, LedgerStatus::Failed, None)
            .await
        {
            warn!(payment_id = %payment_id, error = %e, "Failed to mark ledger entries failed");
        }

        warn!(
            payment_id = %payment_id,
            retry_count = payment.retry_count,
            error = %error_message,
            "❌ Payment failed"
        );

        dispatch(
            self.notifier.as_ref(),
            PaymentNotification::PaymentFailed {
                payment_id,
                payer_id: payment.payer_id,
                reason: error_message.to_string(),
                retry_count: payment.retry_count,
            },
        )
        .await;

        Ok(payment)
    }

    /// Refunds a completed payment through the gateway and records it.
    /// `refund_amount` defaults to the payee amount. The payment is claimed
    /// before the gateway is called, so concurrent requests issue one refund.
    pub async fn refund_payment(
        &self,
        payment_id: Uuid,
        refund_amount: Option<BigDecimal>,
    ) -> SettlementResult<PaymentRecord> {
        let current = self.get_payment(payment_id).await?;
        let amount = validate_refund(&current, refund_amount)?;
        check_transition(
            current.status,
            current.retry_count,
            &StatusChange::Refunded {
                amount: amount.clone(),
            },
        )?;

        let charge_id = current.gateway_charge_id.clone().ok_or_else(|| {
            SettlementError::Conflict(format!("payment {} has no gateway charge", payment_id))
        })?;

        let stale_before = Utc::now() - chrono::Duration::minutes(REFUND_CLAIM_TTL_MINUTES);
        if self
            .payments
            .claim_refund(payment_id, stale_before)
            .await?
            .is_none()
        {
            let latest = self.get_payment(payment_id).await?;
            return Err(if latest.status == PaymentStatus::Completed {
                SettlementError::Conflict(format!(
                    "a refund is already in progress for payment {}",
                    payment_id
                ))
            } else {
                SettlementError::InvalidTransition {
                    from: latest.status,
                    to: PaymentStatus::Refunded,
                }
            });
        }

        let idempotency_key = refund_idempotency_key(payment_id);
        let issued = tokio::time::timeout(
            self.config.gateway_timeout,
            self.gateway
                .refund_charge(&charge_id, &amount, &idempotency_key),
        )
        .await
        .map_err(|_| GatewayError::Timeout {
            seconds: self.config.gateway_timeout.as_secs(),
        })
        .and_then(|result| result);

        let refund = match issued {
            Ok(refund) => refund,
            Err(e) => {
                // Safe to release: a repeat reuses the idempotency key.
                warn!(payment_id = %payment_id, error = %e, "Gateway refund failed");
                if let Err(release_error) = self.payments.release_refund_claim(payment_id).await {
                    warn!(
                        payment_id = %payment_id,
                        error = %release_error,
                        "Failed to release refund claim"
                    );
                }
                return Err(e.into());
            }
        };

        info!(
            payment_id = %payment_id,
            charge_id = %charge_id,
            refund_id = %refund.id,
            amount = %amount,
            "Gateway refund issued"
        );

        match self
            .record_refund(payment_id, Some(amount), Some(refund.id))
            .await
        {
            // The gateway's refund webhook recorded it first.
            Err(SettlementError::InvalidTransition {
                from: PaymentStatus::Refunded,
                ..
            }) => self.get_payment(payment_id).await,
            other => other,
        }
    }

    /// Records a refund that already happened at the gateway (API-initiated or
    /// reported by webhook). The conditional transition makes it apply once.
    pub async fn record_refund(
        &self,
        payment_id: Uuid,
        refund_amount: Option<BigDecimal>,
        gateway_reference: Option<String>,
    ) -> SettlementResult<PaymentRecord> {
        let current = self.get_payment(payment_id).await?;
        let amount = validate_refund(&current, refund_amount)?;
        let change = StatusChange::Refunded {
            amount: amount.clone(),
        };
        check_transition(current.status, current.retry_count, &change)?;

        let Some(payment) = self.payments.apply_transition(payment_id, &change).await? else {
            let latest = self.get_payment(payment_id).await?;
            info!(
                payment_id = %payment_id,
                status = %latest.status,
                "Payment changed concurrently, refund not recorded twice"
            );
            return Ok(latest);
        };

        // The payee was credited `amount`; anything above it is platform fee.
        let clawback = if amount < payment.amount {
            amount.clone()
        } else {
            payment.amount.clone()
        };
        let fee_reversal = &amount - &clawback;

        let reference = gateway_reference.or_else(|| payment.gateway_charge_id.clone());
        let mut entries = vec![NewLedgerEntry::simple(
            LedgerEntryType::Refund,
            Some(payment.payee_id),
            Some(payment.payer_id),
            clawback.clone(),
            &payment.currency,
            LedgerStatus::Completed,
        )
        .description("refund")];
        if fee_reversal > BigDecimal::from(0) {
            entries.push(
                NewLedgerEntry::simple(
                    LedgerEntryType::FeeReversal,
                    None,
                    Some(payment.payer_id),
                    fee_reversal.clone(),
                    &payment.currency,
                    LedgerStatus::Completed,
                )
                .description("platform fee refund"),
            );
        }

        for entry in entries {
            let entry = entry
                .for_payment(payment.id)
                .gateway_reference(reference.clone());
            let entry = match payment.milestone_id {
                Some(milestone) => entry.related(Some(milestone), RelatedType::Milestone),
                None => entry.related(payment.contract_id, RelatedType::Contract),
            };
            let entry_type = entry.entry_type;
            let entry_amount = entry.amount.clone();
            if let Err(e) = self.ledger.insert(entry).await {
                error!(
                    payment_id = %payment.id,
                    entry_type = %entry_type,
                    amount = %entry_amount,
                    error = %e,
                    manual_reconciliation = true,
                    "Refund ledger entry missing for refunded payment"
                );
            }
        }
        if let Err(e) = self
            .balances
            .debit_payee(payment.id, payment.payee_id, &clawback)
            .await
        {
            warn!(
                payment_id = %payment.id,
                payee_id = %payment.payee_id,
                error = %e,
                "Refund clawback not applied to payee balance"
            );
        }

        info!(
            payment_id = %payment.id,
            refund_amount = %amount,
            clawback = %clawback,
            fee_reversal = %fee_reversal,
            "↩️ Payment refunded"
        );

        dispatch(
            self.notifier.as_ref(),
            PaymentNotification::PaymentRefunded {
                payment_id: payment.id,
                payer_id: payment.payer_id,
                payee_id: payment.payee_id,
                refund_amount: amount,
                currency: payment.currency.clone(),
            },
        )
        .await;

        Ok(payment)
    }

    /// `FAILED -> PENDING` with a fresh gateway intent while retries remain.
    /// The failed attempt's intent is canceled first so the payer cannot be
    /// charged by both.
    pub async fn retry_payment(&self, payment_id: Uuid) -> SettlementResult<PaymentIntentHandle> {
        let current = self.get_payment(payment_id).await?;
        // Validation only looks at the target status and retry budget.
        check_transition(
            current.status,
            current.retry_count,
            &StatusChange::Retried {
                intent_id: String::new(),
            },
        )?;

        if let Some(previous) = current.gateway_intent_id.as_deref() {
            self.close_replaced_intent(payment_id, previous).await?;
        }

        let mut metadata = HashMap::new();
        metadata.insert("payment_id".to_string(), payment_id.to_string());
        metadata.insert("payer_id".to_string(), current.payer_id.to_string());
        metadata.insert("payee_id".to_string(), current.payee_id.to_string());
        metadata.insert(
            "payment_reference".to_string(),
            format!("{}-retry-{}", payment_id, current.retry_count),
        );

        let intent = self
            .create_gateway_intent(CreateIntentRequest {
                amount: current.total_charge.clone(),
                currency: current.currency.clone(),
                payment_method: None,
                customer_id: None,
                description: None,
                metadata,
            })
            .await?;

        let change = StatusChange::Retried {
            intent_id: intent.id.clone(),
        };
        let updated = match self.payments.apply_transition(payment_id, &change).await {
            Ok(Some(updated)) => updated,
            Ok(None) => {
                self.cancel_intent_best_effort(&intent.id).await;
                return Err(SettlementError::Conflict(format!(
                    "payment {} changed while retrying",
                    payment_id
                )));
            }
            Err(e) => {
                self.cancel_intent_best_effort(&intent.id).await;
                return Err(e.into());
            }
        };

        if let Err(e) = self
            .ledger
            .insert(payment_ledger_entry(&updated, LedgerStatus::Pending))
            .await
        {
            warn!(payment_id = %payment_id, error = %e, "Failed to write pending ledger entry");
        }

        info!(
            payment_id = %payment_id,
            intent_id = %intent.id,
            retry_count = updated.retry_count,
            "🔄 Payment retried"
        );

        Ok(PaymentIntentHandle {
            payment_id,
            intent_id: intent.id,
            client_secret: intent.client_secret,
            fees: breakdown_of(&updated),
        })
    }

    /// Settles a payment from a success reported for an intent a retry replaced.
    /// The payer was charged through the old intent, so it is the payment of
    /// record; the replacement intent is canceled. A payment already settled
    /// through another charge is left for manual reconciliation.
    pub async fn complete_from_replaced_intent(
        &self,
        payment_id: Uuid,
        replaced_intent_id: &str,
        gateway_charge_id: &str,
        gateway_fee: Option<BigDecimal>,
    ) -> SettlementResult<Option<CompletionOutcome>> {
        let current = self.get_payment(payment_id).await?;
        match current.status {
            PaymentStatus::Pending | PaymentStatus::Processing => {
                let outcome = self
                    .complete_payment(payment_id, gateway_charge_id, gateway_fee)
                    .await?;
                if let (CompletionOutcome::Applied { .. }, Some(replacement)) =
                    (&outcome, current.gateway_intent_id.as_deref())
                {
                    self.cancel_intent_best_effort(replacement).await;
                }
                warn!(
                    payment_id = %payment_id,
                    replaced_intent_id = %replaced_intent_id,
                    charge_id = %gateway_charge_id,
                    "Payment settled through a replaced gateway intent"
                );
                Ok(Some(outcome))
            }
            _ if current.gateway_charge_id.as_deref() == Some(gateway_charge_id) => Ok(None),
            status => {
                error!(
                    payment_id = %payment_id,
                    status = %status,
                    replaced_intent_id = %replaced_intent_id,
                    charge_id = %gateway_charge_id,
                    settled_charge_id = ?current.gateway_charge_id,
                    manual_reconciliation = true,
                    "Replaced gateway intent charged the payer outside the payment's lifecycle"
                );
                Ok(None)
            }
        }
    }

    /// Soft-deletes a payment that can no longer move money.
    pub async fn archive_payment(&self, payment_id: Uuid) -> SettlementResult<()> {
        let archivable = [PaymentStatus::Failed, PaymentStatus::Refunded];
        if self.payments.soft_delete(payment_id, &archivable).await? {
            info!(payment_id = %payment_id, "Payment archived");
            return Ok(());
        }
        let current = self.get_payment(payment_id).await?;
        Err(SettlementError::Conflict(format!(
            "payment in status {} cannot be archived",
            current.status
        )))
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    pub async fn get_payment(&self, payment_id: Uuid) -> SettlementResult<PaymentRecord> {
        self.payments
            .find_by_id(payment_id)
            .await?
            .ok_or_else(|| SettlementError::not_found("payment", payment_id))
    }

    pub async fn find_by_intent(&self, intent_id: &str) -> SettlementResult<Option<PaymentRecord>> {
        Ok(self.payments.find_by_intent_id(intent_id).await?)
    }

    /// Recomputes a payment's fee breakdown for audit.
    pub async fn verify_fees(&self, payment_id: Uuid) -> SettlementResult<Option<FeeMismatch>> {
        let payment = self.get_payment(payment_id).await?;
        self.audit_record(&payment)
    }

    /// Creates a gateway customer and a setup intent for saving a payment method.
    pub async fn start_payment_method_setup(
        &self,
        email: &str,
        name: Option<&str>,
    ) -> SettlementResult<SetupIntent> {
        let customer = self.gateway.create_customer(email, name).await?;
        let setup = self.gateway.create_setup_intent(&customer.id).await?;
        info!(customer_id = %customer.id, setup_intent_id = %setup.id, "Payment method setup started");
        Ok(setup)
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    async fn load_contract(&self, contract_id: Uuid) -> SettlementResult<ContractTerms> {
        self.contracts
            .find_contract(contract_id)
            .await?
            .ok_or_else(|| SettlementError::not_found("contract", contract_id))
    }

    fn authorize_parties(
        &self,
        contract: &ContractTerms,
        payer_id: Uuid,
        payee_id: Uuid,
    ) -> SettlementResult<()> {
        if contract.client_id != payer_id {
            return Err(SettlementError::Authorization(format!(
                "user {} is not the client of contract {}",
                payer_id, contract.id
            )));
        }
        if contract.freelancer_id != payee_id {
            return Err(SettlementError::Authorization(format!(
                "user {} is not the freelancer of contract {}",
                payee_id, contract.id
            )));
        }
        Ok(())
    }

    async fn create_gateway_intent(
        &self,
        request: CreateIntentRequest,
    ) -> SettlementResult<PaymentIntent> {
        let timeout = self.config.gateway_timeout;
        match tokio::time::timeout(timeout, self.gateway.create_payment_intent(request)).await {
            Ok(Ok(intent)) => Ok(intent),
            Ok(Err(e)) => {
                warn!(gateway = self.gateway.name(), error = %e, "Gateway intent creation failed");
                Err(e.into())
            }
            Err(_) => {
                warn!(
                    gateway = self.gateway.name(),
                    timeout_secs = timeout.as_secs(),
                    "Gateway intent creation timed out"
                );
                Err(GatewayError::Timeout {
                    seconds: timeout.as_secs(),
                }
                .into())
            }
        }
    }

    /// Cancels the intent a retry is about to replace. An intent the gateway
    /// already charged (or is charging) blocks the retry.
    async fn close_replaced_intent(&self, payment_id: Uuid, intent_id: &str) -> SettlementResult<()> {
        let timeout = self.config.gateway_timeout;
        let timed_out = || GatewayError::Timeout {
            seconds: timeout.as_secs(),
        };

        let snapshot = match tokio::time::timeout(
            timeout,
            self.gateway.retrieve_payment_intent(intent_id),
        )
        .await
        .map_err(|_| timed_out())?
        {
            Ok(snapshot) => snapshot,
            Err(GatewayError::NotFound { .. }) => {
                warn!(payment_id = %payment_id, intent_id = %intent_id, "Replaced intent unknown to gateway");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        match snapshot.status {
            IntentStatus::Canceled => Ok(()),
            IntentStatus::Succeeded | IntentStatus::Processing => {
                Err(SettlementError::Conflict(format!(
                    "intent {} for payment {} is {} at the gateway",
                    intent_id, payment_id, snapshot.status
                )))
            }
            _ => {
                tokio::time::timeout(timeout, self.gateway.cancel_payment_intent(intent_id))
                    .await
                    .map_err(|_| timed_out())??;
                info!(payment_id = %payment_id, intent_id = %intent_id, "Replaced gateway intent canceled");
                Ok(())
            }
        }
    }

    async fn cancel_intent_best_effort(&self, intent_id: &str) {
        let result = tokio::time::timeout(
            self.config.gateway_timeout,
            self.gateway.cancel_payment_intent(intent_id),
        )
        .await;
        match result {
            Ok(Ok(())) => info!(intent_id = %intent_id, "Orphaned gateway intent canceled"),
            Ok(Err(e)) => warn!(intent_id = %intent_id, error = %e, "Failed to cancel gateway intent"),
            Err(_) => warn!(intent_id = %intent_id, "Timed out canceling gateway intent"),
        }
    }

    /// Applies a simple transition. Re-applying the current status, or losing
    /// the conditional update to a concurrent writer, returns the latest record.
    async fn transition(
        &self,
        payment_id: Uuid,
        change: StatusChange,
    ) -> SettlementResult<PaymentRecord> {
        let current = self.get_payment(payment_id).await?;
        if current.status == change.target() {
            return Ok(current);
        }
        check_transition(current.status, current.retry_count, &change)?;

        match self.payments.apply_transition(payment_id, &change).await? {
            Some(updated) => Ok(updated),
            None => self.get_payment(payment_id).await,
        }
    }

    fn audit_record(&self, payment: &PaymentRecord) -> SettlementResult<Option<FeeMismatch>> {
        Ok(verify_recorded_fees(
            &payment.amount,
            &payment.platform_fee_percentage,
            &payment.platform_fee,
            &payment.total_charge,
        )?)
    }
}

fn refund_idempotency_key(payment_id: Uuid) -> String {
    format!("refund-{}", payment_id)
}

fn normalize_currency(raw: &str) -> SettlementResult<String> {
    let currency = raw.trim().to_ascii_uppercase();
    if currency.len() != 3 || !currency.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(SettlementError::validation(
            format!("invalid ISO currency code: {}", raw),
            "currency",
        ));
    }
    Ok(currency)
}

/// Refund defaults to the payee amount and must satisfy `0 < refund <= total_charge`.
fn validate_refund(
    payment: &PaymentRecord,
    refund_amount: Option<BigDecimal>,
) -> SettlementResult<BigDecimal> {
    let amount = round_money(&refund_amount.unwrap_or_else(|| payment.amount.clone()));
    if amount <= BigDecimal::from(0) {
        return Err(SettlementError::validation(
            "refund amount must be greater than zero",
            "refund_amount",
        ));
    }
    if amount > payment.total_charge {
        return Err(SettlementError::validation(
            format!(
                "refund amount {} exceeds total charge {}",
                amount, payment.total_charge
            ),
            "refund_amount",
        ));
    }
    Ok(amount)
}

fn breakdown_of(payment: &PaymentRecord) -> FeeBreakdown {
    FeeBreakdown {
        base_amount: payment.amount.clone(),
        fee_percentage: payment.platform_fee_percentage.clone(),
        platform_fee: payment.platform_fee.clone(),
        total_charge: payment.total_charge.clone(),
        payee_amount: payment.amount.clone(),
    }
}
