//! Completion unit of work.
//!
//! Completing a payment touches four records: the payment status, the payee
//! balance, the contract and the ledger. [`SettlementStore`] exposes whether
//! the backing storage can write them atomically. Postgres wraps them in one
//! transaction; stores with single-record atomicity run them in order through
//! [`BestEffortSettlement`] and park a failed credit as a `FailedBalanceUpdate`.
//!
//! In both modes the conditional status flip runs first. A caller that loses
//! the flip gets [`CompletionOutcome::AlreadySettled`] and nothing else is written.

use crate::database::balance_repository::adjust_pending_balance_with;
use crate::database::contract_repository::{activate_with, ContractDirectory};
use crate::database::error::DatabaseError;
use crate::database::failed_balance_repository::{self, NewFailedBalanceUpdate};
use crate::database::ledger_repository::{
    self, LedgerEntryType, LedgerStatus, LedgerStore, NewLedgerEntry, RelatedType,
};
use crate::database::payment_repository::{
    apply_transition_with, PaymentRecord, PaymentStore, PgPaymentRepository,
};
use crate::payments::state::StatusChange;
use crate::services::balance::{BalanceError, BalanceUpdater};
use async_trait::async_trait;
use bigdecimal::{BigDecimal, Zero};
use sqlx::{PgPool, Postgres, Transaction};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// What the storage engine can guarantee for a multi-record write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Atomicity {
    /// All records commit or none do
    MultiDocument,
    /// Each record commits on its own; failures are compensated
    SingleDocument,
}

#[derive(Debug, Clone)]
pub struct CompletionWrite {
    pub payment_id: Uuid,
    pub charge_id: String,
    pub gateway_fee: Option<BigDecimal>,
}

impl CompletionWrite {
    fn status_change(&self) -> StatusChange {
        StatusChange::Completed {
            charge_id: self.charge_id.clone(),
            gateway_fee: self.gateway_fee.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CreditOutcome {
    Applied,
    /// Parked for the retry job
    Deferred {
        failed_update_id: Uuid,
        error: String,
    },
    /// Neither applied nor parked; only the logs carry the obligation
    Unrecorded { error: String },
}

impl CreditOutcome {
    pub fn from_result<T>(result: Result<T, BalanceError>) -> Self {
        match result {
            Ok(_) => CreditOutcome::Applied,
            Err(BalanceError::Deferred {
                failed_update_id,
                source,
            }) => CreditOutcome::Deferred {
                failed_update_id,
                error: source.to_string(),
            },
            Err(e) => CreditOutcome::Unrecorded {
                error: e.to_string(),
            },
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, CreditOutcome::Applied)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CompletionOutcome {
    Applied {
        payment: PaymentRecord,
        credit: CreditOutcome,
        contract_activated: bool,
        ledger_complete: bool,
    },
    /// The record had already left `PENDING`/`PROCESSING`; nothing was written
    AlreadySettled { payment: PaymentRecord },
}

impl CompletionOutcome {
    pub fn payment(&self) -> &PaymentRecord {
        match self {
            CompletionOutcome::Applied { payment, .. } => payment,
            CompletionOutcome::AlreadySettled { payment } => payment,
        }
    }
}

#[async_trait]
pub trait SettlementStore: Send + Sync {
    fn atomicity(&self) -> Atomicity;

    async fn commit_completion(
        &self,
        write: CompletionWrite,
    ) -> Result<CompletionOutcome, DatabaseError>;
}

// ---------------------------------------------------------------------------
// Ledger entries shared by both modes and by the payment service
// ---------------------------------------------------------------------------

/// The payer-to-payee movement for a payment attempt.
pub fn payment_ledger_entry(payment: &PaymentRecord, status: LedgerStatus) -> NewLedgerEntry {
    let (related_id, related_type) = match (payment.milestone_id, payment.contract_id) {
        (Some(milestone), _) => (Some(milestone), RelatedType::Milestone),
        (None, Some(contract)) => (Some(contract), RelatedType::Contract),
        (None, None) => (Some(payment.id), RelatedType::Payment),
    };
    NewLedgerEntry {
        entry_type: LedgerEntryType::Payment,
        from_user: Some(payment.payer_id),
        to_user: Some(payment.payee_id),
        amount: payment.total_charge.clone(),
        fee: payment.platform_fee.clone(),
        net_amount: payment.amount.clone(),
        currency: payment.currency.clone(),
        related_id,
        related_type: Some(related_type),
        payment_id: Some(payment.id),
        gateway_reference: payment.gateway_intent_id.clone(),
        status,
        description: None,
    }
}

/// Completed fee entries for a settled payment, skipping zero amounts.
pub fn fee_ledger_entries(payment: &PaymentRecord) -> Vec<NewLedgerEntry> {
    let mut entries = Vec::new();

    if !payment.platform_fee.is_zero() {
        entries.push(
            NewLedgerEntry::simple(
                LedgerEntryType::Fee,
                Some(payment.payer_id),
                None,
                payment.platform_fee.clone(),
                &payment.currency,
                LedgerStatus::Completed,
            )
            .for_payment(payment.id)
            .gateway_reference(payment.gateway_charge_id.clone())
            .related(Some(payment.id), RelatedType::Payment)
            .description("platform fee"),
        );
    }

    if let Some(gateway_fee) = payment.gateway_fee.as_ref().filter(|fee| !fee.is_zero()) {
        entries.push(
            NewLedgerEntry::simple(
                LedgerEntryType::Fee,
                None,
                None,
                gateway_fee.clone(),
                &payment.currency,
                LedgerStatus::Completed,
            )
            .for_payment(payment.id)
            .gateway_reference(payment.gateway_charge_id.clone())
            .related(Some(payment.id), RelatedType::Payment)
            .description("gateway processing fee"),
        );
    }

    entries
}

// ---------------------------------------------------------------------------
// Postgres
// ---------------------------------------------------------------------------

const BALANCE_SAVEPOINT: &str = "balance_credit";
const CONTRACT_SAVEPOINT: &str = "contract_activation";

pub struct PgSettlementStore {
    pool: PgPool,
    payments: PgPaymentRepository,
    use_transactions: bool,
    fallback: BestEffortSettlement,
}

impl PgSettlementStore {
    pub fn new(pool: PgPool, use_transactions: bool, fallback: BestEffortSettlement) -> Self {
        Self {
            payments: PgPaymentRepository::new(pool.clone()),
            pool,
            use_transactions,
            fallback,
        }
    }

    async fn savepoint(
        tx: &mut Transaction<'_, Postgres>,
        statement: &str,
    ) -> Result<(), DatabaseError> {
        sqlx::query(statement)
            .execute(&mut **tx)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        Ok(())
    }

    async fn complete_in_transaction(
        &self,
        write: CompletionWrite,
    ) -> Result<CompletionOutcome, DatabaseError> {
        let mut tx = self.pool.begin().await.map_err(DatabaseError::from_sqlx)?;

        let Some(payment) =
            apply_transition_with(&mut *tx, write.payment_id, &write.status_change()).await?
        else {
            tx.rollback().await.map_err(DatabaseError::from_sqlx)?;
            let current = self
                .payments
                .find_by_id(write.payment_id)
                .await?
                .ok_or_else(|| DatabaseError::not_found("payment", write.payment_id))?;
            return Ok(CompletionOutcome::AlreadySettled { payment: current });
        };

        Self::savepoint(&mut tx, &format!("SAVEPOINT {BALANCE_SAVEPOINT}")).await?;
        let credit =
            match adjust_pending_balance_with(&mut *tx, payment.payee_id, &payment.amount).await {
                Ok(_) => {
                    Self::savepoint(&mut tx, &format!("RELEASE SAVEPOINT {BALANCE_SAVEPOINT}"))
                        .await?;
                    CreditOutcome::Applied
                }
                Err(credit_error) => {
                    Self::savepoint(&mut tx, &format!("ROLLBACK TO SAVEPOINT {BALANCE_SAVEPOINT}"))
                        .await?;
                    // A failure here aborts the whole transaction, leaving the
                    // payment uncompleted for redelivery or the sweep.
                    let parked = failed_balance_repository::insert_with(
                        &mut *tx,
                        &NewFailedBalanceUpdate {
                            payment_id: payment.id,
                            payee_id: payment.payee_id,
                            amount: payment.amount.clone(),
                            error: credit_error.to_string(),
                        },
                    )
                    .await?;
                    warn!(
                        payment_id = %payment.id,
                        payee_id = %payment.payee_id,
                        failed_update_id = %parked.id,
                        error = %credit_error,
                        "Balance credit deferred inside settlement transaction"
                    );
                    CreditOutcome::Deferred {
                        failed_update_id: parked.id,
                        error: credit_error.to_string(),
                    }
                }
            };

        let mut contract_activated = false;
        if let Some(contract_id) = payment.activates_contract() {
            Self::savepoint(&mut tx, &format!("SAVEPOINT {CONTRACT_SAVEPOINT}")).await?;
            match activate_with(&mut *tx, contract_id, &payment.total_charge).await {
                Ok(()) => {
                    Self::savepoint(&mut tx, &format!("RELEASE SAVEPOINT {CONTRACT_SAVEPOINT}"))
                        .await?;
                    contract_activated = true;
                }
                Err(e) => {
                    Self::savepoint(
                        &mut tx,
                        &format!("ROLLBACK TO SAVEPOINT {CONTRACT_SAVEPOINT}"),
                    )
                    .await?;
                    error!(
                        payment_id = %payment.id,
                        contract_id = %contract_id,
                        error = %e,
                        manual_reconciliation = true,
                        "Contract activation failed for completed payment"
                    );
                }
            }
        }

        let settled = ledger_repository::settle_payment_entries_with(
            &mut *tx,
            payment.id,
            LedgerStatus::Completed,
            Some(write.charge_id.clone()),
        )
        .await?;
        if settled.is_empty() {
            let entry = payment_ledger_entry(&payment, LedgerStatus::Completed)
                .gateway_reference(Some(write.charge_id.clone()));
            ledger_repository::insert_with(&mut *tx, &entry).await?;
        }
        for fee_entry in fee_ledger_entries(&payment) {
            ledger_repository::insert_with(&mut *tx, &fee_entry).await?;
        }

        tx.commit().await.map_err(DatabaseError::from_sqlx)?;

        info!(
            payment_id = %payment.id,
            credit_applied = credit.is_applied(),
            contract_activated,
            "Payment settlement committed"
        );

        Ok(CompletionOutcome::Applied {
            payment,
            credit,
            contract_activated,
            ledger_complete: true,
        })
    }
}

#[async_trait]
impl SettlementStore for PgSettlementStore {
    fn atomicity(&self) -> Atomicity {
        if self.use_transactions {
            Atomicity::MultiDocument
        } else {
            Atomicity::SingleDocument
        }
    }

    async fn commit_completion(
        &self,
        write: CompletionWrite,
    ) -> Result<CompletionOutcome, DatabaseError> {
        match self.atomicity() {
            Atomicity::MultiDocument => self.complete_in_transaction(write).await,
            Atomicity::SingleDocument => self.fallback.commit_completion(write).await,
        }
    }
}

// ---------------------------------------------------------------------------
// Sequential writes with a compensating record
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct BestEffortSettlement {
    payments: Arc<dyn PaymentStore>,
    ledger: Arc<dyn LedgerStore>,
    contracts: Arc<dyn ContractDirectory>,
    balances: BalanceUpdater,
}

impl BestEffortSettlement {
    pub fn new(
        payments: Arc<dyn PaymentStore>,
        ledger: Arc<dyn LedgerStore>,
        contracts: Arc<dyn ContractDirectory>,
        balances: BalanceUpdater,
    ) -> Self {
        Self {
            payments,
            ledger,
            contracts,
            balances,
        }
    }

    async fn write_ledger(
        &self,
        payment: &PaymentRecord,
        charge_id: &str,
    ) -> Result<(), DatabaseError> {
        let settled = self
            .ledger
            .settle_payment_entries(payment.id, LedgerStatus::Completed, Some(charge_id.to_string()))
            .await?;
        if settled.is_empty() {
            let entry = payment_ledger_entry(payment, LedgerStatus::Completed)
                .gateway_reference(Some(charge_id.to_string()));
            self.ledger.insert(entry).await?;
        }
        for fee_entry in fee_ledger_entries(payment) {
            self.ledger.insert(fee_entry).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl SettlementStore for BestEffortSettlement {
    fn atomicity(&self) -> Atomicity {
        Atomicity::SingleDocument
    }

    async fn commit_completion(
        &self,
        write: CompletionWrite,
    ) -> Result<CompletionOutcome, DatabaseError> {
        let Some(payment) = self
            .payments
            .apply_transition(write.payment_id, &write.status_change())
            .await?
        else {
            let current = self
                .payments
                .find_by_id(write.payment_id)
                .await?
                .ok_or_else(|| DatabaseError::not_found("payment", write.payment_id))?;
            return Ok(CompletionOutcome::AlreadySettled { payment: current });
        };

        // The status flip is durable from here on; every later step degrades
        // instead of failing the completion.
        let credit = CreditOutcome::from_result(
            self.balances
                .credit_payee(payment.id, payment.payee_id, &payment.amount)
                .await,
        );

        let mut contract_activated = false;
        if let Some(contract_id) = payment.activates_contract() {
            match self.contracts.activate(contract_id, &payment.total_charge).await {
                Ok(()) => contract_activated = true,
                Err(e) => error!(
                    payment_id = %payment.id,
                    contract_id = %contract_id,
                    error = %e,
                    manual_reconciliation = true,
                    "Contract activation failed for completed payment"
                ),
            }
        }

        let ledger_complete = match self.write_ledger(&payment, &write.charge_id).await {
            Ok(()) => true,
            Err(e) => {
                error!(
                    payment_id = %payment.id,
                    charge_id = %write.charge_id,
                    error = %e,
                    manual_reconciliation = true,
                    "Ledger entries missing for completed payment"
                );
                false
            }
        };

        info!(
            payment_id = %payment.id,
            credit_applied = credit.is_applied(),
            contract_activated,
            ledger_complete,
            "Payment settlement applied"
        );

        Ok(CompletionOutcome::Applied {
            payment,
            credit,
            contract_activated,
            ledger_complete,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payments::state::PaymentStatus;
    use chrono::Utc;

    fn payment(gateway_fee: Option<BigDecimal>) -> PaymentRecord {
        let now = Utc::now();
        PaymentRecord {
            id: Uuid::new_v4(),
            gateway_intent_id: Some("pi_1".to_string()),
            previous_intent_ids: Vec::new(),
            gateway_charge_id: Some("ch_1".to_string()),
            payer_id: Uuid::new_v4(),
            payee_id: Uuid::new_v4(),
            contract_id: Some(Uuid::new_v4()),
            milestone_id: Some(Uuid::new_v4()),
            amount: BigDecimal::from(1000),
            platform_fee: BigDecimal::from(100),
            platform_fee_percentage: BigDecimal::from(10),
            total_charge: BigDecimal::from(1100),
            gateway_fee,
            refunded_amount: None,
            currency: "USD".to_string(),
            status: PaymentStatus::Completed,
            retry_count: 0,
            error_message: None,
            created_at: now,
            updated_at: now,
            processing_at: None,
            completed_at: Some(now),
            failed_at: None,
            refunded_at: None,
            refund_requested_at: None,
            deleted_at: None,
        }
    }

    #[test]
    fn payment_entry_separates_fee_from_net() {
        let p = payment(None);
        let entry = payment_ledger_entry(&p, LedgerStatus::Pending);
        assert_eq!(entry.amount, BigDecimal::from(1100));
        assert_eq!(entry.fee, BigDecimal::from(100));
        assert_eq!(entry.net_amount, BigDecimal::from(1000));
        assert_eq!(entry.related_type, Some(RelatedType::Milestone));
    }

    #[test]
    fn zero_gateway_fee_writes_only_platform_fee() {
        let entries = fee_ledger_entries(&payment(Some(BigDecimal::from(0))));
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].amount, BigDecimal::from(100));
    }

    #[test]
    fn gateway_fee_gets_its_own_entry() {
        let entries = fee_ledger_entries(&payment(Some(BigDecimal::from(32))));
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].amount, BigDecimal::from(32));
        assert!(entries.iter().all(|e| e.status == LedgerStatus::Completed));
    }

    #[test]
    fn deferred_credit_keeps_parked_row_id() {
        let id = Uuid::new_v4();
        let outcome = CreditOutcome::from_result::<()>(Err(BalanceError::Deferred {
            failed_update_id: id,
            source: DatabaseError::not_found("user balance", "x"),
        }));
        assert!(matches!(outcome, CreditOutcome::Deferred { failed_update_id, .. } if failed_update_id == id));
    }
}
