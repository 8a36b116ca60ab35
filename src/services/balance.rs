//! Payee balance projection.
//!
//! Adjustments are single atomic increments. An adjustment that cannot be
//! applied is parked as a `FailedBalanceUpdate` so the obligation survives,
//! and the retry job replays it later.

use crate::database::balance_repository::{BalanceStore, UserBalance};
use crate::database::error::DatabaseError;
use crate::database::failed_balance_repository::{
    AtomicReplay, FailedBalanceStore, FailedBalanceUpdate, FailedUpdateStatus,
    NewFailedBalanceUpdate,
};
use bigdecimal::BigDecimal;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum BalanceError {
    /// Not applied now; parked for the retry job
    #[error("balance update deferred as {failed_update_id}: {source}")]
    Deferred {
        failed_update_id: Uuid,
        source: DatabaseError,
    },

    /// Not applied and not parked
    #[error("balance update lost: {source} (parking failed: {record_error})")]
    Unrecorded {
        source: DatabaseError,
        record_error: DatabaseError,
    },

    #[error(transparent)]
    Persistence(#[from] DatabaseError),
}

/// Outcome counts for one retry batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetryReport {
    pub examined: usize,
    pub applied: usize,
    pub rescheduled: usize,
    pub permanently_failed: usize,
    /// Claimed by another worker between listing and claiming
    pub skipped: usize,
    pub errors: usize,
}

#[derive(Clone)]
pub struct BalanceUpdater {
    balances: Arc<dyn BalanceStore>,
    failed_updates: Arc<dyn FailedBalanceStore>,
}

impl BalanceUpdater {
    pub fn new(
        balances: Arc<dyn BalanceStore>,
        failed_updates: Arc<dyn FailedBalanceStore>,
    ) -> Self {
        Self {
            balances,
            failed_updates,
        }
    }

    /// Adds a completed payment's net amount to the payee's pending balance.
    pub async fn credit_payee(
        &self,
        payment_id: Uuid,
        payee_id: Uuid,
        amount: &BigDecimal,
    ) -> Result<UserBalance, BalanceError> {
        self.adjust_or_park(payment_id, payee_id, amount.clone())
            .await
    }

    /// Claws a refunded amount back from the payee's pending balance. The
    /// balance may go negative.
    pub async fn debit_payee(
        &self,
        payment_id: Uuid,
        payee_id: Uuid,
        amount: &BigDecimal,
    ) -> Result<UserBalance, BalanceError> {
        self.adjust_or_park(payment_id, payee_id, -amount.clone())
            .await
    }

    async fn adjust_or_park(
        &self,
        payment_id: Uuid,
        payee_id: Uuid,
        delta: BigDecimal,
    ) -> Result<UserBalance, BalanceError> {
        let adjust_error = match self.balances.adjust_pending_balance(payee_id, &delta).await {
            Ok(balance) => {
                info!(
                    payment_id = %payment_id,
                    payee_id = %payee_id,
                    delta = %delta,
                    "Payee balance adjusted"
                );
                return Ok(balance);
            }
            Err(e) => e,
        };

        let parked = self
            .failed_updates
            .insert(NewFailedBalanceUpdate {
                payment_id,
                payee_id,
                amount: delta.clone(),
                error: adjust_error.to_string(),
            })
            .await;

        match parked {
            Ok(row) => {
                warn!(
                    payment_id = %payment_id,
                    payee_id = %payee_id,
                    delta = %delta,
                    failed_update_id = %row.id,
                    error = %adjust_error,
                    "Balance adjustment failed, parked for retry"
                );
                Err(BalanceError::Deferred {
                    failed_update_id: row.id,
                    source: adjust_error,
                })
            }
            Err(record_error) => {
                error!(
                    payment_id = %payment_id,
                    payee_id = %payee_id,
                    delta = %delta,
                    error = %adjust_error,
                    record_error = %record_error,
                    manual_reconciliation = true,
                    "Balance adjustment failed and could not be parked"
                );
                Err(BalanceError::Unrecorded {
                    source: adjust_error,
                    record_error,
                })
            }
        }
    }

    /// Replays parked adjustments oldest first. Per-row failures are counted
    /// and never abort the batch.
    pub async fn retry_failed_updates(
        &self,
        batch_size: i64,
        max_attempts: i32,
    ) -> Result<RetryReport, BalanceError> {
        let candidates = self.failed_updates.list_claimable(batch_size).await?;
        let mut report = RetryReport::default();

        for candidate in candidates {
            report.examined += 1;

            let claimed = match self.failed_updates.claim(candidate.id).await {
                Ok(Some(row)) => row,
                Ok(None) => {
                    report.skipped += 1;
                    continue;
                }
                Err(e) => {
                    warn!(failed_update_id = %candidate.id, error = %e, "Failed to claim balance update");
                    report.errors += 1;
                    continue;
                }
            };

            match self.failed_updates.replay_atomically(&claimed).await {
                Ok(AtomicReplay::Applied) => {
                    log_applied(&claimed);
                    report.applied += 1;
                }
                Ok(AtomicReplay::ClaimLost) => {
                    report.skipped += 1;
                }
                Ok(AtomicReplay::Unsupported) => {
                    self.replay_marked_first(&claimed, max_attempts, &mut report)
                        .await;
                }
                Err(adjust_error) => {
                    self.reschedule(&claimed, &adjust_error, max_attempts, &mut report)
                        .await;
                }
            }
        }

        Ok(report)
    }

    /// Completes the row before touching the balance so a lost completion
    /// can never replay an applied adjustment; a failed adjustment reopens it.
    async fn replay_marked_first(
        &self,
        claimed: &FailedBalanceUpdate,
        max_attempts: i32,
        report: &mut RetryReport,
    ) {
        match self.failed_updates.mark_completed(claimed).await {
            Ok(true) => {}
            Ok(false) => {
                report.skipped += 1;
                return;
            }
            Err(e) => {
                warn!(failed_update_id = %claimed.id, error = %e, "Failed to mark balance update completed");
                report.errors += 1;
                return;
            }
        }

        match self
            .balances
            .adjust_pending_balance(claimed.payee_id, &claimed.amount)
            .await
        {
            Ok(_) => {
                log_applied(claimed);
                report.applied += 1;
            }
            Err(adjust_error) => {
                self.reschedule(claimed, &adjust_error, max_attempts, report)
                    .await;
            }
        }
    }

    async fn reschedule(
        &self,
        claimed: &FailedBalanceUpdate,
        adjust_error: &DatabaseError,
        max_attempts: i32,
        report: &mut RetryReport,
    ) {
        match self
            .failed_updates
            .record_attempt_failure(claimed, &adjust_error.to_string(), max_attempts)
            .await
        {
            Ok(Some(updated)) if updated.status == FailedUpdateStatus::Failed => {
                error!(
                    failed_update_id = %updated.id,
                    payment_id = %updated.payment_id,
                    payee_id = %updated.payee_id,
                    amount = %updated.amount,
                    attempts = updated.retry_count,
                    error = %adjust_error,
                    manual_reconciliation = true,
                    "Balance update permanently failed"
                );
                report.permanently_failed += 1;
            }
            Ok(Some(updated)) => {
                warn!(
                    failed_update_id = %updated.id,
                    attempts = updated.retry_count,
                    error = %adjust_error,
                    "Balance update retry failed, rescheduled"
                );
                report.rescheduled += 1;
            }
            Ok(None) => {
                error!(
                    failed_update_id = %claimed.id,
                    payment_id = %claimed.payment_id,
                    amount = %claimed.amount,
                    error = %adjust_error,
                    manual_reconciliation = true,
                    "Balance update not applied and its claim was lost"
                );
                report.errors += 1;
            }
            Err(e) => {
                error!(
                    failed_update_id = %claimed.id,
                    payment_id = %claimed.payment_id,
                    amount = %claimed.amount,
                    error = %adjust_error,
                    record_error = %e,
                    manual_reconciliation = true,
                    "Balance update not applied and could not be reopened"
                );
                report.errors += 1;
            }
        }
    }
}

fn log_applied(claimed: &FailedBalanceUpdate) {
    info!(
        failed_update_id = %claimed.id,
        payment_id = %claimed.payment_id,
        amount = %claimed.amount,
        "Parked balance update applied"
    );
}
