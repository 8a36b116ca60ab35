use crate::config::SchedulerConfig;
use crate::database::error::DatabaseError;
use crate::database::failed_balance_repository::{FailedBalanceStore, FailedUpdateStatus};
use crate::database::payment_repository::{PaymentRecord, PaymentStore, StatusTotals};
use crate::payments::types::{IntentSnapshot, IntentStatus};
use crate::services::balance::{BalanceError, BalanceUpdater, RetryReport};
use crate::services::notification::{dispatch, Notifier, PaymentNotification};
use crate::services::payment_service::{PaymentService, SettlementError};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{error, info, warn};

const REPORT_WINDOW_DAYS: i64 = 7;

// ---------------------------------------------------------------------------
// Errors and reports
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ReconciliationError {
    #[error("database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("balance retry error: {0}")]
    Balance(#[from] BalanceError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub examined: usize,
    pub completed: usize,
    pub failed: usize,
    pub still_pending: usize,
    pub errors: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct OperationalReport {
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub by_status: Vec<StatusTotals>,
    pub stuck_payments: i64,
    pub outstanding_failed_updates: i64,
    pub permanently_failed_updates: i64,
    pub alerts: Vec<String>,
}

/// What the sweep does with a stuck payment given the gateway's view of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SweepAction {
    Complete,
    Fail,
    /// Abandoned checkout: cancel at the gateway first so it cannot succeed later
    CancelAndFail,
    MarkProcessing,
    Leave,
}

fn action_for(status: IntentStatus) -> SweepAction {
    match status {
        IntentStatus::Succeeded => SweepAction::Complete,
        IntentStatus::Canceled => SweepAction::Fail,
        IntentStatus::RequiresPaymentMethod => SweepAction::CancelAndFail,
        IntentStatus::Processing => SweepAction::MarkProcessing,
        _ => SweepAction::Leave,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemResult {
    Completed,
    Failed,
    StillPending,
    Error,
}

fn alerts_for(
    config: &SchedulerConfig,
    stuck_payments: i64,
    outstanding_failed_updates: i64,
    permanently_failed_updates: i64,
) -> Vec<String> {
    let mut alerts = Vec::new();
    if stuck_payments > config.stuck_alert_threshold {
        alerts.push(format!(
            "{} payments stuck in PENDING/PROCESSING for more than {}h (threshold {})",
            stuck_payments, config.stuck_after_hours, config.stuck_alert_threshold
        ));
    }
    if outstanding_failed_updates > config.failed_updates_alert_threshold {
        alerts.push(format!(
            "{} balance updates awaiting retry (threshold {})",
            outstanding_failed_updates, config.failed_updates_alert_threshold
        ));
    }
    if permanently_failed_updates > 0 {
        alerts.push(format!(
            "{} balance updates need manual reconciliation",
            permanently_failed_updates
        ));
    }
    alerts
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

pub struct ReconciliationWorker {
    payments: Arc<dyn PaymentStore>,
    failed_updates: Arc<dyn FailedBalanceStore>,
    service: PaymentService,
    balances: BalanceUpdater,
    notifier: Arc<dyn Notifier>,
    config: SchedulerConfig,
}

impl ReconciliationWorker {
    pub fn new(
        payments: Arc<dyn PaymentStore>,
        failed_updates: Arc<dyn FailedBalanceStore>,
        service: PaymentService,
        balances: BalanceUpdater,
        notifier: Arc<dyn Notifier>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            payments,
            failed_updates,
            service,
            balances,
            notifier,
            config,
        }
    }

    /// Runs the three jobs on their own intervals until shutdown is signalled.
    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            sweep_interval_secs = self.config.sweep_interval_secs,
            balance_retry_interval_secs = self.config.balance_retry_interval_secs,
            report_interval_secs = self.config.report_interval_secs,
            stuck_after_hours = self.config.stuck_after_hours,
            "reconciliation worker started"
        );

        let mut sweep = ticker(self.config.sweep_interval_secs);
        let mut balance_retry = ticker(self.config.balance_retry_interval_secs);
        let mut report = ticker(self.config.report_interval_secs);

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("reconciliation worker stopping");
                        break;
                    }
                }
                _ = sweep.tick() => {
                    if let Err(e) = self.sweep_stuck_payments().await {
                        error!(error = %e, "stuck payment sweep failed");
                    }
                }
                _ = balance_retry.tick() => {
                    if let Err(e) = self.retry_failed_balances().await {
                        error!(error = %e, "failed balance retry job failed");
                    }
                }
                _ = report.tick() => {
                    if let Err(e) = self.weekly_report().await {
                        error!(error = %e, "operational report failed");
                    }
                }
            }
        }

        info!("reconciliation worker stopped");
    }

    // -----------------------------------------------------------------------
    // Stuck-payment sweep
    // -----------------------------------------------------------------------

    /// Drives payments stuck in `PENDING`/`PROCESSING` to the state the gateway
    /// reports. Per-item errors are counted and never abort the batch.
    pub async fn sweep_stuck_payments(&self) -> Result<SweepReport, ReconciliationError> {
        let before = Utc::now() - chrono::Duration::hours(self.config.stuck_after_hours);
        let stuck = self
            .payments
            .find_stale(before, self.config.sweep_batch_size)
            .await?;

        let results: Vec<ItemResult> = stream::iter(stuck)
            .map(|payment| self.reconcile_payment(payment))
            .buffer_unordered(self.config.sweep_concurrency.max(1))
            .collect()
            .await;

        let mut report = SweepReport {
            examined: results.len(),
            ..Default::default()
        };
        for result in results {
            match result {
                ItemResult::Completed => report.completed += 1,
                ItemResult::Failed => report.failed += 1,
                ItemResult::StillPending => report.still_pending += 1,
                ItemResult::Error => report.errors += 1,
            }
        }

        info!(
            examined = report.examined,
            completed = report.completed,
            failed = report.failed,
            still_pending = report.still_pending,
            errors = report.errors,
            "stuck payment sweep finished"
        );
        Ok(report)
    }

    async fn reconcile_payment(&self, payment: PaymentRecord) -> ItemResult {
        let Some(intent_id) = payment.gateway_intent_id.clone() else {
            return self
                .fail(&payment, "no gateway intent recorded for stuck payment")
                .await;
        };

        let snapshot = match self.fetch_intent(&intent_id).await {
            Ok(snapshot) => snapshot,
            Err(message) => {
                warn!(
                    payment_id = %payment.id,
                    intent_id = %intent_id,
                    error = %message,
                    "could not fetch gateway status for stuck payment"
                );
                return ItemResult::Error;
            }
        };

        match action_for(snapshot.status) {
            SweepAction::Complete => {
                let charge_id = snapshot.charge_id.as_deref().unwrap_or(intent_id.as_str());
                match self
                    .service
                    .complete_payment(payment.id, charge_id, snapshot.gateway_fee.clone())
                    .await
                {
                    Ok(_) => {
                        info!(payment_id = %payment.id, intent_id = %intent_id, "stuck payment completed from gateway status");
                        ItemResult::Completed
                    }
                    Err(e) => self.item_error(&payment, e),
                }
            }
            SweepAction::Fail => {
                let reason = snapshot
                    .last_error
                    .clone()
                    .unwrap_or_else(|| format!("gateway reports intent {}", snapshot.status));
                self.fail(&payment, &reason).await
            }
            SweepAction::CancelAndFail => {
                let cancel = tokio::time::timeout(
                    self.service.config().gateway_timeout,
                    self.service.gateway().cancel_payment_intent(&intent_id),
                )
                .await;
                match cancel {
                    Ok(Ok(())) => {
                        self.fail(&payment, "payment abandoned before a payment method was provided")
                            .await
                    }
                    Ok(Err(e)) => {
                        warn!(payment_id = %payment.id, intent_id = %intent_id, error = %e, "could not cancel abandoned intent");
                        ItemResult::Error
                    }
                    Err(_) => {
                        warn!(payment_id = %payment.id, intent_id = %intent_id, "timed out canceling abandoned intent");
                        ItemResult::Error
                    }
                }
            }
            SweepAction::MarkProcessing => match self.service.mark_processing(payment.id).await {
                Ok(_) => ItemResult::StillPending,
                Err(e) => self.item_error(&payment, e),
            },
            SweepAction::Leave => {
                info!(
                    payment_id = %payment.id,
                    gateway_status = %snapshot.status,
                    "stuck payment still pending at gateway"
                );
                ItemResult::StillPending
            }
        }
    }

    async fn fetch_intent(&self, intent_id: &str) -> Result<IntentSnapshot, String> {
        let timeout = self.service.config().gateway_timeout;
        match tokio::time::timeout(
            timeout,
            self.service.gateway().retrieve_payment_intent(intent_id),
        )
        .await
        {
            Ok(Ok(snapshot)) => Ok(snapshot),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("timed out after {}s", timeout.as_secs())),
        }
    }

    async fn fail(&self, payment: &PaymentRecord, reason: &str) -> ItemResult {
        match self.service.fail_payment(payment.id, reason).await {
            Ok(_) => ItemResult::Failed,
            Err(e) => self.item_error(payment, e),
        }
    }

    fn item_error(&self, payment: &PaymentRecord, err: SettlementError) -> ItemResult {
        warn!(
            payment_id = %payment.id,
            intent_id = ?payment.gateway_intent_id,
            error = %err,
            "stuck payment reconciliation failed"
        );
        ItemResult::Error
    }

    // -----------------------------------------------------------------------
    // Failed balance updates
    // -----------------------------------------------------------------------

    pub async fn retry_failed_balances(&self) -> Result<RetryReport, ReconciliationError> {
        let report = self
            .balances
            .retry_failed_updates(
                self.config.balance_retry_batch_size,
                self.config.balance_retry_max_attempts,
            )
            .await?;

        info!(
            examined = report.examined,
            applied = report.applied,
            rescheduled = report.rescheduled,
            permanently_failed = report.permanently_failed,
            skipped = report.skipped,
            errors = report.errors,
            "failed balance retry finished"
        );
        Ok(report)
    }

    // -----------------------------------------------------------------------
    // Operational report
    // -----------------------------------------------------------------------

    pub async fn weekly_report(&self) -> Result<OperationalReport, ReconciliationError> {
        let period_end = Utc::now();
        let period_start = period_end - chrono::Duration::days(REPORT_WINDOW_DAYS);
        let stuck_before = period_end - chrono::Duration::hours(self.config.stuck_after_hours);

        let by_status = self.payments.status_breakdown(period_start).await?;
        let stuck_payments = self.payments.count_stale(stuck_before).await?;
        let outstanding_failed_updates = self
            .failed_updates
            .count_by_status(FailedUpdateStatus::Pending)
            .await?
            + self
                .failed_updates
                .count_by_status(FailedUpdateStatus::Retrying)
                .await?;
        let permanently_failed_updates = self
            .failed_updates
            .count_by_status(FailedUpdateStatus::Failed)
            .await?;

        let alerts = alerts_for(
            &self.config,
            stuck_payments,
            outstanding_failed_updates,
            permanently_failed_updates,
        );

        for totals in &by_status {
            info!(
                status = %totals.status,
                count = totals.count,
                total_amount = %totals.total_amount,
                "weekly payment volume"
            );
        }
        info!(
            stuck_payments,
            outstanding_failed_updates,
            permanently_failed_updates,
            alerts = alerts.len(),
            "📊 weekly operational report"
        );

        if !alerts.is_empty() {
            error!(alerts = ?alerts, "operational thresholds exceeded");
            dispatch(
                self.notifier.as_ref(),
                PaymentNotification::OperationalAlert {
                    title: "Payment reconciliation thresholds exceeded".to_string(),
                    details: alerts.clone(),
                },
            )
            .await;
        }

        Ok(OperationalReport {
            period_start,
            period_end,
            by_status,
            stuck_payments,
            outstanding_failed_updates,
            permanently_failed_updates,
            alerts,
        })
    }
}

/// Interval whose first tick is one period away.
fn ticker(period_secs: u64) -> tokio::time::Interval {
    let period = Duration::from_secs(period_secs.max(1));
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}
