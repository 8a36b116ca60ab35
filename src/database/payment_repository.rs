use crate::database::error::DatabaseError;
use crate::payments::state::{PaymentStatus, StatusChange, MAX_PAYMENT_RETRIES};
use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool, Postgres};
use uuid::Uuid;

/// One attempt to move money from a payer to a payee.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PaymentRecord {
    pub id: Uuid,
    pub gateway_intent_id: Option<String>,
    /// Intents replaced by retries, oldest first
    pub previous_intent_ids: Vec<String>,
    pub gateway_charge_id: Option<String>,
    pub payer_id: Uuid,
    pub payee_id: Uuid,
    pub contract_id: Option<Uuid>,
    pub milestone_id: Option<Uuid>,
    /// Net amount owed to the payee
    pub amount: BigDecimal,
    pub platform_fee: BigDecimal,
    pub platform_fee_percentage: BigDecimal,
    /// What the payer is billed: `amount + platform_fee`
    pub total_charge: BigDecimal,
    /// Assessed by the processor, known only after settlement
    pub gateway_fee: Option<BigDecimal>,
    pub refunded_amount: Option<BigDecimal>,
    pub currency: String,
    pub status: PaymentStatus,
    pub retry_count: i32,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub processing_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub refunded_at: Option<DateTime<Utc>>,
    /// Set while a refund is in flight at the gateway
    pub refund_requested_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl PaymentRecord {
    /// Contract-level payments (no milestone) activate their contract on completion.
    pub fn activates_contract(&self) -> Option<Uuid> {
        match (self.contract_id, self.milestone_id) {
            (Some(contract_id), None) => Some(contract_id),
            _ => None,
        }
    }

    /// Builds the record a [`StatusChange`] produces. Used by stores that
    /// cannot express the change as a single SQL update.
    pub fn with_change(&self, change: &StatusChange, now: DateTime<Utc>) -> PaymentRecord {
        let mut next = self.clone();
        next.status = change.target();
        next.updated_at = now;
        match change {
            StatusChange::Processing => {
                next.processing_at = Some(now);
            }
            StatusChange::Completed {
                charge_id,
                gateway_fee,
            } => {
                next.gateway_charge_id = Some(charge_id.clone());
                next.gateway_fee = gateway_fee.clone();
                next.error_message = None;
                next.completed_at = Some(now);
            }
            StatusChange::Failed { error } => {
                next.error_message = Some(error.clone());
                next.retry_count += 1;
                next.failed_at = Some(now);
            }
            StatusChange::Refunded { amount } => {
                next.refunded_amount = Some(amount.clone());
                next.refunded_at = Some(now);
                next.refund_requested_at = None;
            }
            StatusChange::Retried { intent_id } => {
                if let Some(previous) = next.gateway_intent_id.take() {
                    next.previous_intent_ids.push(previous);
                }
                next.gateway_intent_id = Some(intent_id.clone());
                next.gateway_charge_id = None;
                next.error_message = None;
            }
        }
        next
    }

    /// False for intents a retry replaced.
    pub fn is_current_intent(&self, intent_id: &str) -> bool {
        self.gateway_intent_id.as_deref() == Some(intent_id)
    }

    /// A refund claim older than `stale_before` is treated as abandoned.
    pub fn refund_claimable(&self, stale_before: DateTime<Utc>) -> bool {
        self.status == PaymentStatus::Completed
            && self.deleted_at.is_none()
            && self
                .refund_requested_at
                .map_or(true, |claimed| claimed < stale_before)
    }
}

/// Fields supplied when a payment intent is created.
#[derive(Debug, Clone)]
pub struct NewPaymentRecord {
    pub gateway_intent_id: Option<String>,
    pub payer_id: Uuid,
    pub payee_id: Uuid,
    pub contract_id: Option<Uuid>,
    pub milestone_id: Option<Uuid>,
    pub amount: BigDecimal,
    pub platform_fee: BigDecimal,
    pub platform_fee_percentage: BigDecimal,
    pub total_charge: BigDecimal,
    pub currency: String,
}

/// Count and volume of payments in one status.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusTotals {
    pub status: PaymentStatus,
    pub count: i64,
    pub total_amount: BigDecimal,
}

#[async_trait]
pub trait PaymentStore: Send + Sync {
    async fn insert(&self, new: NewPaymentRecord) -> Result<PaymentRecord, DatabaseError>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<PaymentRecord>, DatabaseError>;

    /// Matches the current intent or one replaced by a retry.
    async fn find_by_intent_id(
        &self,
        intent_id: &str,
    ) -> Result<Option<PaymentRecord>, DatabaseError>;

    /// An active (pending, processing or completed) payment for the milestone,
    /// or for the contract itself when `milestone_id` is `None`.
    async fn find_active_for_relation(
        &self,
        contract_id: Option<Uuid>,
        milestone_id: Option<Uuid>,
    ) -> Result<Option<PaymentRecord>, DatabaseError>;

    /// Applies `change` only if the record is still in one of
    /// `change.allowed_from()`. Returns `None` when another writer got there first.
    async fn apply_transition(
        &self,
        id: Uuid,
        change: &StatusChange,
    ) -> Result<Option<PaymentRecord>, DatabaseError>;

    /// Pending or processing payments last touched before `before`, oldest first.
    async fn find_stale(
        &self,
        before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<PaymentRecord>, DatabaseError>;

    async fn count_stale(&self, before: DateTime<Utc>) -> Result<i64, DatabaseError>;

    async fn status_breakdown(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<StatusTotals>, DatabaseError>;

    /// Marks a completed payment as having a refund in flight. Returns `None`
    /// when it is not completed or another refund claimed it after `stale_before`.
    async fn claim_refund(
        &self,
        id: Uuid,
        stale_before: DateTime<Utc>,
    ) -> Result<Option<PaymentRecord>, DatabaseError>;

    /// Drops the in-flight marker after the gateway refused the refund.
    async fn release_refund_claim(&self, id: Uuid) -> Result<(), DatabaseError>;

    /// Sets the soft-delete marker if the record is in one of `allowed`.
    async fn soft_delete(
        &self,
        id: Uuid,
        allowed: &[PaymentStatus],
    ) -> Result<bool, DatabaseError>;
}

// ---------------------------------------------------------------------------
// Postgres
// ---------------------------------------------------------------------------

const PAYMENT_COLUMNS: &str = "id, gateway_intent_id, previous_intent_ids, gateway_charge_id, \
     payer_id, payee_id, contract_id, milestone_id, amount, platform_fee, platform_fee_percentage, \
     total_charge, gateway_fee, refunded_amount, currency, status, retry_count, error_message, \
     created_at, updated_at, processing_at, completed_at, failed_at, refunded_at, \
     refund_requested_at, deleted_at";

#[derive(Debug, FromRow)]
struct PaymentRow {
    id: Uuid,
    gateway_intent_id: Option<String>,
    previous_intent_ids: Vec<String>,
    gateway_charge_id: Option<String>,
    payer_id: Uuid,
    payee_id: Uuid,
    contract_id: Option<Uuid>,
    milestone_id: Option<Uuid>,
    amount: BigDecimal,
    platform_fee: BigDecimal,
    platform_fee_percentage: BigDecimal,
    total_charge: BigDecimal,
    gateway_fee: Option<BigDecimal>,
    refunded_amount: Option<BigDecimal>,
    currency: String,
    status: String,
    retry_count: i32,
    error_message: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    processing_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    failed_at: Option<DateTime<Utc>>,
    refunded_at: Option<DateTime<Utc>>,
    refund_requested_at: Option<DateTime<Utc>>,
    deleted_at: Option<DateTime<Utc>>,
}

impl TryFrom<PaymentRow> for PaymentRecord {
    type Error = DatabaseError;

    fn try_from(row: PaymentRow) -> Result<Self, Self::Error> {
        let status = row.status.parse::<PaymentStatus>().map_err(DatabaseError::query)?;
        Ok(PaymentRecord {
            id: row.id,
            gateway_intent_id: row.gateway_intent_id,
            previous_intent_ids: row.previous_intent_ids,
            gateway_charge_id: row.gateway_charge_id,
            payer_id: row.payer_id,
            payee_id: row.payee_id,
            contract_id: row.contract_id,
            milestone_id: row.milestone_id,
            amount: row.amount,
            platform_fee: row.platform_fee,
            platform_fee_percentage: row.platform_fee_percentage,
            total_charge: row.total_charge,
            gateway_fee: row.gateway_fee,
            refunded_amount: row.refunded_amount,
            currency: row.currency,
            status,
            retry_count: row.retry_count,
            error_message: row.error_message,
            created_at: row.created_at,
            updated_at: row.updated_at,
            processing_at: row.processing_at,
            completed_at: row.completed_at,
            failed_at: row.failed_at,
            refunded_at: row.refunded_at,
            refund_requested_at: row.refund_requested_at,
            deleted_at: row.deleted_at,
        })
    }
}

fn status_strings(statuses: &[PaymentStatus]) -> Vec<String> {
    statuses.iter().map(|s| s.as_str().to_string()).collect()
}

/// Conditional status update shared by the repository and the transactional
/// settlement path.
pub(crate) async fn apply_transition_with<'e, E>(
    executor: E,
    id: Uuid,
    change: &StatusChange,
) -> Result<Option<PaymentRecord>, DatabaseError>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    let expected = status_strings(&change.allowed_from());
    let target = change.target().as_str();

    let (assignments, retry_guard) = match change {
        StatusChange::Processing => ("processing_at = NOW()", ""),
        StatusChange::Completed { .. } => (
            "gateway_charge_id = $4, gateway_fee = $5, error_message = NULL, completed_at = NOW()",
            "",
        ),
        StatusChange::Failed { .. } => (
            "error_message = $4, retry_count = retry_count + 1, failed_at = NOW()",
            "",
        ),
        StatusChange::Refunded { .. } => (
            "refunded_amount = $4, refunded_at = NOW(), refund_requested_at = NULL",
            "",
        ),
        StatusChange::Retried { .. } => (
            "previous_intent_ids = CASE WHEN gateway_intent_id IS NULL THEN previous_intent_ids \
             ELSE array_append(previous_intent_ids, gateway_intent_id) END, \
             gateway_intent_id = $4, gateway_charge_id = NULL, error_message = NULL",
            " AND retry_count < $5",
        ),
    };

    let sql = format!(
        "UPDATE payments \
         SET status = $3, updated_at = NOW(), {assignments} \
         WHERE id = $1 AND status = ANY($2) AND deleted_at IS NULL{retry_guard} \
         RETURNING {PAYMENT_COLUMNS}"
    );

    let query = sqlx::query_as::<_, PaymentRow>(&sql)
        .bind(id)
        .bind(expected)
        .bind(target);
    let query = match change {
        StatusChange::Processing => query,
        StatusChange::Completed {
            charge_id,
            gateway_fee,
        } => query.bind(charge_id.clone()).bind(gateway_fee.clone()),
        StatusChange::Failed { error } => query.bind(error.clone()),
        StatusChange::Refunded { amount } => query.bind(amount.clone()),
        StatusChange::Retried { intent_id } => {
            query.bind(intent_id.clone()).bind(MAX_PAYMENT_RETRIES)
        }
    };

    let row = query
        .fetch_optional(executor)
        .await
        .map_err(DatabaseError::from_sqlx)?;

    row.map(PaymentRecord::try_from).transpose()
}

/// Repository for payment records
#[derive(Clone)]
pub struct PgPaymentRepository {
    pool: PgPool,
}

impl PgPaymentRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PaymentStore for PgPaymentRepository {
    async fn insert(&self, new: NewPaymentRecord) -> Result<PaymentRecord, DatabaseError> {
        let sql = format!(
            "INSERT INTO payments \
             (id, gateway_intent_id, payer_id, payee_id, contract_id, milestone_id, amount, \
              platform_fee, platform_fee_percentage, total_charge, currency, status, retry_count) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, 'PENDING', 0) \
             RETURNING {PAYMENT_COLUMNS}"
        );
        let row = sqlx::query_as::<_, PaymentRow>(&sql)
            .bind(Uuid::new_v4())
            .bind(&new.gateway_intent_id)
            .bind(new.payer_id)
            .bind(new.payee_id)
            .bind(new.contract_id)
            .bind(new.milestone_id)
            .bind(&new.amount)
            .bind(&new.platform_fee)
            .bind(&new.platform_fee_percentage)
            .bind(&new.total_charge)
            .bind(&new.currency)
            .fetch_one(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        PaymentRecord::try_from(row)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<PaymentRecord>, DatabaseError> {
        let sql = format!("SELECT {PAYMENT_COLUMNS} FROM payments WHERE id = $1");
        sqlx::query_as::<_, PaymentRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?
            .map(PaymentRecord::try_from)
            .transpose()
    }

    async fn find_by_intent_id(
        &self,
        intent_id: &str,
    ) -> Result<Option<PaymentRecord>, DatabaseError> {
        let sql = format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments \
             WHERE (gateway_intent_id = $1 OR $1 = ANY(previous_intent_ids)) \
               AND deleted_at IS NULL \
             LIMIT 1"
        );
        sqlx::query_as::<_, PaymentRow>(&sql)
            .bind(intent_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?
            .map(PaymentRecord::try_from)
            .transpose()
    }

    async fn find_active_for_relation(
        &self,
        contract_id: Option<Uuid>,
        milestone_id: Option<Uuid>,
    ) -> Result<Option<PaymentRecord>, DatabaseError> {
        let active = status_strings(&[
            PaymentStatus::Pending,
            PaymentStatus::Processing,
            PaymentStatus::Completed,
        ]);
        let sql = if milestone_id.is_some() {
            format!(
                "SELECT {PAYMENT_COLUMNS} FROM payments \
                 WHERE milestone_id = $2 AND status = ANY($3) AND deleted_at IS NULL \
                   AND ($1::uuid IS NULL OR contract_id = $1) \
                 ORDER BY created_at DESC LIMIT 1"
            )
        } else {
            format!(
                "SELECT {PAYMENT_COLUMNS} FROM payments \
                 WHERE contract_id = $1 AND milestone_id IS NULL AND $2::uuid IS NULL \
                   AND status = ANY($3) AND deleted_at IS NULL \
                 ORDER BY created_at DESC LIMIT 1"
            )
        };
        sqlx::query_as::<_, PaymentRow>(&sql)
            .bind(contract_id)
            .bind(milestone_id)
            .bind(active)
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?
            .map(PaymentRecord::try_from)
            .transpose()
    }

    async fn apply_transition(
        &self,
        id: Uuid,
        change: &StatusChange,
    ) -> Result<Option<PaymentRecord>, DatabaseError> {
        apply_transition_with(&self.pool, id, change).await
    }

    async fn find_stale(
        &self,
        before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<PaymentRecord>, DatabaseError> {
        let sql = format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments \
             WHERE status IN ('PENDING', 'PROCESSING') AND updated_at < $1 AND deleted_at IS NULL \
             ORDER BY updated_at ASC \
             LIMIT $2"
        );
        let rows = sqlx::query_as::<_, PaymentRow>(&sql)
            .bind(before)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        rows.into_iter().map(PaymentRecord::try_from).collect()
    }

    async fn count_stale(&self, before: DateTime<Utc>) -> Result<i64, DatabaseError> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM payments \
             WHERE status IN ('PENDING', 'PROCESSING') AND updated_at < $1 AND deleted_at IS NULL",
        )
        .bind(before)
        .fetch_one(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        Ok(count)
    }

    async fn status_breakdown(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<StatusTotals>, DatabaseError> {
        let rows: Vec<(String, i64, Option<BigDecimal>)> = sqlx::query_as(
            "SELECT status, COUNT(*), SUM(amount) FROM payments \
             WHERE created_at >= $1 AND deleted_at IS NULL \
             GROUP BY status \
             ORDER BY status",
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        rows.into_iter()
            .map(|(status, count, total)| {
                Ok(StatusTotals {
                    status: status.parse().map_err(DatabaseError::query)?,
                    count,
                    total_amount: total.unwrap_or_else(|| BigDecimal::from(0)),
                })
            })
            .collect()
    }

    async fn claim_refund(
        &self,
        id: Uuid,
        stale_before: DateTime<Utc>,
    ) -> Result<Option<PaymentRecord>, DatabaseError> {
        let sql = format!(
            "UPDATE payments SET refund_requested_at = NOW(), updated_at = NOW() \
             WHERE id = $1 AND status = 'COMPLETED' AND deleted_at IS NULL \
               AND (refund_requested_at IS NULL OR refund_requested_at < $2) \
             RETURNING {PAYMENT_COLUMNS}"
        );
        sqlx::query_as::<_, PaymentRow>(&sql)
            .bind(id)
            .bind(stale_before)
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?
            .map(PaymentRecord::try_from)
            .transpose()
    }

    async fn release_refund_claim(&self, id: Uuid) -> Result<(), DatabaseError> {
        sqlx::query(
            "UPDATE payments SET refund_requested_at = NULL, updated_at = NOW() \
             WHERE id = $1 AND status = 'COMPLETED'",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        Ok(())
    }

    async fn soft_delete(
        &self,
        id: Uuid,
        allowed: &[PaymentStatus],
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE payments SET deleted_at = NOW(), updated_at = NOW() \
             WHERE id = $1 AND status = ANY($2) AND deleted_at IS NULL",
        )
        .bind(id)
        .bind(status_strings(allowed))
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(status: PaymentStatus) -> PaymentRecord {
        let now = Utc::now();
        PaymentRecord {
            id: Uuid::new_v4(),
            gateway_intent_id: Some("pi_1".to_string()),
            previous_intent_ids: Vec::new(),
            gateway_charge_id: None,
            payer_id: Uuid::new_v4(),
            payee_id: Uuid::new_v4(),
            contract_id: Some(Uuid::new_v4()),
            milestone_id: None,
            amount: BigDecimal::from(1000),
            platform_fee: BigDecimal::from(100),
            platform_fee_percentage: BigDecimal::from(10),
            total_charge: BigDecimal::from(1100),
            gateway_fee: None,
            refunded_amount: None,
            currency: "USD".to_string(),
            status,
            retry_count: 0,
            error_message: None,
            created_at: now,
            updated_at: now,
            processing_at: None,
            completed_at: None,
            failed_at: None,
            refunded_at: None,
            refund_requested_at: None,
            deleted_at: None,
        }
    }

    #[test]
    fn failure_increments_retry_count() {
        let failed = record(PaymentStatus::Pending).with_change(
            &StatusChange::Failed {
                error: "card declined".to_string(),
            },
            Utc::now(),
        );
        assert_eq!(failed.status, PaymentStatus::Failed);
        assert_eq!(failed.retry_count, 1);
        assert_eq!(failed.error_message.as_deref(), Some("card declined"));
    }

    #[test]
    fn retry_swaps_intent_and_clears_error() {
        let mut failed = record(PaymentStatus::Failed);
        failed.error_message = Some("declined".to_string());
        let retried = failed.with_change(
            &StatusChange::Retried {
                intent_id: "pi_2".to_string(),
            },
            Utc::now(),
        );
        assert_eq!(retried.status, PaymentStatus::Pending);
        assert_eq!(retried.gateway_intent_id.as_deref(), Some("pi_2"));
        assert_eq!(retried.previous_intent_ids, vec!["pi_1".to_string()]);
        assert!(retried.error_message.is_none());
        assert!(!retried.is_current_intent("pi_1"));
        assert!(retried.is_current_intent("pi_2"));
    }

    #[test]
    fn refund_claim_expires() {
        let now = Utc::now();
        let mut completed = record(PaymentStatus::Completed);
        assert!(completed.refund_claimable(now));

        completed.refund_requested_at = Some(now);
        assert!(!completed.refund_claimable(now - chrono::Duration::minutes(15)));
        assert!(completed.refund_claimable(now + chrono::Duration::seconds(1)));

        assert!(!record(PaymentStatus::Failed).refund_claimable(now));
    }

    #[test]
    fn only_contract_level_payments_activate() {
        let contract_level = record(PaymentStatus::Pending);
        assert!(contract_level.activates_contract().is_some());

        let mut milestone = record(PaymentStatus::Pending);
        milestone.milestone_id = Some(Uuid::new_v4());
        assert!(milestone.activates_contract().is_none());
    }
}
