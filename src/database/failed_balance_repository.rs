//! Durable parking lot for balance adjustments that could not be applied.

use crate::database::balance_repository::adjust_pending_balance_with;
use crate::database::error::DatabaseError;
use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool, Postgres};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// A `retrying` row not touched for this long is assumed abandoned by a
/// crashed worker and may be claimed again.
pub const STALE_CLAIM_AFTER_MINUTES: i64 = 60;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FailedUpdateStatus {
    Pending,
    Retrying,
    Completed,
    /// Retry budget exhausted; needs manual reconciliation
    Failed,
}

impl FailedUpdateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailedUpdateStatus::Pending => "pending",
            FailedUpdateStatus::Retrying => "retrying",
            FailedUpdateStatus::Completed => "completed",
            FailedUpdateStatus::Failed => "failed",
        }
    }
}

impl FromStr for FailedUpdateStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(FailedUpdateStatus::Pending),
            "retrying" => Ok(FailedUpdateStatus::Retrying),
            "completed" => Ok(FailedUpdateStatus::Completed),
            "failed" => Ok(FailedUpdateStatus::Failed),
            other => Err(format!("unknown failed update status: {}", other)),
        }
    }
}

impl fmt::Display for FailedUpdateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailedBalanceUpdate {
    pub id: Uuid,
    pub payment_id: Uuid,
    pub payee_id: Uuid,
    /// Positive for a credit, negative for a refund clawback
    pub amount: BigDecimal,
    pub status: FailedUpdateStatus,
    pub retry_count: i32,
    pub last_retry_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl FailedBalanceUpdate {
    /// Whether a retry worker may take this row now.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            FailedUpdateStatus::Pending => true,
            FailedUpdateStatus::Retrying => self
                .last_retry_at
                .map_or(true, |at| at < now - Duration::minutes(STALE_CLAIM_AFTER_MINUTES)),
            _ => false,
        }
    }
}

/// Result of replaying a claimed row inside one transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtomicReplay {
    /// The store cannot adjust balances itself
    Unsupported,
    Applied,
    /// Another worker reclaimed the row; nothing was applied
    ClaimLost,
}

#[derive(Debug, Clone)]
pub struct NewFailedBalanceUpdate {
    pub payment_id: Uuid,
    pub payee_id: Uuid,
    pub amount: BigDecimal,
    pub error: String,
}

#[async_trait]
pub trait FailedBalanceStore: Send + Sync {
    async fn insert(
        &self,
        update: NewFailedBalanceUpdate,
    ) -> Result<FailedBalanceUpdate, DatabaseError>;

    /// Claimable rows, oldest first.
    async fn list_claimable(&self, limit: i64) -> Result<Vec<FailedBalanceUpdate>, DatabaseError>;

    /// Moves a claimable row to `retrying`. Returns `None` if another worker holds it.
    async fn claim(&self, id: Uuid) -> Result<Option<FailedBalanceUpdate>, DatabaseError>;

    /// Completes a row still held by this claim (same `last_retry_at`).
    /// Returns `false` when the claim was lost.
    async fn mark_completed(&self, claimed: &FailedBalanceUpdate) -> Result<bool, DatabaseError>;

    /// Increments the retry count and returns the row to `pending`, or marks it
    /// `failed` once the count reaches `max_attempts`. Also reopens a row this
    /// claim marked completed before its adjustment failed. `None` when the
    /// claim was lost.
    async fn record_attempt_failure(
        &self,
        claimed: &FailedBalanceUpdate,
        error: &str,
        max_attempts: i32,
    ) -> Result<Option<FailedBalanceUpdate>, DatabaseError>;

    /// Marks the claimed row completed and applies its adjustment in a single
    /// transaction, for stores sharing a database with the balances.
    async fn replay_atomically(
        &self,
        _claimed: &FailedBalanceUpdate,
    ) -> Result<AtomicReplay, DatabaseError> {
        Ok(AtomicReplay::Unsupported)
    }

    async fn count_by_status(&self, status: FailedUpdateStatus) -> Result<i64, DatabaseError>;

    async fn find_by_payment(
        &self,
        payment_id: Uuid,
    ) -> Result<Vec<FailedBalanceUpdate>, DatabaseError>;
}

// ---------------------------------------------------------------------------
// Postgres
// ---------------------------------------------------------------------------

const FAILED_UPDATE_COLUMNS: &str = "id, payment_id, payee_id, amount, status, retry_count, \
     last_retry_at, error, created_at, resolved_at";

#[derive(Debug, FromRow)]
struct FailedUpdateRow {
    id: Uuid,
    payment_id: Uuid,
    payee_id: Uuid,
    amount: BigDecimal,
    status: String,
    retry_count: i32,
    last_retry_at: Option<DateTime<Utc>>,
    error: Option<String>,
    created_at: DateTime<Utc>,
    resolved_at: Option<DateTime<Utc>>,
}

impl TryFrom<FailedUpdateRow> for FailedBalanceUpdate {
    type Error = DatabaseError;

    fn try_from(row: FailedUpdateRow) -> Result<Self, Self::Error> {
        Ok(FailedBalanceUpdate {
            id: row.id,
            payment_id: row.payment_id,
            payee_id: row.payee_id,
            amount: row.amount,
            status: row.status.parse().map_err(DatabaseError::query)?,
            retry_count: row.retry_count,
            last_retry_at: row.last_retry_at,
            error: row.error,
            created_at: row.created_at,
            resolved_at: row.resolved_at,
        })
    }
}

pub(crate) async fn insert_with<'e, E>(
    executor: E,
    update: &NewFailedBalanceUpdate,
) -> Result<FailedBalanceUpdate, DatabaseError>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    let sql = format!(
        "INSERT INTO failed_balance_updates (id, payment_id, payee_id, amount, status, retry_count, error) \
         VALUES ($1, $2, $3, $4, 'pending', 0, $5) \
         RETURNING {FAILED_UPDATE_COLUMNS}"
    );
    let row = sqlx::query_as::<_, FailedUpdateRow>(&sql)
        .bind(Uuid::new_v4())
        .bind(update.payment_id)
        .bind(update.payee_id)
        .bind(&update.amount)
        .bind(&update.error)
        .fetch_one(executor)
        .await
        .map_err(DatabaseError::from_sqlx)?;
    FailedBalanceUpdate::try_from(row)
}

async fn mark_completed_with<'e, E>(
    executor: E,
    claimed: &FailedBalanceUpdate,
) -> Result<bool, DatabaseError>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    let result = sqlx::query(
        "UPDATE failed_balance_updates \
         SET status = 'completed', resolved_at = NOW(), error = NULL \
         WHERE id = $1 AND status = 'retrying' AND last_retry_at IS NOT DISTINCT FROM $2",
    )
    .bind(claimed.id)
    .bind(claimed.last_retry_at)
    .execute(executor)
    .await
    .map_err(DatabaseError::from_sqlx)?;
    Ok(result.rows_affected() > 0)
}

#[derive(Clone)]
pub struct PgFailedBalanceRepository {
    pool: PgPool,
}

impl PgFailedBalanceRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl FailedBalanceStore for PgFailedBalanceRepository {
    async fn insert(
        &self,
        update: NewFailedBalanceUpdate,
    ) -> Result<FailedBalanceUpdate, DatabaseError> {
        insert_with(&self.pool, &update).await
    }

    async fn list_claimable(&self, limit: i64) -> Result<Vec<FailedBalanceUpdate>, DatabaseError> {
        let sql = format!(
            "SELECT {FAILED_UPDATE_COLUMNS} FROM failed_balance_updates \
             WHERE status = 'pending' \
                OR (status = 'retrying' AND last_retry_at < NOW() - make_interval(mins => $2)) \
             ORDER BY created_at ASC \
             LIMIT $1"
        );
        let rows = sqlx::query_as::<_, FailedUpdateRow>(&sql)
            .bind(limit)
            .bind(STALE_CLAIM_AFTER_MINUTES as i32)
            .fetch_all(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        rows.into_iter().map(FailedBalanceUpdate::try_from).collect()
    }

    async fn claim(&self, id: Uuid) -> Result<Option<FailedBalanceUpdate>, DatabaseError> {
        let sql = format!(
            "UPDATE failed_balance_updates \
             SET status = 'retrying', last_retry_at = NOW() \
             WHERE id = $1 \
               AND (status = 'pending' \
                    OR (status = 'retrying' AND last_retry_at < NOW() - make_interval(mins => $2))) \
             RETURNING {FAILED_UPDATE_COLUMNS}"
        );
        sqlx::query_as::<_, FailedUpdateRow>(&sql)
            .bind(id)
            .bind(STALE_CLAIM_AFTER_MINUTES as i32)
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?
            .map(FailedBalanceUpdate::try_from)
            .transpose()
    }

    async fn mark_completed(&self, claimed: &FailedBalanceUpdate) -> Result<bool, DatabaseError> {
        mark_completed_with(&self.pool, claimed).await
    }

    async fn record_attempt_failure(
        &self,
        claimed: &FailedBalanceUpdate,
        error: &str,
        max_attempts: i32,
    ) -> Result<Option<FailedBalanceUpdate>, DatabaseError> {
        let sql = format!(
            "UPDATE failed_balance_updates \
             SET retry_count = retry_count + 1, \
                 error = $2, \
                 last_retry_at = NOW(), \
                 status = CASE WHEN retry_count + 1 >= $3 THEN 'failed' ELSE 'pending' END, \
                 resolved_at = CASE WHEN retry_count + 1 >= $3 THEN NOW() ELSE NULL END \
             WHERE id = $1 AND status IN ('retrying', 'completed') \
               AND last_retry_at IS NOT DISTINCT FROM $4 \
             RETURNING {FAILED_UPDATE_COLUMNS}"
        );
        sqlx::query_as::<_, FailedUpdateRow>(&sql)
            .bind(claimed.id)
            .bind(error)
            .bind(max_attempts)
            .bind(claimed.last_retry_at)
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?
            .map(FailedBalanceUpdate::try_from)
            .transpose()
    }

    async fn replay_atomically(
        &self,
        claimed: &FailedBalanceUpdate,
    ) -> Result<AtomicReplay, DatabaseError> {
        let mut tx = self.pool.begin().await.map_err(DatabaseError::from_sqlx)?;

        if !mark_completed_with(&mut *tx, claimed).await? {
            tx.rollback().await.map_err(DatabaseError::from_sqlx)?;
            return Ok(AtomicReplay::ClaimLost);
        }
        // Dropping the transaction on error rolls the completion back.
        adjust_pending_balance_with(&mut *tx, claimed.payee_id, &claimed.amount).await?;

        tx.commit().await.map_err(DatabaseError::from_sqlx)?;
        Ok(AtomicReplay::Applied)
    }

    async fn count_by_status(&self, status: FailedUpdateStatus) -> Result<i64, DatabaseError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM failed_balance_updates WHERE status = $1")
                .bind(status.as_str())
                .fetch_one(&self.pool)
                .await
                .map_err(DatabaseError::from_sqlx)?;
        Ok(count)
    }

    async fn find_by_payment(
        &self,
        payment_id: Uuid,
    ) -> Result<Vec<FailedBalanceUpdate>, DatabaseError> {
        let sql = format!(
            "SELECT {FAILED_UPDATE_COLUMNS} FROM failed_balance_updates \
             WHERE payment_id = $1 \
             ORDER BY created_at ASC"
        );
        let rows = sqlx::query_as::<_, FailedUpdateRow>(&sql)
            .bind(payment_id)
            .fetch_all(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        rows.into_iter().map(FailedBalanceUpdate::try_from).collect()
    }
}
