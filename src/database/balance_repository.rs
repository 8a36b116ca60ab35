use crate::database::error::DatabaseError;
use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool, Postgres};
use uuid::Uuid;

/// Spendable-balance projection for one user.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, PartialEq)]
pub struct UserBalance {
    pub user_id: Uuid,
    pub available_balance: BigDecimal,
    pub pending_balance: BigDecimal,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait BalanceStore: Send + Sync {
    /// Adds `delta` (negative for a debit) to the user's pending balance as a
    /// single atomic increment. A missing user is an error.
    async fn adjust_pending_balance(
        &self,
        user_id: Uuid,
        delta: &BigDecimal,
    ) -> Result<UserBalance, DatabaseError>;

    async fn get(&self, user_id: Uuid) -> Result<Option<UserBalance>, DatabaseError>;
}

pub(crate) async fn adjust_pending_balance_with<'e, E>(
    executor: E,
    user_id: Uuid,
    delta: &BigDecimal,
) -> Result<UserBalance, DatabaseError>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    sqlx::query_as::<_, UserBalance>(
        "UPDATE user_balances \
         SET pending_balance = pending_balance + $2, updated_at = NOW() \
         WHERE user_id = $1 \
         RETURNING user_id, available_balance, pending_balance, updated_at",
    )
    .bind(user_id)
    .bind(delta)
    .fetch_optional(executor)
    .await
    .map_err(DatabaseError::from_sqlx)?
    .ok_or_else(|| DatabaseError::not_found("user balance", user_id))
}

#[derive(Clone)]
pub struct PgBalanceRepository {
    pool: PgPool,
}

impl PgBalanceRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BalanceStore for PgBalanceRepository {
    async fn adjust_pending_balance(
        &self,
        user_id: Uuid,
        delta: &BigDecimal,
    ) -> Result<UserBalance, DatabaseError> {
        adjust_pending_balance_with(&self.pool, user_id, delta).await
    }

    async fn get(&self, user_id: Uuid) -> Result<Option<UserBalance>, DatabaseError> {
        sqlx::query_as::<_, UserBalance>(
            "SELECT user_id, available_balance, pending_balance, updated_at \
             FROM user_balances WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }
}
