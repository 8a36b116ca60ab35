//! Read access to contracts and milestones, plus the single write this
//! service owns: activating a contract once its payment settles.

use crate::database::error::DatabaseError;
use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool, Postgres};
use uuid::Uuid;

pub const CONTRACT_STATUS_ACTIVE: &str = "active";

#[derive(Debug, Clone, FromRow, Serialize, Deserialize, PartialEq)]
pub struct ContractTerms {
    pub id: Uuid,
    /// Designated payer
    pub client_id: Uuid,
    /// Designated payee
    pub freelancer_id: Uuid,
    pub amount: BigDecimal,
    pub platform_fee_percentage: BigDecimal,
    pub currency: String,
    pub status: String,
    pub total_paid: Option<BigDecimal>,
    pub activated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize, PartialEq)]
pub struct MilestoneTerms {
    pub id: Uuid,
    pub contract_id: Uuid,
    pub title: String,
    pub amount: BigDecimal,
    pub status: String,
}

#[async_trait]
pub trait ContractDirectory: Send + Sync {
    async fn find_contract(&self, id: Uuid) -> Result<Option<ContractTerms>, DatabaseError>;

    async fn find_milestone(&self, id: Uuid) -> Result<Option<MilestoneTerms>, DatabaseError>;

    /// Marks the contract active and records what was paid for it.
    async fn activate(&self, contract_id: Uuid, total_paid: &BigDecimal)
        -> Result<(), DatabaseError>;
}

pub(crate) async fn activate_with<'e, E>(
    executor: E,
    contract_id: Uuid,
    total_paid: &BigDecimal,
) -> Result<(), DatabaseError>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    let result = sqlx::query(
        "UPDATE contracts \
         SET status = $2, total_paid = $3, activated_at = COALESCE(activated_at, NOW()) \
         WHERE id = $1",
    )
    .bind(contract_id)
    .bind(CONTRACT_STATUS_ACTIVE)
    .bind(total_paid)
    .execute(executor)
    .await
    .map_err(DatabaseError::from_sqlx)?;

    if result.rows_affected() == 0 {
        return Err(DatabaseError::not_found("contract", contract_id));
    }
    Ok(())
}

#[derive(Clone)]
pub struct PgContractRepository {
    pool: PgPool,
}

impl PgContractRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ContractDirectory for PgContractRepository {
    async fn find_contract(&self, id: Uuid) -> Result<Option<ContractTerms>, DatabaseError> {
        sqlx::query_as::<_, ContractTerms>(
            "SELECT id, client_id, freelancer_id, amount, platform_fee_percentage, currency, \
                    status, total_paid, activated_at \
             FROM contracts WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn find_milestone(&self, id: Uuid) -> Result<Option<MilestoneTerms>, DatabaseError> {
        sqlx::query_as::<_, MilestoneTerms>(
            "SELECT id, contract_id, title, amount, status FROM milestones WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn activate(
        &self,
        contract_id: Uuid,
        total_paid: &BigDecimal,
    ) -> Result<(), DatabaseError> {
        activate_with(&self.pool, contract_id, total_paid).await
    }
}
