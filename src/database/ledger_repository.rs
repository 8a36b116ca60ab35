//! Append-only ledger of money movements.
//!
//! Rows are inserted once. The only permitted update is settling a `pending`
//! entry: its status and gateway reference may change, its amounts never do.

use crate::database::error::DatabaseError;
use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool, Postgres, QueryBuilder};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LedgerEntryType {
    Payment,
    Refund,
    Withdrawal,
    Fee,
    /// Platform fee handed back to the payer on a refund
    FeeReversal,
    Bonus,
}

impl LedgerEntryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerEntryType::Payment => "payment",
            LedgerEntryType::Refund => "refund",
            LedgerEntryType::Withdrawal => "withdrawal",
            LedgerEntryType::Fee => "fee",
            LedgerEntryType::FeeReversal => "fee_reversal",
            LedgerEntryType::Bonus => "bonus",
        }
    }
}

impl FromStr for LedgerEntryType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "payment" => Ok(LedgerEntryType::Payment),
            "refund" => Ok(LedgerEntryType::Refund),
            "withdrawal" => Ok(LedgerEntryType::Withdrawal),
            "fee" => Ok(LedgerEntryType::Fee),
            "fee_reversal" => Ok(LedgerEntryType::FeeReversal),
            "bonus" => Ok(LedgerEntryType::Bonus),
            other => Err(format!("unknown ledger entry type: {}", other)),
        }
    }
}

impl fmt::Display for LedgerEntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LedgerStatus {
    Pending,
    Completed,
    Failed,
    Cancelled,
}

impl LedgerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerStatus::Pending => "pending",
            LedgerStatus::Completed => "completed",
            LedgerStatus::Failed => "failed",
            LedgerStatus::Cancelled => "cancelled",
        }
    }

    /// Anything but `pending` is final.
    pub fn is_settled(&self) -> bool {
        !matches!(self, LedgerStatus::Pending)
    }
}

impl FromStr for LedgerStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(LedgerStatus::Pending),
            "completed" => Ok(LedgerStatus::Completed),
            "failed" => Ok(LedgerStatus::Failed),
            "cancelled" => Ok(LedgerStatus::Cancelled),
            other => Err(format!("unknown ledger status: {}", other)),
        }
    }
}

impl fmt::Display for LedgerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Business object a ledger entry traces back to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RelatedType {
    Contract,
    Milestone,
    Withdrawal,
    Dispute,
    Payment,
}

impl RelatedType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelatedType::Contract => "contract",
            RelatedType::Milestone => "milestone",
            RelatedType::Withdrawal => "withdrawal",
            RelatedType::Dispute => "dispute",
            RelatedType::Payment => "payment",
        }
    }
}

impl FromStr for RelatedType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "contract" => Ok(RelatedType::Contract),
            "milestone" => Ok(RelatedType::Milestone),
            "withdrawal" => Ok(RelatedType::Withdrawal),
            "dispute" => Ok(RelatedType::Dispute),
            "payment" => Ok(RelatedType::Payment),
            other => Err(format!("unknown related type: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub entry_type: LedgerEntryType,
    /// Absent for platform-credited entries such as bonuses
    pub from_user: Option<Uuid>,
    /// Absent for entries that pay the platform itself (fees)
    pub to_user: Option<Uuid>,
    pub amount: BigDecimal,
    pub fee: BigDecimal,
    pub net_amount: BigDecimal,
    pub currency: String,
    pub related_id: Option<Uuid>,
    pub related_type: Option<RelatedType>,
    pub payment_id: Option<Uuid>,
    pub gateway_reference: Option<String>,
    pub status: LedgerStatus,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewLedgerEntry {
    pub entry_type: LedgerEntryType,
    pub from_user: Option<Uuid>,
    pub to_user: Option<Uuid>,
    pub amount: BigDecimal,
    pub fee: BigDecimal,
    pub net_amount: BigDecimal,
    pub currency: String,
    pub related_id: Option<Uuid>,
    pub related_type: Option<RelatedType>,
    pub payment_id: Option<Uuid>,
    pub gateway_reference: Option<String>,
    pub status: LedgerStatus,
    pub description: Option<String>,
}

impl NewLedgerEntry {
    /// Entry with no fee component: `net_amount == amount`.
    pub fn simple(
        entry_type: LedgerEntryType,
        from_user: Option<Uuid>,
        to_user: Option<Uuid>,
        amount: BigDecimal,
        currency: &str,
        status: LedgerStatus,
    ) -> Self {
        Self {
            entry_type,
            from_user,
            to_user,
            net_amount: amount.clone(),
            amount,
            fee: BigDecimal::from(0),
            currency: currency.to_string(),
            related_id: None,
            related_type: None,
            payment_id: None,
            gateway_reference: None,
            status,
            description: None,
        }
    }

    pub fn related(mut self, related_id: Option<Uuid>, related_type: RelatedType) -> Self {
        if related_id.is_some() {
            self.related_id = related_id;
            self.related_type = Some(related_type);
        }
        self
    }

    pub fn for_payment(mut self, payment_id: Uuid) -> Self {
        self.payment_id = Some(payment_id);
        self
    }

    pub fn gateway_reference(mut self, reference: Option<String>) -> Self {
        self.gateway_reference = reference;
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn into_entry(self, now: DateTime<Utc>) -> LedgerEntry {
        let settled_at = self.status.is_settled().then_some(now);
        LedgerEntry {
            id: Uuid::new_v4(),
            entry_type: self.entry_type,
            from_user: self.from_user,
            to_user: self.to_user,
            amount: self.amount,
            fee: self.fee,
            net_amount: self.net_amount,
            currency: self.currency,
            related_id: self.related_id,
            related_type: self.related_type,
            payment_id: self.payment_id,
            gateway_reference: self.gateway_reference,
            status: self.status,
            description: self.description,
            created_at: now,
            settled_at,
        }
    }
}

/// Filters for ledger queries. Results are always newest first.
#[derive(Debug, Clone, Default)]
pub struct LedgerQuery {
    /// Matches entries where the user is sender or receiver
    pub user_id: Option<Uuid>,
    pub entry_type: Option<LedgerEntryType>,
    pub status: Option<LedgerStatus>,
    pub related_id: Option<Uuid>,
    pub related_type: Option<RelatedType>,
    pub from: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl LedgerQuery {
    pub fn matches(&self, entry: &LedgerEntry) -> bool {
        if let Some(user) = self.user_id {
            if entry.from_user != Some(user) && entry.to_user != Some(user) {
                return false;
            }
        }
        if self.entry_type.is_some_and(|t| t != entry.entry_type) {
            return false;
        }
        if self.status.is_some_and(|s| s != entry.status) {
            return false;
        }
        if self.related_id.is_some() && self.related_id != entry.related_id {
            return false;
        }
        if self.related_type.is_some() && self.related_type != entry.related_type {
            return false;
        }
        if self.from.is_some_and(|from| entry.created_at < from) {
            return false;
        }
        if self.until.is_some_and(|until| entry.created_at >= until) {
            return false;
        }
        true
    }
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn insert(&self, entry: NewLedgerEntry) -> Result<LedgerEntry, DatabaseError>;

    /// Settles a `pending` entry. Returns `None` if the entry is already settled.
    async fn settle(
        &self,
        id: Uuid,
        status: LedgerStatus,
        gateway_reference: Option<String>,
    ) -> Result<Option<LedgerEntry>, DatabaseError>;

    /// Settles the pending `payment` entries recorded for a payment attempt.
    async fn settle_payment_entries(
        &self,
        payment_id: Uuid,
        status: LedgerStatus,
        gateway_reference: Option<String>,
    ) -> Result<Vec<LedgerEntry>, DatabaseError>;

    /// Settles pending entries of `entry_type` carrying the given gateway reference.
    async fn settle_by_gateway_reference(
        &self,
        gateway_reference: &str,
        entry_type: LedgerEntryType,
        status: LedgerStatus,
    ) -> Result<Vec<LedgerEntry>, DatabaseError>;

    async fn find_by_payment(&self, payment_id: Uuid) -> Result<Vec<LedgerEntry>, DatabaseError>;

    async fn query(&self, query: &LedgerQuery) -> Result<Vec<LedgerEntry>, DatabaseError>;
}

// ---------------------------------------------------------------------------
// Postgres
// ---------------------------------------------------------------------------

const LEDGER_COLUMNS: &str = "id, entry_type, from_user, to_user, amount, fee, net_amount, \
     currency, related_id, related_type, payment_id, gateway_reference, status, description, \
     created_at, settled_at";

#[derive(Debug, FromRow)]
struct LedgerRow {
    id: Uuid,
    entry_type: String,
    from_user: Option<Uuid>,
    to_user: Option<Uuid>,
    amount: BigDecimal,
    fee: BigDecimal,
    net_amount: BigDecimal,
    currency: String,
    related_id: Option<Uuid>,
    related_type: Option<String>,
    payment_id: Option<Uuid>,
    gateway_reference: Option<String>,
    status: String,
    description: Option<String>,
    created_at: DateTime<Utc>,
    settled_at: Option<DateTime<Utc>>,
}

impl TryFrom<LedgerRow> for LedgerEntry {
    type Error = DatabaseError;

    fn try_from(row: LedgerRow) -> Result<Self, Self::Error> {
        Ok(LedgerEntry {
            id: row.id,
            entry_type: row.entry_type.parse().map_err(DatabaseError::query)?,
            from_user: row.from_user,
            to_user: row.to_user,
            amount: row.amount,
            fee: row.fee,
            net_amount: row.net_amount,
            currency: row.currency,
            related_id: row.related_id,
            related_type: row
                .related_type
                .map(|t| t.parse::<RelatedType>())
                .transpose()
                .map_err(DatabaseError::query)?,
            payment_id: row.payment_id,
            gateway_reference: row.gateway_reference,
            status: row.status.parse().map_err(DatabaseError::query)?,
            description: row.description,
            created_at: row.created_at,
            settled_at: row.settled_at,
        })
    }
}

fn into_entries(rows: Vec<LedgerRow>) -> Result<Vec<LedgerEntry>, DatabaseError> {
    rows.into_iter().map(LedgerEntry::try_from).collect()
}

pub(crate) async fn insert_with<'e, E>(
    executor: E,
    entry: &NewLedgerEntry,
) -> Result<LedgerEntry, DatabaseError>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    let sql = format!(
        "INSERT INTO ledger_entries \
         (id, entry_type, from_user, to_user, amount, fee, net_amount, currency, related_id, \
          related_type, payment_id, gateway_reference, status, description, settled_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, \
                 CASE WHEN $13 = 'pending' THEN NULL ELSE NOW() END) \
         RETURNING {LEDGER_COLUMNS}"
    );
    let row = sqlx::query_as::<_, LedgerRow>(&sql)
        .bind(Uuid::new_v4())
        .bind(entry.entry_type.as_str())
        .bind(entry.from_user)
        .bind(entry.to_user)
        .bind(&entry.amount)
        .bind(&entry.fee)
        .bind(&entry.net_amount)
        .bind(&entry.currency)
        .bind(entry.related_id)
        .bind(entry.related_type.map(|t| t.as_str()))
        .bind(entry.payment_id)
        .bind(&entry.gateway_reference)
        .bind(entry.status.as_str())
        .bind(&entry.description)
        .fetch_one(executor)
        .await
        .map_err(DatabaseError::from_sqlx)?;
    LedgerEntry::try_from(row)
}

pub(crate) async fn settle_payment_entries_with<'e, E>(
    executor: E,
    payment_id: Uuid,
    status: LedgerStatus,
    gateway_reference: Option<String>,
) -> Result<Vec<LedgerEntry>, DatabaseError>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    let sql = format!(
        "UPDATE ledger_entries \
         SET status = $2, gateway_reference = COALESCE($3, gateway_reference), settled_at = NOW() \
         WHERE payment_id = $1 AND entry_type = 'payment' AND status = 'pending' \
         RETURNING {LEDGER_COLUMNS}"
    );
    let rows = sqlx::query_as::<_, LedgerRow>(&sql)
        .bind(payment_id)
        .bind(status.as_str())
        .bind(gateway_reference)
        .fetch_all(executor)
        .await
        .map_err(DatabaseError::from_sqlx)?;
    into_entries(rows)
}

#[derive(Clone)]
pub struct PgLedgerRepository {
    pool: PgPool,
}

impl PgLedgerRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LedgerStore for PgLedgerRepository {
    async fn insert(&self, entry: NewLedgerEntry) -> Result<LedgerEntry, DatabaseError> {
        insert_with(&self.pool, &entry).await
    }

    async fn settle(
        &self,
        id: Uuid,
        status: LedgerStatus,
        gateway_reference: Option<String>,
    ) -> Result<Option<LedgerEntry>, DatabaseError> {
        let sql = format!(
            "UPDATE ledger_entries \
             SET status = $2, gateway_reference = COALESCE($3, gateway_reference), settled_at = NOW() \
             WHERE id = $1 AND status = 'pending' \
             RETURNING {LEDGER_COLUMNS}"
        );
        sqlx::query_as::<_, LedgerRow>(&sql)
            .bind(id)
            .bind(status.as_str())
            .bind(gateway_reference)
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?
            .map(LedgerEntry::try_from)
            .transpose()
    }

    async fn settle_payment_entries(
        &self,
        payment_id: Uuid,
        status: LedgerStatus,
        gateway_reference: Option<String>,
    ) -> Result<Vec<LedgerEntry>, DatabaseError> {
        settle_payment_entries_with(&self.pool, payment_id, status, gateway_reference).await
    }

    async fn settle_by_gateway_reference(
        &self,
        gateway_reference: &str,
        entry_type: LedgerEntryType,
        status: LedgerStatus,
    ) -> Result<Vec<LedgerEntry>, DatabaseError> {
        let sql = format!(
            "UPDATE ledger_entries \
             SET status = $2, settled_at = NOW() \
             WHERE gateway_reference = $1 AND entry_type = $3 AND status = 'pending' \
             RETURNING {LEDGER_COLUMNS}"
        );
        let rows = sqlx::query_as::<_, LedgerRow>(&sql)
            .bind(gateway_reference)
            .bind(status.as_str())
            .bind(entry_type.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        into_entries(rows)
    }

    async fn find_by_payment(&self, payment_id: Uuid) -> Result<Vec<LedgerEntry>, DatabaseError> {
        let sql = format!(
            "SELECT {LEDGER_COLUMNS} FROM ledger_entries \
             WHERE payment_id = $1 \
             ORDER BY created_at ASC"
        );
        let rows = sqlx::query_as::<_, LedgerRow>(&sql)
            .bind(payment_id)
            .fetch_all(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        into_entries(rows)
    }

    async fn query(&self, query: &LedgerQuery) -> Result<Vec<LedgerEntry>, DatabaseError> {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "SELECT {LEDGER_COLUMNS} FROM ledger_entries WHERE TRUE"
        ));

        if let Some(user) = query.user_id {
            builder
                .push(" AND (from_user = ")
                .push_bind(user)
                .push(" OR to_user = ")
                .push_bind(user)
                .push(")");
        }
        if let Some(entry_type) = query.entry_type {
            builder.push(" AND entry_type = ").push_bind(entry_type.as_str());
        }
        if let Some(status) = query.status {
            builder.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(related_id) = query.related_id {
            builder.push(" AND related_id = ").push_bind(related_id);
        }
        if let Some(related_type) = query.related_type {
            builder
                .push(" AND related_type = ")
                .push_bind(related_type.as_str());
        }
        if let Some(from) = query.from {
            builder.push(" AND created_at >= ").push_bind(from);
        }
        if let Some(until) = query.until {
            builder.push(" AND created_at < ").push_bind(until);
        }

        builder.push(" ORDER BY created_at DESC");
        if let Some(limit) = query.limit {
            builder.push(" LIMIT ").push_bind(limit);
        }
        if let Some(offset) = query.offset {
            builder.push(" OFFSET ").push_bind(offset);
        }

        let rows = builder
            .build_query_as::<LedgerRow>()
            .fetch_all(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        into_entries(rows)
    }
}
