//! Ledger Service
//!
//! Read-side reporting over the append-only ledger plus the bookkeeping
//! entries that do not come from a payment completion (withdrawals, bonuses).

use crate::database::error::DatabaseError;
use crate::database::ledger_repository::{
    LedgerEntry, LedgerEntryType, LedgerQuery, LedgerStatus, LedgerStore, NewLedgerEntry,
    RelatedType,
};
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Invalid amount: {0}")]
    InvalidAmount(BigDecimal),
}

pub type LedgerResult<T> = Result<T, LedgerError>;

/// Completed money movements for one user since a point in time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserLedgerSummary {
    pub user_id: Uuid,
    pub since: Option<DateTime<Utc>>,
    /// Net amounts received as payee
    pub earned: BigDecimal,
    /// Total charges paid as payer, fees included
    pub spent: BigDecimal,
    pub fees_paid: BigDecimal,
    pub refunds_received: BigDecimal,
    pub refunds_issued: BigDecimal,
    pub withdrawn: BigDecimal,
    pub bonuses: BigDecimal,
}

impl UserLedgerSummary {
    fn empty(user_id: Uuid, since: Option<DateTime<Utc>>) -> Self {
        let zero = BigDecimal::from(0);
        Self {
            user_id,
            since,
            earned: zero.clone(),
            spent: zero.clone(),
            fees_paid: zero.clone(),
            refunds_received: zero.clone(),
            refunds_issued: zero.clone(),
            withdrawn: zero.clone(),
            bonuses: zero,
        }
    }

    fn absorb(&mut self, entry: &LedgerEntry) {
        let user = Some(self.user_id);
        match entry.entry_type {
            LedgerEntryType::Payment => {
                if entry.to_user == user {
                    self.earned += &entry.net_amount;
                }
                if entry.from_user == user {
                    self.spent += &entry.amount;
                }
            }
            LedgerEntryType::Fee => {
                if entry.from_user == user {
                    self.fees_paid += &entry.amount;
                }
            }
            LedgerEntryType::Refund => {
                if entry.to_user == user {
                    self.refunds_received += &entry.amount;
                }
                if entry.from_user == user {
                    self.refunds_issued += &entry.amount;
                }
            }
            LedgerEntryType::FeeReversal => {
                if entry.to_user == user {
                    self.refunds_received += &entry.amount;
                }
            }
            LedgerEntryType::Withdrawal => {
                if entry.from_user == user {
                    self.withdrawn += &entry.amount;
                }
            }
            LedgerEntryType::Bonus => {
                if entry.to_user == user {
                    self.bonuses += &entry.amount;
                }
            }
        }
    }
}

/// Completed fee income in a window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlatformRevenue {
    pub since: DateTime<Utc>,
    pub until: DateTime<Utc>,
    /// Fees billed to payers
    pub platform_fees: BigDecimal,
    /// Processing fees charged by the gateway
    pub gateway_fees: BigDecimal,
    /// Platform fees returned to payers by refunds
    pub fee_reversals: BigDecimal,
    pub net_revenue: BigDecimal,
    pub fee_entries: usize,
}

#[derive(Clone)]
pub struct LedgerService {
    ledger: Arc<dyn LedgerStore>,
}

impl LedgerService {
    pub fn new(ledger: Arc<dyn LedgerStore>) -> Self {
        Self { ledger }
    }

    /// Entries where the user is sender or receiver, newest first.
    pub async fn entries_for_user(
        &self,
        user_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> LedgerResult<Vec<LedgerEntry>> {
        let query = LedgerQuery {
            user_id: Some(user_id),
            limit: Some(limit),
            offset: Some(offset),
            ..Default::default()
        };
        Ok(self.ledger.query(&query).await?)
    }

    pub async fn entries_for_related(
        &self,
        related_id: Uuid,
        related_type: RelatedType,
    ) -> LedgerResult<Vec<LedgerEntry>> {
        let query = LedgerQuery {
            related_id: Some(related_id),
            related_type: Some(related_type),
            ..Default::default()
        };
        Ok(self.ledger.query(&query).await?)
    }

    pub async fn user_summary(
        &self,
        user_id: Uuid,
        since: Option<DateTime<Utc>>,
    ) -> LedgerResult<UserLedgerSummary> {
        let query = LedgerQuery {
            user_id: Some(user_id),
            status: Some(LedgerStatus::Completed),
            from: since,
            ..Default::default()
        };
        let entries = self.ledger.query(&query).await?;

        let mut summary = UserLedgerSummary::empty(user_id, since);
        for entry in &entries {
            summary.absorb(entry);
        }
        Ok(summary)
    }

    pub async fn platform_revenue(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> LedgerResult<PlatformRevenue> {
        let window = |entry_type| LedgerQuery {
            entry_type: Some(entry_type),
            status: Some(LedgerStatus::Completed),
            from: Some(since),
            until: Some(until),
            ..Default::default()
        };
        let entries = self.ledger.query(&window(LedgerEntryType::Fee)).await?;
        let reversals = self
            .ledger
            .query(&window(LedgerEntryType::FeeReversal))
            .await?;

        let mut platform_fees = BigDecimal::from(0);
        let mut gateway_fees = BigDecimal::from(0);
        for entry in &entries {
            // Platform fees are billed to a payer; gateway fees have no sender.
            if entry.from_user.is_some() {
                platform_fees += &entry.amount;
            } else {
                gateway_fees += &entry.amount;
            }
        }
        let fee_reversals = reversals
            .iter()
            .fold(BigDecimal::from(0), |acc, entry| acc + &entry.amount);

        Ok(PlatformRevenue {
            since,
            until,
            net_revenue: &platform_fees - &gateway_fees - &fee_reversals,
            platform_fees,
            gateway_fees,
            fee_reversals,
            fee_entries: entries.len() + reversals.len(),
        })
    }

    /// Books a payout as `pending` until the gateway's transfer webhook settles it.
    pub async fn record_pending_withdrawal(
        &self,
        user_id: Uuid,
        amount: BigDecimal,
        currency: &str,
        gateway_reference: String,
        withdrawal_id: Option<Uuid>,
    ) -> LedgerResult<LedgerEntry> {
        if amount <= BigDecimal::from(0) {
            return Err(LedgerError::InvalidAmount(amount));
        }

        let entry = self
            .ledger
            .insert(
                NewLedgerEntry::simple(
                    LedgerEntryType::Withdrawal,
                    Some(user_id),
                    None,
                    amount,
                    currency,
                    LedgerStatus::Pending,
                )
                .related(withdrawal_id, RelatedType::Withdrawal)
                .gateway_reference(Some(gateway_reference))
                .description("payout"),
            )
            .await?;

        info!(
            entry_id = %entry.id,
            user_id = %user_id,
            amount = %entry.amount,
            "Pending withdrawal recorded"
        );
        Ok(entry)
    }

    /// Settles the pending entries behind a gateway transfer or payout.
    pub async fn settle_withdrawal(
        &self,
        gateway_reference: &str,
        status: LedgerStatus,
    ) -> LedgerResult<Vec<LedgerEntry>> {
        let settled = self
            .ledger
            .settle_by_gateway_reference(gateway_reference, LedgerEntryType::Withdrawal, status)
            .await?;
        info!(
            gateway_reference = %gateway_reference,
            status = %status,
            settled = settled.len(),
            "Withdrawal ledger entries settled"
        );
        Ok(settled)
    }

    pub async fn record_bonus(
        &self,
        user_id: Uuid,
        amount: BigDecimal,
        currency: &str,
        description: &str,
    ) -> LedgerResult<LedgerEntry> {
        if amount <= BigDecimal::from(0) {
            return Err(LedgerError::InvalidAmount(amount));
        }

        let entry = self
            .ledger
            .insert(
                NewLedgerEntry::simple(
                    LedgerEntryType::Bonus,
                    None,
                    Some(user_id),
                    amount,
                    currency,
                    LedgerStatus::Completed,
                )
                .description(description),
            )
            .await?;
        info!(entry_id = %entry.id, user_id = %user_id, "Bonus recorded");
        Ok(entry)
    }
}
