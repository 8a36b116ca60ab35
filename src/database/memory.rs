//! In-memory stores for tests and `SKIP_EXTERNALS` runs.
//!
//! Each store guards its map with a `tokio::sync::Mutex` so the conditional
//! writes keep the same check-and-set semantics as the Postgres queries.

use crate::database::balance_repository::{BalanceStore, UserBalance};
use crate::database::contract_repository::{
    ContractDirectory, ContractTerms, MilestoneTerms, CONTRACT_STATUS_ACTIVE,
};
use crate::database::error::{DatabaseError, DatabaseErrorKind};
use crate::database::failed_balance_repository::{
    FailedBalanceStore, FailedBalanceUpdate, FailedUpdateStatus, NewFailedBalanceUpdate,
};
use crate::database::ledger_repository::{
    LedgerEntry, LedgerEntryType, LedgerQuery, LedgerStatus, LedgerStore, NewLedgerEntry,
};
use crate::database::payment_repository::{
    NewPaymentRecord, PaymentRecord, PaymentStore, StatusTotals,
};
use crate::database::webhook_repository::{ProcessedWebhookEvent, WebhookEventStore};
use crate::payments::state::{check_transition, PaymentStatus, StatusChange};
use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Payments
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct InMemoryPaymentStore {
    records: Mutex<HashMap<Uuid, PaymentRecord>>,
}

impl InMemoryPaymentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Moves a record's last-touched time, used to age records past the sweep threshold.
    pub async fn set_updated_at(&self, id: Uuid, at: DateTime<Utc>) {
        if let Some(record) = self.records.lock().await.get_mut(&id) {
            record.updated_at = at;
            record.created_at = record.created_at.min(at);
        }
    }

    /// Overwrites a record as-is, bypassing the state machine.
    pub async fn put(&self, record: PaymentRecord) {
        self.records.lock().await.insert(record.id, record);
    }
}

#[async_trait]
impl PaymentStore for InMemoryPaymentStore {
    async fn insert(&self, new: NewPaymentRecord) -> Result<PaymentRecord, DatabaseError> {
        let mut records = self.records.lock().await;
        if let Some(intent) = &new.gateway_intent_id {
            if records
                .values()
                .any(|r| r.gateway_intent_id.as_deref() == Some(intent.as_str()))
            {
                return Err(DatabaseError::new(DatabaseErrorKind::UniqueViolation {
                    constraint: Some("payments_gateway_intent_id_key".to_string()),
                }));
            }
        }

        let now = Utc::now();
        let record = PaymentRecord {
            id: Uuid::new_v4(),
            gateway_intent_id: new.gateway_intent_id,
            previous_intent_ids: Vec::new(),
            gateway_charge_id: None,
            payer_id: new.payer_id,
            payee_id: new.payee_id,
            contract_id: new.contract_id,
            milestone_id: new.milestone_id,
            amount: new.amount,
            platform_fee: new.platform_fee,
            platform_fee_percentage: new.platform_fee_percentage,
            total_charge: new.total_charge,
            gateway_fee: None,
            refunded_amount: None,
            currency: new.currency,
            status: PaymentStatus::Pending,
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
        };
        records.insert(record.id, record.clone());
        Ok(record)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<PaymentRecord>, DatabaseError> {
        Ok(self.records.lock().await.get(&id).cloned())
    }

    async fn find_by_intent_id(
        &self,
        intent_id: &str,
    ) -> Result<Option<PaymentRecord>, DatabaseError> {
        Ok(self
            .records
            .lock()
            .await
            .values()
            .find(|r| {
                r.deleted_at.is_none()
                    && (r.gateway_intent_id.as_deref() == Some(intent_id)
                        || r.previous_intent_ids.iter().any(|id| id == intent_id))
            })
            .cloned())
    }

    async fn find_active_for_relation(
        &self,
        contract_id: Option<Uuid>,
        milestone_id: Option<Uuid>,
    ) -> Result<Option<PaymentRecord>, DatabaseError> {
        let records = self.records.lock().await;
        Ok(records
            .values()
            .filter(|r| r.deleted_at.is_none() && r.status.is_active())
            .filter(|r| match milestone_id {
                Some(milestone) => {
                    r.milestone_id == Some(milestone)
                        && contract_id.map_or(true, |c| r.contract_id == Some(c))
                }
                None => {
                    contract_id.is_some() && r.contract_id == contract_id && r.milestone_id.is_none()
                }
            })
            .max_by_key(|r| r.created_at)
            .cloned())
    }

    async fn apply_transition(
        &self,
        id: Uuid,
        change: &StatusChange,
    ) -> Result<Option<PaymentRecord>, DatabaseError> {
        let mut records = self.records.lock().await;
        let Some(current) = records.get(&id) else {
            return Ok(None);
        };
        if current.deleted_at.is_some()
            || check_transition(current.status, current.retry_count, change).is_err()
        {
            return Ok(None);
        }
        let next = current.with_change(change, Utc::now());
        records.insert(id, next.clone());
        Ok(Some(next))
    }

    async fn find_stale(
        &self,
        before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<PaymentRecord>, DatabaseError> {
        let records = self.records.lock().await;
        let mut stale: Vec<PaymentRecord> = records
            .values()
            .filter(|r| r.deleted_at.is_none() && r.status.is_in_flight() && r.updated_at < before)
            .cloned()
            .collect();
        stale.sort_by_key(|r| r.updated_at);
        stale.truncate(limit.max(0) as usize);
        Ok(stale)
    }

    async fn count_stale(&self, before: DateTime<Utc>) -> Result<i64, DatabaseError> {
        let records = self.records.lock().await;
        Ok(records
            .values()
            .filter(|r| r.deleted_at.is_none() && r.status.is_in_flight() && r.updated_at < before)
            .count() as i64)
    }

    async fn status_breakdown(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<StatusTotals>, DatabaseError> {
        let records = self.records.lock().await;
        let mut totals = Vec::new();
        for status in PaymentStatus::ALL {
            let matching: Vec<&PaymentRecord> = records
                .values()
                .filter(|r| r.deleted_at.is_none() && r.created_at >= since && r.status == status)
                .collect();
            if matching.is_empty() {
                continue;
            }
            totals.push(StatusTotals {
                status,
                count: matching.len() as i64,
                total_amount: matching
                    .iter()
                    .fold(BigDecimal::from(0), |acc, r| acc + &r.amount),
            });
        }
        Ok(totals)
    }

    async fn claim_refund(
        &self,
        id: Uuid,
        stale_before: DateTime<Utc>,
    ) -> Result<Option<PaymentRecord>, DatabaseError> {
        let mut records = self.records.lock().await;
        match records.get_mut(&id) {
            Some(record) if record.refund_claimable(stale_before) => {
                let now = Utc::now();
                record.refund_requested_at = Some(now);
                record.updated_at = now;
                Ok(Some(record.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn release_refund_claim(&self, id: Uuid) -> Result<(), DatabaseError> {
        let mut records = self.records.lock().await;
        if let Some(record) = records.get_mut(&id) {
            if record.status == PaymentStatus::Completed {
                record.refund_requested_at = None;
                record.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn soft_delete(
        &self,
        id: Uuid,
        allowed: &[PaymentStatus],
    ) -> Result<bool, DatabaseError> {
        let mut records = self.records.lock().await;
        match records.get_mut(&id) {
            Some(record) if record.deleted_at.is_none() && allowed.contains(&record.status) => {
                let now = Utc::now();
                record.deleted_at = Some(now);
                record.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct InMemoryLedgerStore {
    entries: Mutex<Vec<LedgerEntry>>,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn all(&self) -> Vec<LedgerEntry> {
        self.entries.lock().await.clone()
    }

    fn settle_entry(
        entry: &mut LedgerEntry,
        status: LedgerStatus,
        gateway_reference: Option<String>,
        now: DateTime<Utc>,
    ) {
        entry.status = status;
        if gateway_reference.is_some() {
            entry.gateway_reference = gateway_reference;
        }
        entry.settled_at = Some(now);
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn insert(&self, entry: NewLedgerEntry) -> Result<LedgerEntry, DatabaseError> {
        let entry = entry.into_entry(Utc::now());
        self.entries.lock().await.push(entry.clone());
        Ok(entry)
    }

    async fn settle(
        &self,
        id: Uuid,
        status: LedgerStatus,
        gateway_reference: Option<String>,
    ) -> Result<Option<LedgerEntry>, DatabaseError> {
        let mut entries = self.entries.lock().await;
        let now = Utc::now();
        Ok(entries
            .iter_mut()
            .find(|e| e.id == id && e.status == LedgerStatus::Pending)
            .map(|entry| {
                Self::settle_entry(entry, status, gateway_reference, now);
                entry.clone()
            }))
    }

    async fn settle_payment_entries(
        &self,
        payment_id: Uuid,
        status: LedgerStatus,
        gateway_reference: Option<String>,
    ) -> Result<Vec<LedgerEntry>, DatabaseError> {
        let mut entries = self.entries.lock().await;
        let now = Utc::now();
        let mut settled = Vec::new();
        for entry in entries.iter_mut().filter(|e| {
            e.payment_id == Some(payment_id)
                && e.entry_type == LedgerEntryType::Payment
                && e.status == LedgerStatus::Pending
        }) {
            Self::settle_entry(entry, status, gateway_reference.clone(), now);
            settled.push(entry.clone());
        }
        Ok(settled)
    }

    async fn settle_by_gateway_reference(
        &self,
        gateway_reference: &str,
        entry_type: LedgerEntryType,
        status: LedgerStatus,
    ) -> Result<Vec<LedgerEntry>, DatabaseError> {
        let mut entries = self.entries.lock().await;
        let now = Utc::now();
        let mut settled = Vec::new();
        for entry in entries.iter_mut().filter(|e| {
            e.gateway_reference.as_deref() == Some(gateway_reference)
                && e.entry_type == entry_type
                && e.status == LedgerStatus::Pending
        }) {
            Self::settle_entry(entry, status, None, now);
            settled.push(entry.clone());
        }
        Ok(settled)
    }

    async fn find_by_payment(&self, payment_id: Uuid) -> Result<Vec<LedgerEntry>, DatabaseError> {
        Ok(self
            .entries
            .lock()
            .await
            .iter()
            .filter(|e| e.payment_id == Some(payment_id))
            .cloned()
            .collect())
    }

    async fn query(&self, query: &LedgerQuery) -> Result<Vec<LedgerEntry>, DatabaseError> {
        let entries = self.entries.lock().await;
        let mut matched: Vec<LedgerEntry> =
            entries.iter().filter(|e| query.matches(e)).cloned().collect();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let offset = query.offset.unwrap_or(0).max(0) as usize;
        let limit = query.limit.map_or(usize::MAX, |l| l.max(0) as usize);
        Ok(matched.into_iter().skip(offset).take(limit).collect())
    }
}

// ---------------------------------------------------------------------------
// Webhook events
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct InMemoryWebhookEventStore {
    events: Mutex<HashMap<String, ProcessedWebhookEvent>>,
}

impl InMemoryWebhookEventStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WebhookEventStore for InMemoryWebhookEventStore {
    async fn find(
        &self,
        gateway_event_id: &str,
    ) -> Result<Option<ProcessedWebhookEvent>, DatabaseError> {
        Ok(self.events.lock().await.get(gateway_event_id).cloned())
    }

    async fn record_processed(
        &self,
        gateway_event_id: &str,
        event_type: &str,
    ) -> Result<bool, DatabaseError> {
        let mut events = self.events.lock().await;
        if events.contains_key(gateway_event_id) {
            return Ok(false);
        }
        events.insert(
            gateway_event_id.to_string(),
            ProcessedWebhookEvent {
                gateway_event_id: gateway_event_id.to_string(),
                event_type: event_type.to_string(),
                processed_at: Utc::now(),
            },
        );
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// Failed balance updates
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct InMemoryFailedBalanceStore {
    rows: Mutex<Vec<FailedBalanceUpdate>>,
}

impl InMemoryFailedBalanceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn all(&self) -> Vec<FailedBalanceUpdate> {
        self.rows.lock().await.clone()
    }

    /// Rewinds a row's claim time, standing in for a claim abandoned long ago.
    pub async fn set_last_retry_at(&self, id: Uuid, at: Option<DateTime<Utc>>) {
        if let Some(row) = self.rows.lock().await.iter_mut().find(|r| r.id == id) {
            row.last_retry_at = at;
        }
    }
}

#[async_trait]
impl FailedBalanceStore for InMemoryFailedBalanceStore {
    async fn insert(
        &self,
        update: NewFailedBalanceUpdate,
    ) -> Result<FailedBalanceUpdate, DatabaseError> {
        let row = FailedBalanceUpdate {
            id: Uuid::new_v4(),
            payment_id: update.payment_id,
            payee_id: update.payee_id,
            amount: update.amount,
            status: FailedUpdateStatus::Pending,
            retry_count: 0,
            last_retry_at: None,
            error: Some(update.error),
            created_at: Utc::now(),
            resolved_at: None,
        };
        self.rows.lock().await.push(row.clone());
        Ok(row)
    }

    async fn list_claimable(&self, limit: i64) -> Result<Vec<FailedBalanceUpdate>, DatabaseError> {
        let now = Utc::now();
        let rows = self.rows.lock().await;
        let mut claimable: Vec<FailedBalanceUpdate> =
            rows.iter().filter(|r| r.is_claimable(now)).cloned().collect();
        claimable.sort_by_key(|r| r.created_at);
        claimable.truncate(limit.max(0) as usize);
        Ok(claimable)
    }

    async fn claim(&self, id: Uuid) -> Result<Option<FailedBalanceUpdate>, DatabaseError> {
        let now = Utc::now();
        let mut rows = self.rows.lock().await;
        Ok(rows
            .iter_mut()
            .find(|r| r.id == id && r.is_claimable(now))
            .map(|row| {
                row.status = FailedUpdateStatus::Retrying;
                row.last_retry_at = Some(now);
                row.clone()
            }))
    }

    async fn mark_completed(&self, claimed: &FailedBalanceUpdate) -> Result<bool, DatabaseError> {
        let mut rows = self.rows.lock().await;
        match rows.iter_mut().find(|r| {
            r.id == claimed.id
                && r.status == FailedUpdateStatus::Retrying
                && r.last_retry_at == claimed.last_retry_at
        }) {
            Some(row) => {
                row.status = FailedUpdateStatus::Completed;
                row.resolved_at = Some(Utc::now());
                row.error = None;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn record_attempt_failure(
        &self,
        claimed: &FailedBalanceUpdate,
        error: &str,
        max_attempts: i32,
    ) -> Result<Option<FailedBalanceUpdate>, DatabaseError> {
        let now = Utc::now();
        let mut rows = self.rows.lock().await;
        let Some(row) = rows.iter_mut().find(|r| {
            r.id == claimed.id
                && matches!(
                    r.status,
                    FailedUpdateStatus::Retrying | FailedUpdateStatus::Completed
                )
                && r.last_retry_at == claimed.last_retry_at
        }) else {
            return Ok(None);
        };
        row.retry_count += 1;
        row.error = Some(error.to_string());
        row.last_retry_at = Some(now);
        if row.retry_count >= max_attempts {
            row.status = FailedUpdateStatus::Failed;
            row.resolved_at = Some(now);
        } else {
            row.status = FailedUpdateStatus::Pending;
            row.resolved_at = None;
        }
        Ok(Some(row.clone()))
    }

    async fn count_by_status(&self, status: FailedUpdateStatus) -> Result<i64, DatabaseError> {
        Ok(self
            .rows
            .lock()
            .await
            .iter()
            .filter(|r| r.status == status)
            .count() as i64)
    }

    async fn find_by_payment(
        &self,
        payment_id: Uuid,
    ) -> Result<Vec<FailedBalanceUpdate>, DatabaseError> {
        Ok(self
            .rows
            .lock()
            .await
            .iter()
            .filter(|r| r.payment_id == payment_id)
            .cloned()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Balances
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct InMemoryBalanceStore {
    balances: Mutex<HashMap<Uuid, UserBalance>>,
}

impl InMemoryBalanceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a zero balance row for the user.
    pub async fn open_account(&self, user_id: Uuid) {
        self.balances.lock().await.insert(
            user_id,
            UserBalance {
                user_id,
                available_balance: BigDecimal::from(0),
                pending_balance: BigDecimal::from(0),
                updated_at: Utc::now(),
            },
        );
    }
}

#[async_trait]
impl BalanceStore for InMemoryBalanceStore {
    async fn adjust_pending_balance(
        &self,
        user_id: Uuid,
        delta: &BigDecimal,
    ) -> Result<UserBalance, DatabaseError> {
        let mut balances = self.balances.lock().await;
        let balance = balances
            .get_mut(&user_id)
            .ok_or_else(|| DatabaseError::not_found("user balance", user_id))?;
        balance.pending_balance = &balance.pending_balance + delta;
        balance.updated_at = Utc::now();
        Ok(balance.clone())
    }

    async fn get(&self, user_id: Uuid) -> Result<Option<UserBalance>, DatabaseError> {
        Ok(self.balances.lock().await.get(&user_id).cloned())
    }
}

// ---------------------------------------------------------------------------
// Contracts
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct InMemoryContractDirectory {
    contracts: Mutex<HashMap<Uuid, ContractTerms>>,
    milestones: Mutex<HashMap<Uuid, MilestoneTerms>>,
}

impl InMemoryContractDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_contract(&self, contract: ContractTerms) {
        self.contracts.lock().await.insert(contract.id, contract);
    }

    pub async fn add_milestone(&self, milestone: MilestoneTerms) {
        self.milestones.lock().await.insert(milestone.id, milestone);
    }
}

#[async_trait]
impl ContractDirectory for InMemoryContractDirectory {
    async fn find_contract(&self, id: Uuid) -> Result<Option<ContractTerms>, DatabaseError> {
        Ok(self.contracts.lock().await.get(&id).cloned())
    }

    async fn find_milestone(&self, id: Uuid) -> Result<Option<MilestoneTerms>, DatabaseError> {
        Ok(self.milestones.lock().await.get(&id).cloned())
    }

    async fn activate(
        &self,
        contract_id: Uuid,
        total_paid: &BigDecimal,
    ) -> Result<(), DatabaseError> {
        let mut contracts = self.contracts.lock().await;
        let contract = contracts
            .get_mut(&contract_id)
            .ok_or_else(|| DatabaseError::not_found("contract", contract_id))?;
        contract.status = CONTRACT_STATUS_ACTIVE.to_string();
        contract.total_paid = Some(total_paid.clone());
        contract.activated_at.get_or_insert_with(Utc::now);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_payment() -> NewPaymentRecord {
        NewPaymentRecord {
            gateway_intent_id: Some(format!("pi_{}", Uuid::new_v4().simple())),
            payer_id: Uuid::new_v4(),
            payee_id: Uuid::new_v4(),
            contract_id: Some(Uuid::new_v4()),
            milestone_id: None,
            amount: BigDecimal::from(1000),
            platform_fee: BigDecimal::from(100),
            platform_fee_percentage: BigDecimal::from(10),
            total_charge: BigDecimal::from(1100),
            currency: "USD".to_string(),
        }
    }

    #[tokio::test]
    async fn conditional_transition_applies_once() {
        let store = InMemoryPaymentStore::new();
        let record = store.insert(new_payment()).await.unwrap();
        let change = StatusChange::Completed {
            charge_id: "ch_1".to_string(),
            gateway_fee: None,
        };

        let first = store.apply_transition(record.id, &change).await.unwrap();
        let second = store.apply_transition(record.id, &change).await.unwrap();

        assert!(first.is_some());
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn completed_ledger_entries_cannot_be_resettled() {
        let ledger = InMemoryLedgerStore::new();
        let entry = ledger
            .insert(NewLedgerEntry::simple(
                LedgerEntryType::Payment,
                None,
                None,
                BigDecimal::from(5),
                "USD",
                LedgerStatus::Completed,
            ))
            .await
            .unwrap();

        let result = ledger
            .settle(entry.id, LedgerStatus::Cancelled, None)
            .await
            .unwrap();
        assert!(result.is_none());
        assert_eq!(ledger.all().await[0].status, LedgerStatus::Completed);
    }

    #[tokio::test]
    async fn duplicate_event_ids_are_detected_on_insert() {
        let store = InMemoryWebhookEventStore::new();
        assert!(store.record_processed("evt_1", "charge.succeeded").await.unwrap());
        assert!(!store.record_processed("evt_1", "charge.succeeded").await.unwrap());
    }

    #[tokio::test]
    async fn retried_intents_still_resolve_to_the_payment() {
        let store = InMemoryPaymentStore::new();
        let record = store.insert(new_payment()).await.unwrap();
        let original = record.gateway_intent_id.clone().unwrap();
        store
            .apply_transition(
                record.id,
                &StatusChange::Failed {
                    error: "declined".to_string(),
                },
            )
            .await
            .unwrap();
        store
            .apply_transition(
                record.id,
                &StatusChange::Retried {
                    intent_id: "pi_replacement".to_string(),
                },
            )
            .await
            .unwrap();

        let by_old = store.find_by_intent_id(&original).await.unwrap().unwrap();
        let by_new = store.find_by_intent_id("pi_replacement").await.unwrap().unwrap();
        assert_eq!(by_old.id, record.id);
        assert_eq!(by_new.id, record.id);
        assert!(!by_old.is_current_intent(&original));
    }

    #[tokio::test]
    async fn refund_claim_is_exclusive_until_released() {
        let store = InMemoryPaymentStore::new();
        let record = store.insert(new_payment()).await.unwrap();
        let stale_before = Utc::now() - chrono::Duration::minutes(15);
        assert!(store.claim_refund(record.id, stale_before).await.unwrap().is_none());

        store
            .apply_transition(
                record.id,
                &StatusChange::Completed {
                    charge_id: "ch_1".to_string(),
                    gateway_fee: None,
                },
            )
            .await
            .unwrap();
        assert!(store.claim_refund(record.id, stale_before).await.unwrap().is_some());
        assert!(store.claim_refund(record.id, stale_before).await.unwrap().is_none());

        store.release_refund_claim(record.id).await.unwrap();
        assert!(store.claim_refund(record.id, stale_before).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn withdrawal_settlement_ignores_other_entry_types() {
        let ledger = InMemoryLedgerStore::new();
        for entry_type in [LedgerEntryType::Payment, LedgerEntryType::Withdrawal] {
            ledger
                .insert(
                    NewLedgerEntry::simple(
                        entry_type,
                        Some(Uuid::new_v4()),
                        None,
                        BigDecimal::from(10),
                        "USD",
                        LedgerStatus::Pending,
                    )
                    .gateway_reference(Some("tr_shared".to_string())),
                )
                .await
                .unwrap();
        }

        let settled = ledger
            .settle_by_gateway_reference("tr_shared", LedgerEntryType::Withdrawal, LedgerStatus::Completed)
            .await
            .unwrap();
        assert_eq!(settled.len(), 1);
        assert_eq!(settled[0].entry_type, LedgerEntryType::Withdrawal);
        let payment = ledger
            .all()
            .await
            .into_iter()
            .find(|e| e.entry_type == LedgerEntryType::Payment)
            .unwrap();
        assert_eq!(payment.status, LedgerStatus::Pending);
    }

    #[tokio::test]
    async fn missing_balance_row_is_an_error() {
        let store = InMemoryBalanceStore::new();
        let err = store
            .adjust_pending_balance(Uuid::new_v4(), &BigDecimal::from(1))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
