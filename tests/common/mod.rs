//! Shared fixtures for integration tests: in-memory stores, the scriptable
//! gateway, a balance store that fails on demand and a recording notifier.

#![allow(dead_code)]

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::Utc;
use marketplace_settlement::config::SchedulerConfig;
use marketplace_settlement::database::balance_repository::{BalanceStore, UserBalance};
use marketplace_settlement::database::contract_repository::{ContractTerms, MilestoneTerms};
use marketplace_settlement::database::error::DatabaseError;
use marketplace_settlement::database::memory::{
    InMemoryBalanceStore, InMemoryContractDirectory, InMemoryFailedBalanceStore,
    InMemoryLedgerStore, InMemoryPaymentStore, InMemoryWebhookEventStore,
};
use marketplace_settlement::database::settlement::BestEffortSettlement;
use marketplace_settlement::payments::signature::sign_header;
use marketplace_settlement::payments::{InMemoryGateway, WebhookVerifier};
use marketplace_settlement::services::notification::NotificationError;
use marketplace_settlement::services::{
    BalanceUpdater, CreatePaymentIntent, LedgerService, Notifier, PaymentContext,
    PaymentNotification, PaymentService, PaymentServiceConfig, PaymentServiceDeps,
    WebhookProcessor,
};
use marketplace_settlement::workers::ReconciliationWorker;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

pub const WEBHOOK_SECRET: &str = "whsec_integration";

pub fn money(value: &str) -> BigDecimal {
    BigDecimal::from_str(value).unwrap()
}

/// Balance store that fails the next N adjustments with a connection error.
#[derive(Default)]
pub struct FlakyBalanceStore {
    inner: InMemoryBalanceStore,
    failures_remaining: AtomicUsize,
}

impl FlakyBalanceStore {
    pub fn fail_next(&self, count: usize) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }

    pub async fn open_account(&self, user_id: Uuid) {
        self.inner.open_account(user_id).await;
    }

    pub async fn pending_balance(&self, user_id: Uuid) -> BigDecimal {
        self.inner
            .get(user_id)
            .await
            .unwrap()
            .map(|b| b.pending_balance)
            .unwrap_or_default()
    }
}

#[async_trait]
impl BalanceStore for FlakyBalanceStore {
    async fn adjust_pending_balance(
        &self,
        user_id: Uuid,
        delta: &BigDecimal,
    ) -> Result<UserBalance, DatabaseError> {
        let injected = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(DatabaseError::query("connection reset by peer"));
        }
        self.inner.adjust_pending_balance(user_id, delta).await
    }

    async fn get(&self, user_id: Uuid) -> Result<Option<UserBalance>, DatabaseError> {
        self.inner.get(user_id).await
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<PaymentNotification>>,
}

impl RecordingNotifier {
    pub async fn sent(&self) -> Vec<PaymentNotification> {
        self.sent.lock().await.clone()
    }

    pub async fn kinds(&self) -> Vec<&'static str> {
        self.sent.lock().await.iter().map(|n| n.kind()).collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notification: &PaymentNotification) -> Result<(), NotificationError> {
        self.sent.lock().await.push(notification.clone());
        Ok(())
    }
}

pub struct TestEnv {
    pub service: PaymentService,
    pub processor: WebhookProcessor,
    pub gateway: Arc<InMemoryGateway>,
    pub payments: Arc<InMemoryPaymentStore>,
    pub ledger: Arc<InMemoryLedgerStore>,
    pub events: Arc<InMemoryWebhookEventStore>,
    pub balances: Arc<FlakyBalanceStore>,
    pub failed_updates: Arc<InMemoryFailedBalanceStore>,
    pub contracts: Arc<InMemoryContractDirectory>,
    pub notifier: Arc<RecordingNotifier>,
    pub updater: BalanceUpdater,
    /// $1000 contract at 10% platform fee
    pub contract: ContractTerms,
}

impl TestEnv {
    pub async fn new() -> Self {
        let payments = Arc::new(InMemoryPaymentStore::new());
        let ledger = Arc::new(InMemoryLedgerStore::new());
        let events = Arc::new(InMemoryWebhookEventStore::new());
        let balances = Arc::new(FlakyBalanceStore::default());
        let failed_updates = Arc::new(InMemoryFailedBalanceStore::new());
        let contracts = Arc::new(InMemoryContractDirectory::new());
        let gateway = Arc::new(InMemoryGateway::new());
        let notifier = Arc::new(RecordingNotifier::default());

        let contract = ContractTerms {
            id: Uuid::new_v4(),
            client_id: Uuid::new_v4(),
            freelancer_id: Uuid::new_v4(),
            amount: BigDecimal::from(1000),
            platform_fee_percentage: BigDecimal::from(10),
            currency: "USD".to_string(),
            status: "pending".to_string(),
            total_paid: None,
            activated_at: None,
        };
        contracts.add_contract(contract.clone()).await;
        balances.open_account(contract.freelancer_id).await;
        balances.open_account(contract.client_id).await;

        let updater = BalanceUpdater::new(balances.clone(), failed_updates.clone());
        let settlement = Arc::new(BestEffortSettlement::new(
            payments.clone(),
            ledger.clone(),
            contracts.clone(),
            updater.clone(),
        ));
        let service = PaymentService::new(
            PaymentServiceDeps {
                payments: payments.clone(),
                ledger: ledger.clone(),
                contracts: contracts.clone(),
                gateway: gateway.clone(),
                settlement,
                balances: updater.clone(),
                notifier: notifier.clone(),
            },
            PaymentServiceConfig {
                gateway_timeout: Duration::from_secs(5),
                default_currency: "USD".to_string(),
            },
        );

        let verifier = WebhookVerifier::new(WEBHOOK_SECRET, Duration::from_secs(300)).unwrap();
        let processor = WebhookProcessor::new(
            verifier,
            events.clone(),
            service.clone(),
            LedgerService::new(ledger.clone()),
            notifier.clone(),
        );

        Self {
            service,
            processor,
            gateway,
            payments,
            ledger,
            events,
            balances,
            failed_updates,
            contracts,
            notifier,
            updater,
            contract,
        }
    }

    pub fn worker(&self, config: SchedulerConfig) -> ReconciliationWorker {
        ReconciliationWorker::new(
            self.payments.clone(),
            self.failed_updates.clone(),
            self.service.clone(),
            self.updater.clone(),
            self.notifier.clone(),
            config,
        )
    }

    pub fn contract_payment(&self, amount: &str) -> CreatePaymentIntent {
        CreatePaymentIntent {
            amount: money(amount),
            currency: None,
            payer_id: self.contract.client_id,
            payee_id: self.contract.freelancer_id,
            context: PaymentContext {
                contract_id: self.contract.id,
                ..Default::default()
            },
        }
    }

    pub async fn add_milestone(&self, amount: &str) -> MilestoneTerms {
        let milestone = MilestoneTerms {
            id: Uuid::new_v4(),
            contract_id: self.contract.id,
            title: "Design review".to_string(),
            amount: money(amount),
            status: "pending".to_string(),
        };
        self.contracts.add_milestone(milestone.clone()).await;
        milestone
    }

    pub async fn payee_pending_balance(&self) -> BigDecimal {
        self.balances
            .pending_balance(self.contract.freelancer_id)
            .await
    }
}

/// Header value signed with the test secret at the current time.
pub fn signature(body: &[u8]) -> String {
    sign_header(WEBHOOK_SECRET, Utc::now().timestamp(), body).unwrap()
}

pub fn succeeded_event(event_id: &str, intent_id: &str, charge_id: &str) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "id": event_id,
        "type": "payment_intent.succeeded",
        "data": {
            "object": {
                "id": intent_id,
                "latest_charge": charge_id,
            }
        }
    }))
    .unwrap()
}
