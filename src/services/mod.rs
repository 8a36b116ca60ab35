//! Services module for settlement business logic

pub mod balance;
pub mod fee_calculation;
pub mod ledger;
pub mod notification;
pub mod payment_service;
pub mod webhook_processor;

pub use balance::{BalanceError, BalanceUpdater, RetryReport};
pub use fee_calculation::{calculate_fees, FeeBreakdown, FeeError};
pub use ledger::{LedgerError, LedgerService, PlatformRevenue, UserLedgerSummary};
pub use notification::{LogNotifier, Notifier, PaymentNotification};
pub use payment_service::{
    CreatePaymentIntent, PaymentContext, PaymentIntentHandle, PaymentService,
    PaymentServiceConfig, PaymentServiceDeps, SettlementError,
};
pub use webhook_processor::{WebhookOutcome, WebhookProcessor, WebhookProcessorError};
