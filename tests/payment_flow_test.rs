mod common;

use common::{money, TestEnv};
use marketplace_settlement::config::SchedulerConfig;
use marketplace_settlement::database::contract_repository::{
    ContractDirectory, CONTRACT_STATUS_ACTIVE,
};
use marketplace_settlement::database::failed_balance_repository::FailedUpdateStatus;
use marketplace_settlement::database::ledger_repository::{LedgerEntryType, LedgerStatus};
use marketplace_settlement::database::settlement::{CompletionOutcome, CreditOutcome};
use marketplace_settlement::payments::{GatewayError, PaymentStatus};
use marketplace_settlement::services::SettlementError;

#[tokio::test]
async fn thousand_dollar_contract_settles_end_to_end() {
    let env = TestEnv::new().await;

    let handle = env
        .service
        .create_payment_intent(env.contract_payment("1000.00"))
        .await
        .unwrap();
    assert_eq!(handle.fees.platform_fee, money("100.00"));
    assert_eq!(handle.fees.total_charge, money("1100.00"));
    assert_eq!(handle.fees.payee_amount, money("1000.00"));

    let outcome = env
        .service
        .complete_payment(handle.payment_id, "ch_1", Some(money("32.20")))
        .await
        .unwrap();

    match &outcome {
        CompletionOutcome::Applied {
            payment,
            credit,
            contract_activated,
            ledger_complete,
        } => {
            assert_eq!(payment.status, PaymentStatus::Completed);
            assert_eq!(payment.gateway_charge_id.as_deref(), Some("ch_1"));
            assert_eq!(credit, &CreditOutcome::Applied);
            assert!(*contract_activated);
            assert!(*ledger_complete);
        }
        other => panic!("expected applied completion, got {:?}", other),
    }

    assert_eq!(env.payee_pending_balance().await, money("1000.00"));

    let contract = env
        .contracts
        .find_contract(env.contract.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(contract.status, CONTRACT_STATUS_ACTIVE);
    assert_eq!(contract.total_paid, Some(money("1100.00")));

    let entries = env.ledger.all().await;
    let payment_entries: Vec<_> = entries
        .iter()
        .filter(|e| e.entry_type == LedgerEntryType::Payment)
        .collect();
    assert_eq!(payment_entries.len(), 1);
    assert_eq!(payment_entries[0].status, LedgerStatus::Completed);
    assert_eq!(payment_entries[0].net_amount, money("1000.00"));

    let fees: Vec<_> = entries
        .iter()
        .filter(|e| e.entry_type == LedgerEntryType::Fee)
        .collect();
    assert_eq!(fees.len(), 2);
    assert!(fees
        .iter()
        .any(|e| e.from_user.is_some() && e.amount == money("100.00")));
    assert!(fees
        .iter()
        .any(|e| e.from_user.is_none() && e.amount == money("32.20")));

    assert_eq!(env.notifier.kinds().await, vec!["payment_completed"]);
}

#[tokio::test]
async fn duplicate_completion_credits_payee_once() {
    let env = TestEnv::new().await;
    let handle = env
        .service
        .create_payment_intent(env.contract_payment("1000"))
        .await
        .unwrap();

    env.service
        .complete_payment(handle.payment_id, "ch_1", None)
        .await
        .unwrap();
    let second = env
        .service
        .complete_payment(handle.payment_id, "ch_1", None)
        .await
        .unwrap();

    assert!(matches!(second, CompletionOutcome::AlreadySettled { .. }));
    assert_eq!(env.payee_pending_balance().await, money("1000"));
    assert_eq!(env.notifier.kinds().await, vec!["payment_completed"]);
}

#[tokio::test]
async fn concurrent_completions_apply_once() {
    let env = TestEnv::new().await;
    let handle = env
        .service
        .create_payment_intent(env.contract_payment("1000"))
        .await
        .unwrap();

    let a = env.service.clone();
    let b = env.service.clone();
    let id = handle.payment_id;
    let (first, second) = tokio::join!(
        tokio::spawn(async move { a.complete_payment(id, "ch_1", None).await }),
        tokio::spawn(async move { b.complete_payment(id, "ch_1", None).await }),
    );
    let outcomes = [first.unwrap().unwrap(), second.unwrap().unwrap()];

    let applied = outcomes
        .iter()
        .filter(|o| matches!(o, CompletionOutcome::Applied { .. }))
        .count();
    assert_eq!(applied, 1);
    assert_eq!(env.payee_pending_balance().await, money("1000"));
}

#[tokio::test]
async fn gateway_failure_leaves_no_payment_record() {
    let env = TestEnv::new().await;
    env.gateway
        .fail_next_create(GatewayError::Network {
            message: "connection refused".to_string(),
        })
        .await;

    let err = env
        .service
        .create_payment_intent(env.contract_payment("1000"))
        .await
        .unwrap_err();
    assert!(matches!(err, SettlementError::Gateway(_)));
    assert!(env.ledger.all().await.is_empty());

    // Nothing blocks a second attempt.
    env.service
        .create_payment_intent(env.contract_payment("1000"))
        .await
        .unwrap();
}

#[tokio::test]
async fn failure_is_recorded_and_pending_ledger_entry_failed() {
    let env = TestEnv::new().await;
    let handle = env
        .service
        .create_payment_intent(env.contract_payment("1000"))
        .await
        .unwrap();

    let failed = env
        .service
        .fail_payment(handle.payment_id, "card declined")
        .await
        .unwrap();
    assert_eq!(failed.status, PaymentStatus::Failed);
    assert_eq!(failed.retry_count, 1);
    assert_eq!(failed.error_message.as_deref(), Some("card declined"));

    let stored = env.service.get_payment(handle.payment_id).await.unwrap();
    assert_eq!(stored.status, PaymentStatus::Failed);

    let entries = env.ledger.all().await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].status, LedgerStatus::Failed);
    assert_eq!(env.notifier.kinds().await, vec!["payment_failed"]);

    // A failed payment only completes after a retry.
    let err = env
        .service
        .complete_payment(handle.payment_id, "ch_1", None)
        .await
        .unwrap_err();
    assert!(matches!(err, SettlementError::InvalidTransition { .. }));
}

#[tokio::test]
async fn retries_are_bounded() {
    let env = TestEnv::new().await;
    let handle = env
        .service
        .create_payment_intent(env.contract_payment("1000"))
        .await
        .unwrap();

    let mut intents = vec![handle.intent_id.clone()];
    for _ in 0..3 {
        env.service
            .fail_payment(handle.payment_id, "card declined")
            .await
            .unwrap();
        match env.service.retry_payment(handle.payment_id).await {
            Ok(retried) => intents.push(retried.intent_id),
            Err(e) => {
                assert!(matches!(e, SettlementError::RetryExhausted { .. }));
                break;
            }
        }
    }

    // Two retries succeed; the third failure exhausts the budget.
    assert_eq!(intents.len(), 3);
    let payment = env.service.get_payment(handle.payment_id).await.unwrap();
    assert_eq!(payment.status, PaymentStatus::Failed);
    assert_eq!(payment.retry_count, 3);
    assert_eq!(payment.gateway_intent_id.as_deref(), intents.last().map(String::as_str));
}

#[tokio::test]
async fn deferred_credit_is_applied_by_retry_job() {
    let env = TestEnv::new().await;
    let handle = env
        .service
        .create_payment_intent(env.contract_payment("1000"))
        .await
        .unwrap();

    env.balances.fail_next(1);
    let outcome = env
        .service
        .complete_payment(handle.payment_id, "ch_1", None)
        .await
        .unwrap();

    match &outcome {
        CompletionOutcome::Applied { payment, credit, .. } => {
            assert_eq!(payment.status, PaymentStatus::Completed);
            assert!(matches!(credit, CreditOutcome::Deferred { .. }));
        }
        other => panic!("expected applied completion, got {:?}", other),
    }
    assert_eq!(env.payee_pending_balance().await, money("0"));

    let parked = env.failed_updates.all().await;
    assert_eq!(parked.len(), 1);
    assert_eq!(parked[0].status, FailedUpdateStatus::Pending);
    assert_eq!(parked[0].amount, money("1000"));

    let report = env
        .worker(SchedulerConfig::default())
        .retry_failed_balances()
        .await
        .unwrap();
    assert_eq!(report.applied, 1);
    assert_eq!(env.payee_pending_balance().await, money("1000"));
    assert_eq!(
        env.failed_updates.all().await[0].status,
        FailedUpdateStatus::Completed
    );
}

#[tokio::test]
async fn full_refund_debits_payee_and_records_ledger_entry() {
    let env = TestEnv::new().await;
    let handle = env
        .service
        .create_payment_intent(env.contract_payment("1000"))
        .await
        .unwrap();
    env.service
        .complete_payment(handle.payment_id, "ch_1", None)
        .await
        .unwrap();

    let refunded = env
        .service
        .refund_payment(handle.payment_id, None)
        .await
        .unwrap();
    assert_eq!(refunded.status, PaymentStatus::Refunded);
    assert_eq!(refunded.refunded_amount, Some(money("1000")));

    let refunds = env.gateway.refunds().await;
    assert_eq!(refunds.len(), 1);
    assert_eq!(refunds[0].charge_id, "ch_1");

    assert_eq!(env.payee_pending_balance().await, money("0"));

    let refund_entries: Vec<_> = env
        .ledger
        .all()
        .await
        .into_iter()
        .filter(|e| e.entry_type == LedgerEntryType::Refund)
        .collect();
    assert_eq!(refund_entries.len(), 1);
    assert_eq!(refund_entries[0].from_user, Some(env.contract.freelancer_id));
    assert_eq!(refund_entries[0].to_user, Some(env.contract.client_id));
    assert_eq!(refund_entries[0].status, LedgerStatus::Completed);
}

#[tokio::test]
async fn partial_refund_claws_back_only_the_refunded_amount() {
    let env = TestEnv::new().await;
    let handle = env
        .service
        .create_payment_intent(env.contract_payment("1000"))
        .await
        .unwrap();
    env.service
        .complete_payment(handle.payment_id, "ch_1", None)
        .await
        .unwrap();

    env.service
        .refund_payment(handle.payment_id, Some(money("250")))
        .await
        .unwrap();
    assert_eq!(env.payee_pending_balance().await, money("750"));

    let err = env
        .service
        .refund_payment(handle.payment_id, Some(money("10")))
        .await
        .unwrap_err();
    assert!(matches!(err, SettlementError::InvalidTransition { .. }));
}

#[tokio::test]
async fn refund_above_total_charge_is_rejected() {
    let env = TestEnv::new().await;
    let handle = env
        .service
        .create_payment_intent(env.contract_payment("1000"))
        .await
        .unwrap();
    env.service
        .complete_payment(handle.payment_id, "ch_1", None)
        .await
        .unwrap();

    let err = env
        .service
        .refund_payment(handle.payment_id, Some(money("1100.01")))
        .await
        .unwrap_err();
    assert!(matches!(err, SettlementError::Validation { .. }));
    assert!(env.gateway.refunds().await.is_empty());
}

#[tokio::test]
async fn milestone_payment_does_not_activate_contract() {
    let env = TestEnv::new().await;
    let milestone = env.add_milestone("400").await;
    let mut request = env.contract_payment("400");
    request.context.milestone_id = Some(milestone.id);

    let handle = env.service.create_payment_intent(request).await.unwrap();
    let outcome = env
        .service
        .complete_payment(handle.payment_id, "ch_m", None)
        .await
        .unwrap();

    match outcome {
        CompletionOutcome::Applied {
            contract_activated, ..
        } => assert!(!contract_activated),
        other => panic!("expected applied completion, got {:?}", other),
    }
    let contract = env
        .contracts
        .find_contract(env.contract.id)
        .await
        .unwrap()
        .unwrap();
    assert_ne!(contract.status, CONTRACT_STATUS_ACTIVE);
    assert_eq!(env.payee_pending_balance().await, money("400"));
}

#[tokio::test]
async fn retry_cancels_the_replaced_intent() {
    let env = TestEnv::new().await;
    let handle = env
        .service
        .create_payment_intent(env.contract_payment("1000"))
        .await
        .unwrap();
    env.service
        .fail_payment(handle.payment_id, "card declined")
        .await
        .unwrap();

    let retried = env.service.retry_payment(handle.payment_id).await.unwrap();

    assert_ne!(retried.intent_id, handle.intent_id);
    assert_eq!(env.gateway.canceled_intents().await, vec![handle.intent_id.clone()]);
    let payment = env.service.get_payment(handle.payment_id).await.unwrap();
    assert_eq!(payment.status, PaymentStatus::Pending);
    assert_eq!(payment.previous_intent_ids, vec![handle.intent_id.clone()]);
    assert_eq!(
        payment.gateway_intent_id.as_deref(),
        Some(retried.intent_id.as_str())
    );
}

#[tokio::test]
async fn concurrent_refunds_issue_one_gateway_refund() {
    let env = TestEnv::new().await;
    let handle = env
        .service
        .create_payment_intent(env.contract_payment("1000"))
        .await
        .unwrap();
    env.service
        .complete_payment(handle.payment_id, "ch_1", None)
        .await
        .unwrap();
    env.gateway
        .set_refund_delay(std::time::Duration::from_millis(50))
        .await;

    let a = env.service.clone();
    let b = env.service.clone();
    let id = handle.payment_id;
    let (first, second) = tokio::join!(
        tokio::spawn(async move { a.refund_payment(id, None).await }),
        tokio::spawn(async move { b.refund_payment(id, None).await }),
    );
    let results = [first.unwrap(), second.unwrap()];

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results.iter().any(|r| matches!(
        r,
        Err(SettlementError::Conflict(_)) | Err(SettlementError::InvalidTransition { .. })
    )));
    assert_eq!(env.gateway.refunds().await.len(), 1);
    assert_eq!(env.gateway.refund_keys().await, vec![format!("refund-{}", id)]);
    assert_eq!(env.payee_pending_balance().await, money("0"));
}

#[tokio::test]
async fn failed_gateway_refund_can_be_retried() {
    let env = TestEnv::new().await;
    let handle = env
        .service
        .create_payment_intent(env.contract_payment("1000"))
        .await
        .unwrap();
    env.service
        .complete_payment(handle.payment_id, "ch_1", None)
        .await
        .unwrap();
    env.gateway
        .fail_next_refund(GatewayError::Network {
            message: "connection reset".to_string(),
        })
        .await;

    let err = env
        .service
        .refund_payment(handle.payment_id, None)
        .await
        .unwrap_err();
    assert!(matches!(err, SettlementError::Gateway(_)));
    let payment = env.service.get_payment(handle.payment_id).await.unwrap();
    assert_eq!(payment.status, PaymentStatus::Completed);
    assert!(payment.refund_requested_at.is_none());

    let refunded = env
        .service
        .refund_payment(handle.payment_id, None)
        .await
        .unwrap();
    assert_eq!(refunded.status, PaymentStatus::Refunded);
    assert_eq!(env.gateway.refunds().await.len(), 1);
}

#[tokio::test]
async fn refunding_the_fee_books_it_against_the_platform() {
    let env = TestEnv::new().await;
    let handle = env
        .service
        .create_payment_intent(env.contract_payment("1000"))
        .await
        .unwrap();
    env.service
        .complete_payment(handle.payment_id, "ch_1", None)
        .await
        .unwrap();

    env.service
        .refund_payment(handle.payment_id, Some(money("1100")))
        .await
        .unwrap();

    assert_eq!(env.payee_pending_balance().await, money("0"));
    let entries = env.ledger.all().await;
    let refund: Vec<_> = entries
        .iter()
        .filter(|e| e.entry_type == LedgerEntryType::Refund)
        .collect();
    assert_eq!(refund.len(), 1);
    assert_eq!(refund[0].amount, money("1000"));
    assert_eq!(refund[0].from_user, Some(env.contract.freelancer_id));

    let reversal: Vec<_> = entries
        .iter()
        .filter(|e| e.entry_type == LedgerEntryType::FeeReversal)
        .collect();
    assert_eq!(reversal.len(), 1);
    assert_eq!(reversal[0].amount, money("100"));
    assert_eq!(reversal[0].from_user, None);
    assert_eq!(reversal[0].to_user, Some(env.contract.client_id));
}
