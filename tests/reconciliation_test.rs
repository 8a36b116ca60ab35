mod common;

use chrono::{Duration, Utc};
use common::{money, TestEnv};
use marketplace_settlement::config::SchedulerConfig;
use marketplace_settlement::database::failed_balance_repository::FailedUpdateStatus;
use marketplace_settlement::payments::types::IntentStatus;
use marketplace_settlement::payments::PaymentStatus;
use marketplace_settlement::services::PaymentNotification;
use uuid::Uuid;

async fn age(env: &TestEnv, payment_id: Uuid, hours: i64) {
    env.payments
        .set_updated_at(payment_id, Utc::now() - Duration::hours(hours))
        .await;
}

#[tokio::test]
async fn sweep_completes_payment_whose_webhook_was_lost() {
    let env = TestEnv::new().await;
    let handle = env
        .service
        .create_payment_intent(env.contract_payment("1000"))
        .await
        .unwrap();
    env.gateway
        .set_intent_status(
            &handle.intent_id,
            IntentStatus::Succeeded,
            Some("ch_lost"),
            Some(money("32.20")),
        )
        .await;
    age(&env, handle.payment_id, 25).await;

    let report = env
        .worker(SchedulerConfig::default())
        .sweep_stuck_payments()
        .await
        .unwrap();
    assert_eq!(report.examined, 1);
    assert_eq!(report.completed, 1);

    let payment = env.service.get_payment(handle.payment_id).await.unwrap();
    assert_eq!(payment.status, PaymentStatus::Completed);
    assert_eq!(payment.gateway_charge_id.as_deref(), Some("ch_lost"));
    assert_eq!(payment.gateway_fee, Some(money("32.20")));
    assert_eq!(env.payee_pending_balance().await, money("1000"));
}

#[tokio::test]
async fn sweep_ignores_recent_payments() {
    let env = TestEnv::new().await;
    let handle = env
        .service
        .create_payment_intent(env.contract_payment("1000"))
        .await
        .unwrap();
    env.gateway
        .set_intent_status(&handle.intent_id, IntentStatus::Succeeded, Some("ch_1"), None)
        .await;

    let report = env
        .worker(SchedulerConfig::default())
        .sweep_stuck_payments()
        .await
        .unwrap();
    assert_eq!(report.examined, 0);

    let payment = env.service.get_payment(handle.payment_id).await.unwrap();
    assert_eq!(payment.status, PaymentStatus::Pending);
}

#[tokio::test]
async fn sweep_continues_past_per_item_gateway_errors() {
    let env = TestEnv::new().await;
    let first = env.add_milestone("200").await;
    let second = env.add_milestone("300").await;

    let mut request = env.contract_payment("200");
    request.context.milestone_id = Some(first.id);
    let unreachable = env.service.create_payment_intent(request).await.unwrap();

    let mut request = env.contract_payment("300");
    request.context.milestone_id = Some(second.id);
    let reachable = env.service.create_payment_intent(request).await.unwrap();

    env.gateway.make_unreachable(&unreachable.intent_id).await;
    env.gateway
        .set_intent_status(&reachable.intent_id, IntentStatus::Succeeded, Some("ch_2"), None)
        .await;
    age(&env, unreachable.payment_id, 30).await;
    age(&env, reachable.payment_id, 30).await;

    let report = env
        .worker(SchedulerConfig::default())
        .sweep_stuck_payments()
        .await
        .unwrap();
    assert_eq!(report.examined, 2);
    assert_eq!(report.errors, 1);
    assert_eq!(report.completed, 1);

    let untouched = env.service.get_payment(unreachable.payment_id).await.unwrap();
    assert_eq!(untouched.status, PaymentStatus::Pending);
    let settled = env.service.get_payment(reachable.payment_id).await.unwrap();
    assert_eq!(settled.status, PaymentStatus::Completed);
}

#[tokio::test]
async fn abandoned_checkout_is_canceled_and_failed() {
    let env = TestEnv::new().await;
    let handle = env
        .service
        .create_payment_intent(env.contract_payment("1000"))
        .await
        .unwrap();
    age(&env, handle.payment_id, 48).await;

    let report = env
        .worker(SchedulerConfig::default())
        .sweep_stuck_payments()
        .await
        .unwrap();
    assert_eq!(report.failed, 1);

    assert_eq!(env.gateway.canceled_intents().await, vec![handle.intent_id]);
    let payment = env.service.get_payment(handle.payment_id).await.unwrap();
    assert_eq!(payment.status, PaymentStatus::Failed);
}

#[tokio::test]
async fn processing_intent_is_left_in_flight() {
    let env = TestEnv::new().await;
    let handle = env
        .service
        .create_payment_intent(env.contract_payment("1000"))
        .await
        .unwrap();
    env.gateway
        .set_intent_status(&handle.intent_id, IntentStatus::Processing, None, None)
        .await;
    age(&env, handle.payment_id, 30).await;

    let report = env
        .worker(SchedulerConfig::default())
        .sweep_stuck_payments()
        .await
        .unwrap();
    assert_eq!(report.still_pending, 1);

    let payment = env.service.get_payment(handle.payment_id).await.unwrap();
    assert_eq!(payment.status, PaymentStatus::Processing);
}

#[tokio::test]
async fn balance_update_is_marked_failed_after_five_attempts() {
    let env = TestEnv::new().await;
    let handle = env
        .service
        .create_payment_intent(env.contract_payment("1000"))
        .await
        .unwrap();

    env.balances.fail_next(1);
    env.service
        .complete_payment(handle.payment_id, "ch_1", None)
        .await
        .unwrap();

    let worker = env.worker(SchedulerConfig::default());
    env.balances.fail_next(5);
    let mut last = None;
    for _ in 0..5 {
        last = Some(worker.retry_failed_balances().await.unwrap());
    }

    let last = last.unwrap();
    assert_eq!(last.permanently_failed, 1);
    let rows = env.failed_updates.all().await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, FailedUpdateStatus::Failed);
    assert_eq!(rows[0].retry_count, 5);
    assert_eq!(env.payee_pending_balance().await, money("0"));

    // Nothing left to claim.
    let report = worker.retry_failed_balances().await.unwrap();
    assert_eq!(report.examined, 0);
}

#[tokio::test]
async fn weekly_report_raises_alerts_over_thresholds() {
    let env = TestEnv::new().await;
    let handle = env
        .service
        .create_payment_intent(env.contract_payment("1000"))
        .await
        .unwrap();
    age(&env, handle.payment_id, 30).await;

    let config = SchedulerConfig {
        stuck_alert_threshold: 0,
        ..SchedulerConfig::default()
    };
    let report = env.worker(config).weekly_report().await.unwrap();

    assert_eq!(report.stuck_payments, 1);
    assert_eq!(report.alerts.len(), 1);
    assert!(report
        .by_status
        .iter()
        .any(|t| t.status == PaymentStatus::Pending && t.count == 1));

    let sent = env.notifier.sent().await;
    assert!(matches!(
        sent.as_slice(),
        [PaymentNotification::OperationalAlert { details, .. }] if details.len() == 1
    ));
}

#[tokio::test]
async fn weekly_report_is_quiet_under_thresholds() {
    let env = TestEnv::new().await;
    env.service
        .create_payment_intent(env.contract_payment("1000"))
        .await
        .unwrap();

    let report = env
        .worker(SchedulerConfig::default())
        .weekly_report()
        .await
        .unwrap();
    assert_eq!(report.stuck_payments, 0);
    assert!(report.alerts.is_empty());
    assert!(env.notifier.sent().await.is_empty());
}
