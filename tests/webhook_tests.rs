mod common;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use chrono::Utc;
use common::{money, signature, succeeded_event, TestEnv, WEBHOOK_SECRET};
use marketplace_settlement::api::{self, health::HealthChecker};
use marketplace_settlement::database::ledger_repository::{LedgerEntryType, LedgerStatus};
use marketplace_settlement::database::webhook_repository::WebhookEventStore;
use marketplace_settlement::payments::signature::{sign_header, SIGNATURE_HEADER};
use marketplace_settlement::payments::PaymentStatus;
use marketplace_settlement::services::{
    LedgerService, PaymentNotification, WebhookOutcome, WebhookProcessorError,
};
use serde_json::{json, Value as JsonValue};
use std::sync::Arc;
use tower::ServiceExt;

fn event(id: &str, event_type: &str, object: JsonValue) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "id": id,
        "type": event_type,
        "data": { "object": object }
    }))
    .unwrap()
}

#[tokio::test]
async fn succeeded_event_completes_payment_and_duplicate_is_skipped() {
    let env = TestEnv::new().await;
    let handle = env
        .service
        .create_payment_intent(env.contract_payment("1000"))
        .await
        .unwrap();

    let body = succeeded_event("evt_1", &handle.intent_id, "ch_1");
    let first = env
        .processor
        .process(&body, Some(&signature(&body)))
        .await
        .unwrap();
    assert!(matches!(first, WebhookOutcome::Processed { .. }));

    let second = env
        .processor
        .process(&body, Some(&signature(&body)))
        .await
        .unwrap();
    assert!(matches!(second, WebhookOutcome::Skipped { .. }));

    let payment = env.service.get_payment(handle.payment_id).await.unwrap();
    assert_eq!(payment.status, PaymentStatus::Completed);
    assert_eq!(payment.gateway_charge_id.as_deref(), Some("ch_1"));
    assert_eq!(env.payee_pending_balance().await, money("1000"));
    assert!(env.events.find("evt_1").await.unwrap().is_some());
}

#[tokio::test]
async fn success_for_already_completed_payment_is_a_no_op() {
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

    // Same intent, different event id: the gateway sends both
    // payment_intent.succeeded and charge.succeeded.
    let body = event(
        "evt_charge",
        "charge.succeeded",
        json!({ "id": "ch_1", "payment_intent": handle.intent_id }),
    );
    env.processor
        .process(&body, Some(&signature(&body)))
        .await
        .unwrap();

    assert_eq!(env.payee_pending_balance().await, money("1000"));
}

#[tokio::test]
async fn missing_or_invalid_signature_is_rejected() {
    let env = TestEnv::new().await;
    let body = succeeded_event("evt_sig", "pi_x", "ch_x");

    let err = env.processor.process(&body, None).await.unwrap_err();
    assert!(matches!(err, WebhookProcessorError::InvalidSignature(_)));
    assert!(err.is_client_error());

    let forged = sign_header("whsec_wrong", Utc::now().timestamp(), &body).unwrap();
    let err = env.processor.process(&body, Some(&forged)).await.unwrap_err();
    assert!(matches!(err, WebhookProcessorError::InvalidSignature(_)));

    assert!(env.events.find("evt_sig").await.unwrap().is_none());
}

#[tokio::test]
async fn tampered_body_is_rejected() {
    let env = TestEnv::new().await;
    let handle = env
        .service
        .create_payment_intent(env.contract_payment("1000"))
        .await
        .unwrap();

    let original = succeeded_event("evt_t", &handle.intent_id, "ch_1");
    let header = signature(&original);
    let tampered = succeeded_event("evt_t", &handle.intent_id, "ch_attacker");

    let err = env
        .processor
        .process(&tampered, Some(&header))
        .await
        .unwrap_err();
    assert!(matches!(err, WebhookProcessorError::InvalidSignature(_)));

    let payment = env.service.get_payment(handle.payment_id).await.unwrap();
    assert_eq!(payment.status, PaymentStatus::Pending);
}

#[tokio::test]
async fn stale_timestamp_is_rejected() {
    let env = TestEnv::new().await;
    let body = succeeded_event("evt_old", "pi_x", "ch_x");
    let header = sign_header(WEBHOOK_SECRET, Utc::now().timestamp() - 3_600, &body).unwrap();

    let err = env.processor.process(&body, Some(&header)).await.unwrap_err();
    assert!(matches!(err, WebhookProcessorError::InvalidSignature(_)));
}

#[tokio::test]
async fn malformed_payload_is_a_client_error() {
    let env = TestEnv::new().await;
    let body = br#"{"type":"payment_intent.succeeded"}"#.to_vec();

    let err = env
        .processor
        .process(&body, Some(&signature(&body)))
        .await
        .unwrap_err();
    assert!(matches!(err, WebhookProcessorError::MalformedPayload(_)));
    assert!(err.is_client_error());
}

#[tokio::test]
async fn handler_failure_leaves_event_unrecorded() {
    let env = TestEnv::new().await;
    // Carries our payment reference but no record exists yet.
    let body = event(
        "evt_early",
        "payment_intent.succeeded",
        json!({
            "id": "pi_not_yet_recorded",
            "latest_charge": "ch_9",
            "metadata": { "payment_reference": "f2b1" }
        }),
    );

    let err = env
        .processor
        .process(&body, Some(&signature(&body)))
        .await
        .unwrap_err();
    assert!(matches!(err, WebhookProcessorError::UnknownPayment(_)));
    assert!(!err.is_client_error());
    assert!(env.events.find("evt_early").await.unwrap().is_none());
}

#[tokio::test]
async fn foreign_intent_is_acknowledged() {
    let env = TestEnv::new().await;
    let body = succeeded_event("evt_foreign", "pi_from_another_system", "ch_1");

    let outcome = env
        .processor
        .process(&body, Some(&signature(&body)))
        .await
        .unwrap();
    assert!(matches!(outcome, WebhookOutcome::Processed { .. }));
}

#[tokio::test]
async fn payment_failed_event_fails_payment_with_reason() {
    let env = TestEnv::new().await;
    let handle = env
        .service
        .create_payment_intent(env.contract_payment("1000"))
        .await
        .unwrap();

    let body = event(
        "evt_fail",
        "payment_intent.payment_failed",
        json!({
            "id": handle.intent_id,
            "last_payment_error": { "message": "Your card has insufficient funds." }
        }),
    );
    env.processor
        .process(&body, Some(&signature(&body)))
        .await
        .unwrap();

    let payment = env.service.get_payment(handle.payment_id).await.unwrap();
    assert_eq!(payment.status, PaymentStatus::Failed);
    assert_eq!(
        payment.error_message.as_deref(),
        Some("Your card has insufficient funds.")
    );
}

#[tokio::test]
async fn late_failure_after_completion_is_acknowledged() {
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

    let body = event(
        "evt_late",
        "payment_intent.canceled",
        json!({ "id": handle.intent_id }),
    );
    let outcome = env
        .processor
        .process(&body, Some(&signature(&body)))
        .await
        .unwrap();
    assert!(matches!(outcome, WebhookOutcome::Processed { .. }));

    let payment = env.service.get_payment(handle.payment_id).await.unwrap();
    assert_eq!(payment.status, PaymentStatus::Completed);
}

#[tokio::test]
async fn late_success_for_replaced_intent_completes_payment() {
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

    let body = succeeded_event("evt_late_success", &handle.intent_id, "ch_old");
    let outcome = env
        .processor
        .process(&body, Some(&signature(&body)))
        .await
        .unwrap();
    assert!(matches!(outcome, WebhookOutcome::Processed { .. }));

    let payment = env.service.get_payment(handle.payment_id).await.unwrap();
    assert_eq!(payment.status, PaymentStatus::Completed);
    assert_eq!(payment.gateway_charge_id.as_deref(), Some("ch_old"));
    assert_eq!(env.payee_pending_balance().await, money("1000"));
    assert!(env
        .gateway
        .canceled_intents()
        .await
        .contains(&retried.intent_id));
}

#[tokio::test]
async fn cancellation_of_replaced_intent_leaves_retry_pending() {
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
    env.service.retry_payment(handle.payment_id).await.unwrap();

    let body = event(
        "evt_old_canceled",
        "payment_intent.canceled",
        json!({ "id": handle.intent_id }),
    );
    let outcome = env
        .processor
        .process(&body, Some(&signature(&body)))
        .await
        .unwrap();
    assert!(matches!(outcome, WebhookOutcome::Processed { .. }));

    let payment = env.service.get_payment(handle.payment_id).await.unwrap();
    assert_eq!(payment.status, PaymentStatus::Pending);
    assert!(payment.error_message.is_none());
}

#[tokio::test]
async fn refund_event_records_refund_without_calling_gateway() {
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

    let body = event(
        "evt_refund",
        "charge.refunded",
        json!({
            "id": "ch_1",
            "payment_intent": handle.intent_id,
            "amount_refunded": 50_000
        }),
    );
    env.processor
        .process(&body, Some(&signature(&body)))
        .await
        .unwrap();

    let payment = env.service.get_payment(handle.payment_id).await.unwrap();
    assert_eq!(payment.status, PaymentStatus::Refunded);
    assert_eq!(payment.refunded_amount, Some(money("500")));
    assert!(env.gateway.refunds().await.is_empty());
    assert_eq!(env.payee_pending_balance().await, money("500"));
}

#[tokio::test]
async fn payout_paid_settles_pending_withdrawal() {
    let env = TestEnv::new().await;
    let ledger = LedgerService::new(env.ledger.clone());
    ledger
        .record_pending_withdrawal(
            env.contract.freelancer_id,
            money("250"),
            "USD",
            "tr_42".to_string(),
            None,
        )
        .await
        .unwrap();

    let body = event("evt_tr", "transfer.paid", json!({ "id": "tr_42" }));
    env.processor
        .process(&body, Some(&signature(&body)))
        .await
        .unwrap();

    let withdrawals: Vec<_> = env
        .ledger
        .all()
        .await
        .into_iter()
        .filter(|e| e.entry_type == LedgerEntryType::Withdrawal)
        .collect();
    assert_eq!(withdrawals.len(), 1);
    assert_eq!(withdrawals[0].status, LedgerStatus::Completed);
}

#[tokio::test]
async fn dispute_event_notifies() {
    let env = TestEnv::new().await;
    let body = event(
        "evt_dispute",
        "charge.dispute.created",
        json!({ "id": "dp_1", "charge": "ch_7", "reason": "fraudulent" }),
    );
    env.processor
        .process(&body, Some(&signature(&body)))
        .await
        .unwrap();

    let sent = env.notifier.sent().await;
    assert_eq!(
        sent,
        vec![PaymentNotification::DisputeOpened {
            charge_id: "ch_7".to_string(),
            payment_id: None,
            reason: Some("fraudulent".to_string()),
        }]
    );
}

#[tokio::test]
async fn unknown_event_type_is_recorded_and_ignored() {
    let env = TestEnv::new().await;
    let body = event("evt_misc", "customer.created", json!({ "id": "cus_1" }));
    let outcome = env
        .processor
        .process(&body, Some(&signature(&body)))
        .await
        .unwrap();
    assert!(matches!(outcome, WebhookOutcome::Processed { .. }));
    assert!(env.events.find("evt_misc").await.unwrap().is_some());
}

// ---------------------------------------------------------------------------
// HTTP route
// ---------------------------------------------------------------------------

fn app(env: TestEnv) -> axum::Router {
    let health = HealthChecker::new(None, env.failed_updates.clone(), 5);
    api::router(Arc::new(env.processor), health)
}

fn webhook_request(body: Vec<u8>, header: Option<String>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/webhooks/gateway")
        .header("content-type", "application/json");
    if let Some(header) = header {
        builder = builder.header(SIGNATURE_HEADER, header);
    }
    builder.body(Body::from(body)).unwrap()
}

async fn json_body(response: axum::response::Response) -> JsonValue {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn route_acknowledges_and_flags_duplicates() {
    let env = TestEnv::new().await;
    let body = event("evt_http", "account.updated", json!({ "id": "acct_1" }));
    let router = app(env);

    let response = router
        .clone()
        .oneshot(webhook_request(body.clone(), Some(signature(&body))))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-request-id"));
    assert_eq!(json_body(response).await, json!({ "received": true }));

    let response = router
        .oneshot(webhook_request(body.clone(), Some(signature(&body))))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        json_body(response).await,
        json!({ "received": true, "skipped": true })
    );
}

#[tokio::test]
async fn route_rejects_bad_signature_with_400() {
    let env = TestEnv::new().await;
    let body = event("evt_bad", "account.updated", json!({ "id": "acct_1" }));

    let response = app(env)
        .oneshot(webhook_request(body, Some("t=1,v1=deadbeef".to_string())))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["error"], "INVALID_SIGNATURE");
}

#[tokio::test]
async fn route_answers_500_when_handler_fails() {
    let env = TestEnv::new().await;
    let body = event(
        "evt_500",
        "payment_intent.succeeded",
        json!({ "id": "pi_missing", "metadata": { "payment_reference": "x" } }),
    );

    let response = app(env)
        .oneshot(webhook_request(body.clone(), Some(signature(&body))))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn health_route_reports_healthy() {
    let env = TestEnv::new().await;
    let response = app(env)
        .oneshot(
            Request::builder()
                .uri("/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["status"], "Healthy");
}
