//! Callback handling: signature gate, settlement, replays and the HTTP route.

mod common;

use axum::body::Body;
use http::{Request, StatusCode};
use std::sync::Arc;
use tower::util::ServiceExt;

use common::{payment_request, Harness, ScriptedGateway};
use homestay_payments::api::{self, AppState};
use homestay_payments::domain::booking::BookingStatus;
use homestay_payments::domain::payment::PaymentStatus;
use homestay_payments::domain::transaction::TransactionStatus;
use homestay_payments::health::HealthChecker;
use homestay_payments::payments::types::ProviderName;
use homestay_payments::services::notification::NotificationKind;
use homestay_payments::services::webhook_processor::{WebhookDisposition, WebhookProcessor};

async fn pending_momo_order(harness: &Harness, amount: i64) -> String {
    let (customer, booking) = harness.booking(amount).await;
    harness
        .orchestrator
        .create_payment(customer, payment_request(booking, amount, ProviderName::Momo))
        .await
        .unwrap()
        .payment
        .order_id
}

#[tokio::test]
async fn test_success_callback_settles_once_and_replay_is_acknowledged() {
    let harness = Harness::new(vec![ScriptedGateway::accepting(ProviderName::Momo)]);
    let processor = WebhookProcessor::new(harness.orchestrator.clone());
    let order_id = pending_momo_order(&harness, 2_500_000).await;
    let payload = ScriptedGateway::callback(&order_id, 2_500_000, 0);

    let first = processor.handle("momo", None, &payload).await;
    assert_eq!(first.status_code, 200);
    assert_eq!(first.ack.result_code, 0);
    assert_eq!(
        first.disposition,
        Some(WebhookDisposition::Settled {
            order_id: order_id.clone(),
            status: TransactionStatus::Completed,
        })
    );

    let replay = processor.handle("momo", None, &payload).await;
    assert_eq!(replay.status_code, 200);
    assert_eq!(
        replay.disposition,
        Some(WebhookDisposition::Replayed {
            order_id: order_id.clone(),
            status: TransactionStatus::Completed,
        })
    );

    let payment = harness
        .orchestrator
        .ledger()
        .find_payment_by_order_id(&order_id)
        .await
        .unwrap();
    assert_eq!(payment.status, PaymentStatus::Completed);
    assert_eq!(payment.external_transaction_id.as_deref(), Some("GW-TXN-777"));
    assert_eq!(
        harness.store.booking(payment.booking_id).await.unwrap().status,
        BookingStatus::Confirmed
    );
    assert_eq!(harness.notifier.count(NotificationKind::PaymentSucceeded), 1);
}

#[tokio::test]
async fn test_failure_callback_fails_payment() {
    let harness = Harness::new(vec![ScriptedGateway::accepting(ProviderName::Momo)]);
    let processor = WebhookProcessor::new(harness.orchestrator.clone());
    let order_id = pending_momo_order(&harness, 800_000).await;

    let receipt = processor
        .handle("momo", None, &ScriptedGateway::callback(&order_id, 800_000, 1006))
        .await;
    assert_eq!(receipt.status_code, 200);
    assert_eq!(
        receipt.disposition,
        Some(WebhookDisposition::Settled {
            order_id: order_id.clone(),
            status: TransactionStatus::Failed,
        })
    );

    let payment = harness
        .orchestrator
        .ledger()
        .find_payment_by_order_id(&order_id)
        .await
        .unwrap();
    assert_eq!(payment.status, PaymentStatus::Failed);
    assert_eq!(harness.notifier.count(NotificationKind::PaymentFailed), 1);
}

#[tokio::test]
async fn test_amount_mismatch_fails_the_transaction() {
    let harness = Harness::new(vec![ScriptedGateway::accepting(ProviderName::Momo)]);
    let processor = WebhookProcessor::new(harness.orchestrator.clone());
    let order_id = pending_momo_order(&harness, 800_000).await;

    processor
        .handle("momo", None, &ScriptedGateway::callback(&order_id, 1_000, 0))
        .await;

    let payment = harness
        .orchestrator
        .ledger()
        .find_payment_by_order_id(&order_id)
        .await
        .unwrap();
    let transaction = harness
        .orchestrator
        .ledger()
        .payment_transaction(payment.id)
        .await
        .unwrap();
    assert_eq!(transaction.status, TransactionStatus::Failed);
    assert!(transaction
        .failure_reason
        .unwrap()
        .contains("amount mismatch"));
}

#[tokio::test]
async fn test_invalid_signature_is_refused_without_touching_the_ledger() {
    let harness = Harness::new(vec![ScriptedGateway::accepting(ProviderName::Momo)]);
    let processor = WebhookProcessor::new(harness.orchestrator.clone());
    let order_id = pending_momo_order(&harness, 800_000).await;

    let mut payload = ScriptedGateway::callback(&order_id, 800_000, 0);
    payload["signature"] = "forged".into();
    let receipt = processor.handle("momo", None, &payload).await;

    assert_eq!(receipt.status_code, 400);
    assert_eq!(receipt.ack.result_code, 1);
    assert!(receipt.disposition.is_none());
    let transactions = harness.store.transactions().await;
    assert_eq!(transactions[0].status, TransactionStatus::Pending);
}

#[tokio::test]
async fn test_unknown_provider_and_unknown_order() {
    let harness = Harness::new(vec![ScriptedGateway::accepting(ProviderName::Momo)]);
    let processor = WebhookProcessor::new(harness.orchestrator.clone());
    let payload = ScriptedGateway::callback("HS-DOES-NOT-EXIST", 1_000, 0);

    assert_eq!(processor.handle("paypal", None, &payload).await.status_code, 404);
    // Known name but not enabled in this deployment
    assert_eq!(processor.handle("cash", None, &payload).await.status_code, 404);

    // Verified callback for an order we never issued is acknowledged
    let receipt = processor.handle("momo", None, &payload).await;
    assert_eq!(receipt.status_code, 200);
    assert!(receipt.disposition.is_none());
}

#[tokio::test]
async fn test_webhook_route_answers_with_provider_ack() {
    let harness = Harness::new(vec![ScriptedGateway::accepting(ProviderName::Momo)]);
    let order_id = pending_momo_order(&harness, 800_000).await;
    let app = api::router(AppState {
        orchestrator: harness.orchestrator.clone(),
        webhooks: Arc::new(WebhookProcessor::new(harness.orchestrator.clone())),
        health: HealthChecker::new(None, Arc::new(harness.orchestrator.gateways().clone())),
    });

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/webhooks/momo")
                .header("content-type", "application/json")
                .body(Body::from(
                    ScriptedGateway::callback(&order_id, 800_000, 0).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/webhooks/momo")
                .body(Body::from("{not json"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
