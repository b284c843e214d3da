mod common;

use chrono::{Duration, Utc};
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use common::{payment_request, Harness, ScriptedGateway};
use homestay_payments::domain::risk::{RiskCheck, RiskLevel};
use homestay_payments::domain::transaction::AttemptContext;
use homestay_payments::error::ErrorCode;
use homestay_payments::payments::types::{NormalizedGatewayResponse, ProviderName};
use homestay_payments::services::risk_engine::RiskInput;
use homestay_payments::services::{OrchestratorConfig, RiskConfig, RiskEngine};

fn input(amount: i64, context: AttemptContext) -> RiskInput {
    RiskInput {
        amount,
        method: ProviderName::Momo,
        booking_id: Uuid::new_v4(),
        context,
    }
}

#[tokio::test]
async fn test_daily_limit_counts_completed_payments_only() {
    let harness = Harness::new(vec![ScriptedGateway::accepting(ProviderName::Cash)]);
    let customer = Uuid::new_v4();
    let (_, first_booking) = harness.booking_for(customer, 48_000_000).await;
    let (_, second_booking) = harness.booking_for(customer, 10_000_000).await;

    let paid = harness
        .orchestrator
        .create_payment(customer, payment_request(first_booking, 48_000_000, ProviderName::Cash))
        .await
        .unwrap();

    // Pending money does not count toward the day yet
    harness
        .orchestrator
        .create_payment(customer, payment_request(second_booking, 3_000_000, ProviderName::Cash))
        .await
        .unwrap();

    harness
        .orchestrator
        .confirm_offline_payment(paid.payment.id, Some("RCPT-1".to_string()))
        .await
        .unwrap();

    let err = harness
        .orchestrator
        .create_payment(customer, payment_request(second_booking, 2_500_000, ProviderName::Cash))
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), ErrorCode::PaymentBlocked);
    let details = err.details().unwrap();
    assert_eq!(details["blocking_failures"], json!(["daily_limit"]));

    let allowed = harness
        .orchestrator
        .create_payment(customer, payment_request(second_booking, 1_000_000, ProviderName::Cash))
        .await
        .unwrap();
    assert_eq!(allowed.risk.risk_level, RiskLevel::Low);
    assert!(allowed.risk.approved);
}

#[tokio::test]
async fn test_single_payment_above_ceiling_is_blocked() {
    let harness = Harness::new(vec![ScriptedGateway::accepting(ProviderName::Cash)]);
    let (customer, booking) = harness.booking(90_000_000).await;

    let err = harness
        .orchestrator
        .create_payment(customer, payment_request(booking, 60_000_000, ProviderName::Cash))
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), ErrorCode::PaymentBlocked);
    assert_eq!(err.status_code(), 422);
    assert!(harness.store.transactions().await.is_empty());
}

#[tokio::test]
async fn test_repeated_failures_raise_the_score() {
    let gateway = ScriptedGateway::accepting(ProviderName::Momo);
    gateway.answer_create(NormalizedGatewayResponse::rejected(
        Some(1001),
        "Insufficient wallet balance".to_string(),
        json!({ "resultCode": 1001 }),
    ));
    let harness = Harness::new(vec![gateway]);
    let (customer, booking) = harness.booking(10_000_000).await;

    for amount in [1_000_000, 1_100_000, 1_200_000] {
        let err = harness
            .orchestrator
            .create_payment(customer, payment_request(booking, amount, ProviderName::Momo))
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::GatewayRejected);
    }

    let engine = RiskEngine::new(Arc::new(harness.store.clone()), RiskConfig::default());
    let assessment = engine
        .assess(customer, &input(1_300_000, AttemptContext::default()))
        .await
        .unwrap();

    assert_eq!(
        assessment.failed_checks(),
        vec![RiskCheck::Velocity, RiskCheck::FailedAttempts]
    );
    // (20 + 35) / 160
    assert_eq!(assessment.risk_score, 34);
    assert_eq!(assessment.risk_level, RiskLevel::Medium);
    assert!(assessment.approved);
    assert!(assessment.blocking_failures.is_empty());
}

#[tokio::test]
async fn test_score_above_medium_threshold_blocks_without_hard_rule() {
    let gateway = ScriptedGateway::accepting(ProviderName::Momo);
    gateway.answer_create(NormalizedGatewayResponse::rejected(
        Some(1001),
        "Insufficient wallet balance".to_string(),
        json!({ "resultCode": 1001 }),
    ));
    let risk = RiskConfig {
        medium_threshold: 30,
        ..RiskConfig::default()
    };
    let harness = Harness::with_config(vec![gateway], risk, OrchestratorConfig::default());
    let (customer, booking) = harness.booking(10_000_000).await;

    for amount in [1_000_000, 1_100_000, 1_200_000] {
        harness
            .orchestrator
            .create_payment(customer, payment_request(booking, amount, ProviderName::Momo))
            .await
            .unwrap_err();
    }

    let err = harness
        .orchestrator
        .create_payment(customer, payment_request(booking, 1_300_000, ProviderName::Momo))
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), ErrorCode::PaymentBlocked);
    let details = err.details().unwrap();
    assert_eq!(details["risk_level"], "high");
    assert_eq!(details["blocking_failures"], json!([]));
}

#[tokio::test]
async fn test_shared_ip_during_off_hours_is_suspicious() {
    let harness = Harness::new(vec![ScriptedGateway::accepting(ProviderName::Momo)]);
    let shared_ip = "198.51.100.23";

    for _ in 0..3 {
        let (other, booking) = harness.booking(5_000_000).await;
        let mut request = payment_request(booking, 1_000_000, ProviderName::Momo);
        request.context.client_ip = Some(shared_ip.to_string());
        harness.orchestrator.create_payment(other, request).await.unwrap();
    }

    // 18:00 UTC is 01:00 at UTC+7
    let now = Utc::now();
    let mut at = now.date_naive().and_hms_opt(18, 0, 0).unwrap().and_utc();
    if at < now {
        at += Duration::days(1);
    }

    let engine = RiskEngine::new(Arc::new(harness.store.clone()), RiskConfig::default());
    let context = AttemptContext {
        client_ip: Some(shared_ip.to_string()),
        device_id: None,
    };
    let assessment = engine
        .assess_at(Uuid::new_v4(), &input(1_000_000, context.clone()), at)
        .await
        .unwrap();
    assert_eq!(assessment.failed_checks(), vec![RiskCheck::SuspiciousActivity]);
    assert!(assessment.approved);

    // Same IP at local noon is fine
    let noon = at - Duration::hours(13);
    let assessment = engine
        .assess_at(Uuid::new_v4(), &input(1_000_000, context), noon)
        .await
        .unwrap();
    assert!(assessment.failed_checks().is_empty());
}
