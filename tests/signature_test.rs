//! Bank transfer webhooks end to end: HMAC-SHA512 header signature through
//! the webhook processor into the ledger.

mod common;

use serde_json::json;
use std::sync::Arc;

use common::{payment_request, Harness};
use homestay_payments::domain::payment::PaymentStatus;
use homestay_payments::domain::transaction::TransactionStatus;
use homestay_payments::payments::provider::PaymentGateway;
use homestay_payments::payments::providers::{BankTransferConfig, BankTransferGateway};
use homestay_payments::payments::types::ProviderName;
use homestay_payments::services::webhook_processor::{WebhookDisposition, WebhookProcessor};

fn bank() -> BankTransferGateway {
    BankTransferGateway::new(BankTransferConfig {
        bank_bin: "970436".to_string(),
        account_number: "0011001234567".to_string(),
        account_name: "HOMESTAY SA PA".to_string(),
        webhook_secret: "bank-secret".to_string(),
        ..BankTransferConfig::default()
    })
}

async fn setup() -> (Harness, WebhookProcessor, String) {
    let harness = Harness::new(vec![Arc::new(bank()) as Arc<dyn PaymentGateway>]);
    let processor = WebhookProcessor::new(harness.orchestrator.clone());
    let (customer, booking) = harness.booking(1_200_000).await;
    let initiation = harness
        .orchestrator
        .create_payment(
            customer,
            payment_request(booking, 1_200_000, ProviderName::BankTransfer),
        )
        .await
        .unwrap();
    assert!(initiation
        .pay_url
        .as_deref()
        .unwrap()
        .contains(&initiation.payment.order_id));
    assert_eq!(initiation.fees.total_fee, 3_300);
    (harness, processor, initiation.payment.order_id)
}

fn credit(order_id: &str, amount: i64) -> serde_json::Value {
    json!({
        "orderId": order_id,
        "amount": amount,
        "transId": "FT2610170001",
        "resultCode": 0,
        "message": "credited"
    })
}

#[tokio::test]
async fn test_signed_bank_webhook_settles_payment() {
    let (harness, processor, order_id) = setup().await;
    let payload = credit(&order_id, 1_200_000);
    let signature = bank().sign_webhook(&payload).unwrap();

    let receipt = processor
        .handle("bank_transfer", Some(&signature), &payload)
        .await;
    assert_eq!(receipt.status_code, 200);
    assert_eq!(
        receipt.disposition,
        Some(WebhookDisposition::Settled {
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
}

#[tokio::test]
async fn test_tampered_bank_webhook_is_rejected() {
    let (harness, processor, order_id) = setup().await;
    let signed = credit(&order_id, 1_200_000);
    let signature = bank().sign_webhook(&signed).unwrap();

    let tampered = credit(&order_id, 12_000_000);
    let receipt = processor
        .handle("bank-transfer", Some(&signature), &tampered)
        .await;
    assert_eq!(receipt.status_code, 400);

    let missing = processor.handle("bank_transfer", None, &signed).await;
    assert_eq!(missing.status_code, 400);

    let other_secret = BankTransferGateway::new(BankTransferConfig {
        webhook_secret: "someone-else".to_string(),
        ..BankTransferConfig::default()
    })
    .sign_webhook(&signed)
    .unwrap();
    let forged = processor
        .handle("bank_transfer", Some(&other_secret), &signed)
        .await;
    assert_eq!(forged.status_code, 400);

    let transactions = harness.store.transactions().await;
    assert_eq!(transactions[0].status, TransactionStatus::Pending);
}
