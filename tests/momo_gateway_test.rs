//! MoMo wire format against a mock endpoint.

use hmac::{Hmac, Mac};
use mockito::{Matcher, Server};
use serde_json::json;
use sha2::Sha256;

use homestay_payments::domain::transaction::GatewayOutcome;
use homestay_payments::payments::provider::PaymentGateway;
use homestay_payments::payments::providers::{MomoConfig, MomoGateway};
use homestay_payments::payments::types::{
    CallbackUrls, GatewayPaymentState, PaymentRequest, RefundRequest, StatusQuery,
};

type HmacSha256 = Hmac<Sha256>;

const REDIRECT: &str = "https://homestay.example.com/payments/result";
const IPN: &str = "https://api.homestay.example.com/webhooks/momo";

fn sign(raw: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(b"secret").unwrap();
    mac.update(raw.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

fn gateway(endpoint: &str) -> MomoGateway {
    MomoGateway::new(MomoConfig {
        partner_code: "MOMOTEST".to_string(),
        access_key: "access".to_string(),
        secret_key: "secret".to_string(),
        endpoint: endpoint.to_string(),
        timeout_secs: 5,
        query_max_retries: 0,
        ..MomoConfig::default()
    })
    .unwrap()
}

fn request() -> PaymentRequest {
    PaymentRequest {
        order_id: "HS1001".to_string(),
        request_id: "REQ1001".to_string(),
        amount: 500_000,
        order_info: "Room 3, two nights".to_string(),
        callback_urls: CallbackUrls {
            redirect_url: REDIRECT.to_string(),
            ipn_url: IPN.to_string(),
        },
        extra_data: None,
    }
}

#[tokio::test]
async fn test_create_sends_signed_body_and_reads_pay_url() {
    let mut server = Server::new_async().await;
    let expected_signature = sign(&format!(
        "accessKey=access&amount=500000&extraData=&ipnUrl={}&orderId=HS1001&orderInfo=Room 3, two nights&partnerCode=MOMOTEST&redirectUrl={}&requestId=REQ1001&requestType=captureWallet",
        IPN, REDIRECT
    ));
    let mock = server
        .mock("POST", "/v2/gateway/api/create")
        .match_header("content-type", "application/json")
        .match_body(Matcher::PartialJson(json!({
            "partnerCode": "MOMOTEST",
            "orderId": "HS1001",
            "amount": 500000,
            "requestType": "captureWallet",
            "signature": expected_signature,
        })))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            json!({
                "partnerCode": "MOMOTEST",
                "orderId": "HS1001",
                "resultCode": 0,
                "message": "Successful.",
                "payUrl": "https://test-payment.momo.vn/pay/HS1001",
                "deeplink": "momo://pay?HS1001",
                "qrCodeUrl": "https://test-payment.momo.vn/qr/HS1001"
            })
            .to_string(),
        )
        .create_async()
        .await;

    let response = gateway(&server.url()).create_payment_request(request()).await;

    mock.assert_async().await;
    assert_eq!(response.outcome, GatewayOutcome::Accepted);
    assert_eq!(
        response.pay_url.as_deref(),
        Some("https://test-payment.momo.vn/pay/HS1001")
    );
    assert_eq!(response.deeplink.as_deref(), Some("momo://pay?HS1001"));
}

#[tokio::test]
async fn test_create_with_error_result_code_is_rejected() {
    let mut server = Server::new_async().await;
    let _mock = server
        .mock("POST", "/v2/gateway/api/create")
        .with_status(200)
        .with_body(json!({ "resultCode": 22, "message": "Amount out of range" }).to_string())
        .create_async()
        .await;

    let response = gateway(&server.url()).create_payment_request(request()).await;
    assert_eq!(response.outcome, GatewayOutcome::Rejected);
    assert_eq!(response.result_code, Some(22));
    assert_eq!(response.failure_reason(), "Amount out of range");
}

#[tokio::test]
async fn test_create_server_error_is_unknown_and_not_retried() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/v2/gateway/api/create")
        .with_status(502)
        .with_body("bad gateway")
        .expect(1)
        .create_async()
        .await;

    let response = gateway(&server.url()).create_payment_request(request()).await;
    mock.assert_async().await;
    assert_eq!(response.outcome, GatewayOutcome::Unknown);
}

#[tokio::test]
async fn test_create_client_error_is_rejected() {
    let mut server = Server::new_async().await;
    let _mock = server
        .mock("POST", "/v2/gateway/api/create")
        .with_status(400)
        .with_body("invalid partner")
        .create_async()
        .await;

    let response = gateway(&server.url()).create_payment_request(request()).await;
    assert_eq!(response.outcome, GatewayOutcome::Rejected);
}

#[tokio::test]
async fn test_query_maps_result_codes() {
    let cases = [
        (0, GatewayPaymentState::Succeeded),
        (1000, GatewayPaymentState::Pending),
        (1006, GatewayPaymentState::Failed),
    ];
    for (code, expected) in cases {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/v2/gateway/api/query")
            .match_body(Matcher::PartialJson(json!({
                "orderId": "HS1001",
                "signature": sign("accessKey=access&orderId=HS1001&partnerCode=MOMOTEST&requestId=REQ1001"),
            })))
            .with_status(200)
            .with_body(json!({ "resultCode": code, "message": "status", "transId": 4088878653u64 }).to_string())
            .create_async()
            .await;

        let status = gateway(&server.url())
            .query_status(StatusQuery {
                order_id: "HS1001".to_string(),
                request_id: "REQ1001".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(status.state, expected);
        assert_eq!(status.provider_transaction_id.as_deref(), Some("4088878653"));
    }
}

#[tokio::test]
async fn test_refund_requires_original_trans_id() {
    let server = Server::new_async().await;
    let response = gateway(&server.url())
        .refund(RefundRequest {
            order_id: "RF1".to_string(),
            request_id: "RFQ1".to_string(),
            amount: 100_000,
            provider_transaction_id: None,
            description: "early checkout".to_string(),
        })
        .await;
    assert_eq!(response.outcome, GatewayOutcome::Rejected);
}

#[tokio::test]
async fn test_refund_sends_numeric_trans_id() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/v2/gateway/api/refund")
        .match_body(Matcher::PartialJson(json!({
            "orderId": "RF1",
            "transId": 4088878653u64,
            "amount": 100000,
        })))
        .with_status(200)
        .with_body(json!({ "resultCode": 0, "message": "Refunded", "transId": 4099000001u64 }).to_string())
        .create_async()
        .await;

    let response = gateway(&server.url())
        .refund(RefundRequest {
            order_id: "RF1".to_string(),
            request_id: "RFQ1".to_string(),
            amount: 100_000,
            provider_transaction_id: Some("4088878653".to_string()),
            description: "early checkout".to_string(),
        })
        .await;
    mock.assert_async().await;
    assert_eq!(response.outcome, GatewayOutcome::Accepted);
    assert_eq!(response.provider_transaction_id.as_deref(), Some("4099000001"));
}

#[test]
fn test_ipn_signature_checked_over_documented_fields() {
    let gateway = gateway("http://unused");
    let mut payload = json!({
        "partnerCode": "MOMOTEST",
        "orderId": "HS1001",
        "requestId": "REQ1001",
        "amount": 500000,
        "orderInfo": "Room 3",
        "orderType": "momo_wallet",
        "transId": 4088878653u64,
        "resultCode": 0,
        "message": "Successful.",
        "payType": "qr",
        "responseTime": 1721720663942u64,
        "extraData": ""
    });
    payload["signature"] = sign(
        "accessKey=access&amount=500000&extraData=&message=Successful.&orderId=HS1001&orderInfo=Room 3&orderType=momo_wallet&partnerCode=MOMOTEST&payType=qr&requestId=REQ1001&responseTime=1721720663942&resultCode=0&transId=4088878653",
    )
    .into();

    assert!(gateway.verify_callback(&payload, None).valid);

    payload["amount"] = 5_000_000.into();
    assert!(!gateway.verify_callback(&payload, None).valid);
}
