use crate::config::{required_var, ConfigError};
use crate::payments::error::{PaymentError, PaymentResult};
use crate::payments::provider::PaymentGateway;
use crate::payments::signature::{json_field, SignatureLayout, SignatureVerifier};
use crate::payments::types::{
    CallbackEvent, CallbackVerification, NormalizedGatewayResponse, PaymentRequest, ProviderName,
    RefundRequest, StatusQuery, StatusResponse,
};
use crate::payments::utils::mask_signature;
use async_trait::async_trait;
use reqwest::Url;
use serde_json::Value as JsonValue;
use tracing::{info, warn};

pub const SIGNATURE_HEADER: &str = "x-bank-signature";

const WEBHOOK_LAYOUT: SignatureLayout = SignatureLayout {
    name: "bank_transfer.webhook",
    fields: &["amount", "message", "orderId", "resultCode", "transId"],
};

#[derive(Debug, Clone)]
pub struct BankTransferConfig {
    pub bank_bin: String,
    pub account_number: String,
    pub account_name: String,
    pub webhook_secret: String,
    pub qr_base_url: String,
    pub qr_template: String,
}

impl Default for BankTransferConfig {
    fn default() -> Self {
        Self {
            bank_bin: String::new(),
            account_number: String::new(),
            account_name: String::new(),
            webhook_secret: String::new(),
            qr_base_url: "https://img.vietqr.io/image".to_string(),
            qr_template: "compact2".to_string(),
        }
    }
}

impl BankTransferConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        Ok(Self {
            bank_bin: required_var("BANK_TRANSFER_BANK_BIN")?,
            account_number: required_var("BANK_TRANSFER_ACCOUNT_NUMBER")?,
            account_name: required_var("BANK_TRANSFER_ACCOUNT_NAME")?,
            webhook_secret: required_var("BANK_TRANSFER_WEBHOOK_SECRET")?,
            qr_base_url: std::env::var("BANK_TRANSFER_QR_BASE_URL").unwrap_or(defaults.qr_base_url),
            qr_template: std::env::var("BANK_TRANSFER_QR_TEMPLATE").unwrap_or(defaults.qr_template),
        })
    }
}

/// VietQR transfer. Creating a payment only renders a QR link carrying the
/// order id as transfer memo; the bank's webhook settles it later.
pub struct BankTransferGateway {
    config: BankTransferConfig,
    verifier: SignatureVerifier,
}

impl BankTransferGateway {
    pub fn new(config: BankTransferConfig) -> Self {
        let verifier = SignatureVerifier::hmac_sha512(config.webhook_secret.clone());
        Self { config, verifier }
    }

    fn qr_url(&self, request: &PaymentRequest) -> PaymentResult<String> {
        let base = format!(
            "{}/{}-{}-{}.png",
            self.config.qr_base_url.trim_end_matches('/'),
            self.config.bank_bin,
            self.config.account_number,
            self.config.qr_template
        );
        let amount = request.amount.to_string();
        let url = Url::parse_with_params(
            &base,
            &[
                ("amount", amount.as_str()),
                ("addInfo", request.order_id.as_str()),
                ("accountName", self.config.account_name.as_str()),
            ],
        )
        .map_err(|e| PaymentError::ValidationError {
            message: format!("invalid VietQR url: {}", e),
            field: Some("qr_base_url".to_string()),
        })?;
        Ok(url.to_string())
    }

    /// Signature the bank is expected to send for `payload`. Used by tests
    /// and tooling that replays webhooks.
    pub fn sign_webhook(&self, payload: &JsonValue) -> PaymentResult<String> {
        self.verifier
            .sign_layout(&WEBHOOK_LAYOUT, |key| json_field(payload, key))
            .map_err(|e| PaymentError::WebhookVerificationError {
                message: e.to_string(),
            })
    }
}

#[async_trait]
impl PaymentGateway for BankTransferGateway {
    fn name(&self) -> ProviderName {
        ProviderName::BankTransfer
    }

    async fn create_payment_request(&self, request: PaymentRequest) -> NormalizedGatewayResponse {
        let qr_url = match self.qr_url(&request) {
            Ok(url) => url,
            Err(err) => return NormalizedGatewayResponse::from_error(&err),
        };

        info!(order_id = %request.order_id, "bank transfer instructions issued");
        let mut response = NormalizedGatewayResponse::accepted(serde_json::json!({
            "bankBin": self.config.bank_bin,
            "accountNumber": self.config.account_number,
            "accountName": self.config.account_name,
            "amount": request.amount,
            "transferMemo": request.order_id,
        }));
        response.qr_code_url = Some(qr_url.clone());
        response.pay_url = Some(qr_url);
        response
    }

    async fn query_status(&self, _query: StatusQuery) -> PaymentResult<StatusResponse> {
        Err(PaymentError::UnsupportedOperation {
            provider: ProviderName::BankTransfer.to_string(),
            operation: "status query",
        })
    }

    /// Bank refunds are paid out by staff; the ledger entry is the record.
    async fn refund(&self, request: RefundRequest) -> NormalizedGatewayResponse {
        let mut response = NormalizedGatewayResponse::accepted(serde_json::json!({
            "mode": "manual",
            "orderId": request.order_id,
            "amount": request.amount,
        }));
        response.message = Some("manual bank refund".to_string());
        response
    }

    fn supports_status_query(&self) -> bool {
        false
    }

    fn verify_callback(
        &self,
        payload: &JsonValue,
        header_signature: Option<&str>,
    ) -> CallbackVerification {
        let Some(provided) = header_signature.filter(|s| !s.is_empty()) else {
            return CallbackVerification::invalid(format!("missing {} header", SIGNATURE_HEADER));
        };

        if self
            .verifier
            .verify_layout(&WEBHOOK_LAYOUT, |key| json_field(payload, key), provided)
        {
            CallbackVerification::valid()
        } else {
            warn!(
                signature = %mask_signature(provided),
                "bank transfer webhook signature mismatch"
            );
            CallbackVerification::invalid("invalid bank transfer signature")
        }
    }

    fn parse_callback(&self, payload: &JsonValue) -> PaymentResult<CallbackEvent> {
        let order_id = payload
            .get("orderId")
            .and_then(|v| v.as_str())
            .filter(|v| !v.is_empty())
            .ok_or(PaymentError::WebhookVerificationError {
                message: "orderId is missing".to_string(),
            })?;
        let result_code = payload
            .get("resultCode")
            .and_then(|v| v.as_i64())
            .ok_or(PaymentError::WebhookVerificationError {
                message: "resultCode is missing".to_string(),
            })?;

        Ok(CallbackEvent {
            provider: ProviderName::BankTransfer,
            order_id: order_id.to_string(),
            provider_transaction_id: json_field(payload, "transId").filter(|v| !v.is_empty()),
            amount: payload.get("amount").and_then(|v| v.as_i64()),
            result_code,
            message: payload
                .get("message")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            payload: payload.clone(),
            received_at: chrono::Utc::now().to_rfc3339(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::transaction::GatewayOutcome;
    use crate::payments::types::CallbackUrls;

    fn gateway() -> BankTransferGateway {
        BankTransferGateway::new(BankTransferConfig {
            bank_bin: "970436".to_string(),
            account_number: "0011001234567".to_string(),
            account_name: "HOMESTAY SA PA".to_string(),
            webhook_secret: "bank-secret".to_string(),
            ..BankTransferConfig::default()
        })
    }

    fn webhook() -> JsonValue {
        serde_json::json!({
            "orderId": "HS0002",
            "amount": 1200000,
            "transId": "FT2410170001",
            "resultCode": 0,
            "message": "credited"
        })
    }

    #[tokio::test]
    async fn create_returns_vietqr_link() {
        let response = gateway()
            .create_payment_request(PaymentRequest {
                order_id: "HS0002".to_string(),
                request_id: "req-2".to_string(),
                amount: 1_200_000,
                order_info: "Booking".to_string(),
                callback_urls: CallbackUrls {
                    redirect_url: String::new(),
                    ipn_url: String::new(),
                },
                extra_data: None,
            })
            .await;

        assert_eq!(response.outcome, GatewayOutcome::Accepted);
        let url = response.qr_code_url.unwrap();
        assert!(url.starts_with("https://img.vietqr.io/image/970436-0011001234567-compact2.png?"));
        assert!(url.contains("amount=1200000"));
        assert!(url.contains("addInfo=HS0002"));
        assert!(url.contains("accountName=HOMESTAY+SA+PA"));
    }

    #[test]
    fn header_signature_is_required() {
        let gateway = gateway();
        let signature = gateway.sign_webhook(&webhook()).unwrap();
        assert!(gateway.verify_callback(&webhook(), Some(&signature)).valid);
        assert!(!gateway.verify_callback(&webhook(), None).valid);
        assert!(!gateway.verify_callback(&webhook(), Some("")).valid);
    }

    #[test]
    fn tampered_amount_is_rejected() {
        let gateway = gateway();
        let signature = gateway.sign_webhook(&webhook()).unwrap();
        let mut tampered = webhook();
        tampered["amount"] = serde_json::json!(1);
        assert!(!gateway.verify_callback(&tampered, Some(&signature)).valid);
    }

    #[tokio::test]
    async fn status_query_is_unsupported() {
        let gateway = gateway();
        assert!(!gateway.supports_status_query());
        let err = gateway
            .query_status(StatusQuery {
                order_id: "HS0002".to_string(),
                request_id: "q".to_string(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, PaymentError::UnsupportedOperation { .. }));
    }

    #[test]
    fn parse_callback_extracts_fields() {
        let event = gateway().parse_callback(&webhook()).unwrap();
        assert_eq!(event.provider_transaction_id.as_deref(), Some("FT2410170001"));
        assert_eq!(event.amount, Some(1_200_000));
        assert!(event.is_success());
    }
}
