use crate::config::{parse_var, required_var, ConfigError};
use crate::payments::error::{PaymentError, PaymentResult};
use crate::payments::provider::PaymentGateway;
use crate::payments::signature::{json_field, SignatureLayout, SignatureVerifier};
use crate::payments::types::{
    CallbackEvent, CallbackVerification, GatewayPaymentState, NormalizedGatewayResponse,
    PaymentRequest, ProviderName, RefundRequest, StatusQuery, StatusResponse,
};
use crate::payments::utils::{mask_signature, PaymentHttpClient};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use std::time::Duration;
use tracing::{info, warn};

const CREATE_LAYOUT: SignatureLayout = SignatureLayout {
    name: "momo.create",
    fields: &[
        "accessKey",
        "amount",
        "extraData",
        "ipnUrl",
        "orderId",
        "orderInfo",
        "partnerCode",
        "redirectUrl",
        "requestId",
        "requestType",
    ],
};

const IPN_LAYOUT: SignatureLayout = SignatureLayout {
    name: "momo.ipn",
    fields: &[
        "accessKey",
        "amount",
        "extraData",
        "message",
        "orderId",
        "orderInfo",
        "orderType",
        "partnerCode",
        "payType",
        "requestId",
        "responseTime",
        "resultCode",
        "transId",
    ],
};

const QUERY_LAYOUT: SignatureLayout = SignatureLayout {
    name: "momo.query",
    fields: &["accessKey", "orderId", "partnerCode", "requestId"],
};

const REFUND_LAYOUT: SignatureLayout = SignatureLayout {
    name: "momo.refund",
    fields: &[
        "accessKey",
        "amount",
        "description",
        "orderId",
        "partnerCode",
        "requestId",
        "transId",
    ],
};

/// Result codes meaning "still in flight" on the query endpoint.
const PENDING_RESULT_CODES: &[i64] = &[1000, 7000, 7002, 9000];

#[derive(Debug, Clone)]
pub struct MomoConfig {
    pub partner_code: String,
    pub access_key: String,
    pub secret_key: String,
    pub endpoint: String,
    pub request_type: String,
    pub lang: String,
    pub timeout_secs: u64,
    pub query_max_retries: u32,
}

impl Default for MomoConfig {
    fn default() -> Self {
        Self {
            partner_code: String::new(),
            access_key: String::new(),
            secret_key: String::new(),
            endpoint: "https://test-payment.momo.vn".to_string(),
            request_type: "captureWallet".to_string(),
            lang: "vi".to_string(),
            timeout_secs: 30,
            query_max_retries: 2,
        }
    }
}

impl MomoConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        Ok(Self {
            partner_code: required_var("MOMO_PARTNER_CODE")?,
            access_key: required_var("MOMO_ACCESS_KEY")?,
            secret_key: required_var("MOMO_SECRET_KEY")?,
            endpoint: std::env::var("MOMO_ENDPOINT").unwrap_or(defaults.endpoint),
            request_type: std::env::var("MOMO_REQUEST_TYPE").unwrap_or(defaults.request_type),
            lang: std::env::var("MOMO_LANG").unwrap_or(defaults.lang),
            timeout_secs: parse_var("MOMO_TIMEOUT_SECS", defaults.timeout_secs)?,
            query_max_retries: parse_var("MOMO_QUERY_MAX_RETRIES", defaults.query_max_retries)?,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MomoCreateResponse {
    result_code: i64,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    pay_url: Option<String>,
    #[serde(default)]
    deeplink: Option<String>,
    #[serde(default)]
    qr_code_url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MomoQueryResponse {
    result_code: i64,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    trans_id: Option<JsonValue>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MomoRefundResponse {
    result_code: i64,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    trans_id: Option<JsonValue>,
}

/// MoMo transaction ids arrive as numbers on some endpoints and strings on
/// others.
fn trans_id_string(value: Option<&JsonValue>) -> Option<String> {
    match value? {
        JsonValue::String(s) if !s.is_empty() => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub struct MomoGateway {
    config: MomoConfig,
    signer: SignatureVerifier,
    http: PaymentHttpClient,
}

impl MomoGateway {
    pub fn new(config: MomoConfig) -> PaymentResult<Self> {
        let http = PaymentHttpClient::new("momo", Duration::from_secs(config.timeout_secs))?;
        let signer = SignatureVerifier::hmac_sha256(config.secret_key.clone());
        Ok(Self {
            config,
            signer,
            http,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.config.endpoint.trim_end_matches('/'), path)
    }

    fn encode_extra_data(extra: Option<&JsonValue>) -> String {
        match extra {
            Some(value) if !value.is_null() => BASE64.encode(value.to_string()),
            _ => String::new(),
        }
    }

    /// Signs `body` in place. `accessKey` always comes from configuration;
    /// MoMo never sends it in payloads.
    fn sign_body(&self, layout: &SignatureLayout, body: &mut JsonValue) -> PaymentResult<()> {
        let view: &JsonValue = body;
        let signature = self
            .signer
            .sign_layout(layout, |key| self.lookup(view, key))
            .map_err(|e| PaymentError::ValidationError {
                message: e.to_string(),
                field: Some("signature".to_string()),
            })?;
        body["signature"] = JsonValue::String(signature);
        Ok(())
    }

    fn lookup(&self, payload: &JsonValue, key: &str) -> Option<String> {
        if key == "accessKey" {
            return Some(self.config.access_key.clone());
        }
        json_field(payload, key)
    }
}

#[async_trait]
impl PaymentGateway for MomoGateway {
    fn name(&self) -> ProviderName {
        ProviderName::Momo
    }

    async fn create_payment_request(&self, request: PaymentRequest) -> NormalizedGatewayResponse {
        let mut body = serde_json::json!({
            "partnerCode": self.config.partner_code,
            "requestId": request.request_id,
            "amount": request.amount,
            "orderId": request.order_id,
            "orderInfo": request.order_info,
            "redirectUrl": request.callback_urls.redirect_url,
            "ipnUrl": request.callback_urls.ipn_url,
            "requestType": self.config.request_type,
            "extraData": Self::encode_extra_data(request.extra_data.as_ref()),
            "lang": self.config.lang,
        });
        if let Err(err) = self.sign_body(&CREATE_LAYOUT, &mut body) {
            return NormalizedGatewayResponse::from_error(&err);
        }

        // Creation is never retried: a resend could open a second charge.
        let raw: JsonValue = match self
            .http
            .post_json(&self.endpoint("/v2/gateway/api/create"), &body, 0)
            .await
        {
            Ok(raw) => raw,
            Err(err) => {
                warn!(order_id = %request.order_id, error = %err, "momo create failed");
                return NormalizedGatewayResponse::from_error(&err);
            }
        };

        let parsed: MomoCreateResponse = match serde_json::from_value(raw.clone()) {
            Ok(parsed) => parsed,
            Err(e) => {
                return NormalizedGatewayResponse::from_error(&PaymentError::InvalidResponse {
                    message: format!("momo create: {}", e),
                })
            }
        };

        if parsed.result_code != 0 {
            info!(
                order_id = %request.order_id,
                result_code = parsed.result_code,
                "momo rejected payment request"
            );
            return NormalizedGatewayResponse::rejected(
                Some(parsed.result_code),
                parsed
                    .message
                    .unwrap_or_else(|| format!("momo result code {}", parsed.result_code)),
                raw,
            );
        }

        info!(order_id = %request.order_id, "momo payment request accepted");
        let mut response = NormalizedGatewayResponse::accepted(raw);
        response.pay_url = parsed.pay_url;
        response.deeplink = parsed.deeplink;
        response.qr_code_url = parsed.qr_code_url;
        response.message = parsed.message;
        response
    }

    async fn query_status(&self, query: StatusQuery) -> PaymentResult<StatusResponse> {
        let mut body = serde_json::json!({
            "partnerCode": self.config.partner_code,
            "requestId": query.request_id,
            "orderId": query.order_id,
            "lang": self.config.lang,
        });
        self.sign_body(&QUERY_LAYOUT, &mut body)?;

        let raw: JsonValue = self
            .http
            .post_json(
                &self.endpoint("/v2/gateway/api/query"),
                &body,
                self.config.query_max_retries,
            )
            .await?;
        let parsed: MomoQueryResponse =
            serde_json::from_value(raw.clone()).map_err(|e| PaymentError::InvalidResponse {
                message: format!("momo query: {}", e),
            })?;

        let state = match parsed.result_code {
            0 => GatewayPaymentState::Succeeded,
            code if PENDING_RESULT_CODES.contains(&code) => GatewayPaymentState::Pending,
            _ => GatewayPaymentState::Failed,
        };

        Ok(StatusResponse {
            state,
            provider_transaction_id: trans_id_string(parsed.trans_id.as_ref()),
            result_code: Some(parsed.result_code),
            message: parsed.message,
            raw_response: raw,
        })
    }

    async fn refund(&self, request: RefundRequest) -> NormalizedGatewayResponse {
        let Some(trans_id) = request.provider_transaction_id.clone() else {
            return NormalizedGatewayResponse::from_error(&PaymentError::ValidationError {
                message: "momo refunds need the original transId".to_string(),
                field: Some("provider_transaction_id".to_string()),
            });
        };
        let trans_id_value = trans_id
            .parse::<i64>()
            .map(JsonValue::from)
            .unwrap_or_else(|_| JsonValue::String(trans_id.clone()));

        let mut body = serde_json::json!({
            "partnerCode": self.config.partner_code,
            "orderId": request.order_id,
            "requestId": request.request_id,
            "amount": request.amount,
            "transId": trans_id_value,
            "lang": self.config.lang,
            "description": request.description,
        });
        if let Err(err) = self.sign_body(&REFUND_LAYOUT, &mut body) {
            return NormalizedGatewayResponse::from_error(&err);
        }

        let raw: JsonValue = match self
            .http
            .post_json(&self.endpoint("/v2/gateway/api/refund"), &body, 0)
            .await
        {
            Ok(raw) => raw,
            Err(err) => return NormalizedGatewayResponse::from_error(&err),
        };
        let parsed: MomoRefundResponse = match serde_json::from_value(raw.clone()) {
            Ok(parsed) => parsed,
            Err(e) => {
                return NormalizedGatewayResponse::from_error(&PaymentError::InvalidResponse {
                    message: format!("momo refund: {}", e),
                })
            }
        };

        if parsed.result_code != 0 {
            return NormalizedGatewayResponse::rejected(
                Some(parsed.result_code),
                parsed
                    .message
                    .unwrap_or_else(|| format!("momo result code {}", parsed.result_code)),
                raw,
            );
        }

        let mut response = NormalizedGatewayResponse::accepted(raw);
        response.provider_transaction_id = trans_id_string(parsed.trans_id.as_ref());
        response.message = parsed.message;
        response
    }

    fn verify_callback(
        &self,
        payload: &JsonValue,
        _header_signature: Option<&str>,
    ) -> CallbackVerification {
        let Some(provided) = payload.get("signature").and_then(|v| v.as_str()) else {
            return CallbackVerification::invalid("missing signature");
        };

        if self
            .signer
            .verify_layout(&IPN_LAYOUT, |key| self.lookup(payload, key), provided)
        {
            CallbackVerification::valid()
        } else {
            warn!(
                signature = %mask_signature(provided),
                "momo callback signature mismatch"
            );
            CallbackVerification::invalid("invalid momo signature")
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
            provider: ProviderName::Momo,
            order_id: order_id.to_string(),
            provider_transaction_id: trans_id_string(payload.get("transId")),
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
