use crate::domain::transaction::GatewayOutcome;
use crate::payments::error::PaymentError;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProviderName {
    Momo,
    BankTransfer,
    Cash,
}

impl ProviderName {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderName::Momo => "momo",
            ProviderName::BankTransfer => "bank_transfer",
            ProviderName::Cash => "cash",
        }
    }
}

impl std::fmt::Display for ProviderName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ProviderName {
    type Err = PaymentError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "momo" | "wallet" => Ok(ProviderName::Momo),
            "bank_transfer" | "bank-transfer" | "bank" => Ok(ProviderName::BankTransfer),
            "cash" => Ok(ProviderName::Cash),
            _ => Err(PaymentError::ValidationError {
                message: format!("unsupported provider: {}", value),
                field: Some("provider".to_string()),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CallbackUrls {
    /// Where the customer's browser lands after paying.
    pub redirect_url: String,
    /// Server-to-server notification endpoint.
    pub ipn_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentRequest {
    pub order_id: String,
    pub request_id: String,
    /// Integer minor units; gateways never see floating point.
    pub amount: i64,
    pub order_info: String,
    pub callback_urls: CallbackUrls,
    pub extra_data: Option<JsonValue>,
}

/// Synchronous answer from a gateway, normalized across providers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NormalizedGatewayResponse {
    pub success: bool,
    pub outcome: GatewayOutcome,
    pub pay_url: Option<String>,
    pub qr_code_url: Option<String>,
    pub deeplink: Option<String>,
    pub provider_transaction_id: Option<String>,
    pub result_code: Option<i64>,
    pub message: Option<String>,
    pub raw_response: JsonValue,
}

impl NormalizedGatewayResponse {
    pub fn accepted(raw_response: JsonValue) -> Self {
        Self {
            success: true,
            outcome: GatewayOutcome::Accepted,
            pay_url: None,
            qr_code_url: None,
            deeplink: None,
            provider_transaction_id: None,
            result_code: Some(0),
            message: None,
            raw_response,
        }
    }

    pub fn rejected(result_code: Option<i64>, message: String, raw_response: JsonValue) -> Self {
        Self {
            success: false,
            outcome: GatewayOutcome::Rejected,
            pay_url: None,
            qr_code_url: None,
            deeplink: None,
            provider_transaction_id: None,
            result_code,
            message: Some(message),
            raw_response,
        }
    }

    /// Transport-level failure. The outcome follows the error: a provider
    /// that answered 4xx rejected us, anything else is unknown.
    pub fn from_error(err: &PaymentError) -> Self {
        Self {
            success: false,
            outcome: err.outcome(),
            pay_url: None,
            qr_code_url: None,
            deeplink: None,
            provider_transaction_id: None,
            result_code: None,
            message: Some(err.to_string()),
            raw_response: serde_json::json!({ "error": err.to_string() }),
        }
    }

    /// No answer within the orchestrator's deadline.
    pub fn timed_out(timeout_secs: u64) -> Self {
        Self::from_error(&PaymentError::Timeout { timeout_secs })
    }

    pub fn failure_reason(&self) -> String {
        self.message
            .clone()
            .unwrap_or_else(|| format!("gateway {}", self.outcome.as_str()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusQuery {
    pub order_id: String,
    pub request_id: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GatewayPaymentState {
    Succeeded,
    Failed,
    Pending,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub state: GatewayPaymentState,
    pub provider_transaction_id: Option<String>,
    pub result_code: Option<i64>,
    pub message: Option<String>,
    pub raw_response: JsonValue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefundRequest {
    /// Fresh order id for the refund itself.
    pub order_id: String,
    pub request_id: String,
    pub amount: i64,
    /// Provider id of the payment being refunded.
    pub provider_transaction_id: Option<String>,
    pub description: String,
}

/// Parsed asynchronous notification from a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackEvent {
    pub provider: ProviderName,
    pub order_id: String,
    pub provider_transaction_id: Option<String>,
    pub amount: Option<i64>,
    pub result_code: i64,
    pub message: String,
    pub payload: JsonValue,
    pub received_at: String,
}

impl CallbackEvent {
    pub fn is_success(&self) -> bool {
        self.result_code == 0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CallbackVerification {
    pub valid: bool,
    pub reason: Option<String>,
}

impl CallbackVerification {
    pub fn valid() -> Self {
        Self {
            valid: true,
            reason: None,
        }
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            reason: Some(reason.into()),
        }
    }
}

/// Body returned to the provider for every callback so it stops redelivering.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CallbackAck {
    pub result_code: i64,
    pub message: String,
}

impl CallbackAck {
    pub fn received() -> Self {
        Self {
            result_code: 0,
            message: "Received".to_string(),
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            result_code: 1,
            message: message.into(),
        }
    }
}
