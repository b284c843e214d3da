use crate::payments::error::{PaymentError, PaymentResult};
use crate::payments::provider::PaymentGateway;
use crate::payments::types::{
    CallbackEvent, CallbackVerification, NormalizedGatewayResponse, PaymentRequest, ProviderName,
    RefundRequest, StatusQuery, StatusResponse,
};
use async_trait::async_trait;
use serde_json::Value as JsonValue;

/// Pay at the property. Nothing leaves the process; the payment stays
/// pending until staff confirm receipt.
#[derive(Debug, Default, Clone)]
pub struct CashGateway;

impl CashGateway {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PaymentGateway for CashGateway {
    fn name(&self) -> ProviderName {
        ProviderName::Cash
    }

    async fn create_payment_request(&self, request: PaymentRequest) -> NormalizedGatewayResponse {
        let mut response = NormalizedGatewayResponse::accepted(serde_json::json!({
            "mode": "pay_at_property",
            "orderId": request.order_id,
            "amount": request.amount,
        }));
        response.message = Some("pay at property".to_string());
        response
    }

    async fn query_status(&self, _query: StatusQuery) -> PaymentResult<StatusResponse> {
        Err(PaymentError::UnsupportedOperation {
            provider: ProviderName::Cash.to_string(),
            operation: "status query",
        })
    }

    async fn refund(&self, request: RefundRequest) -> NormalizedGatewayResponse {
        let mut response = NormalizedGatewayResponse::accepted(serde_json::json!({
            "mode": "cash_refund",
            "orderId": request.order_id,
            "amount": request.amount,
        }));
        response.message = Some("refunded in cash".to_string());
        response
    }

    fn supports_status_query(&self) -> bool {
        false
    }

    fn verify_callback(
        &self,
        _payload: &JsonValue,
        _header_signature: Option<&str>,
    ) -> CallbackVerification {
        CallbackVerification::invalid("cash payments have no callbacks")
    }

    fn parse_callback(&self, _payload: &JsonValue) -> PaymentResult<CallbackEvent> {
        Err(PaymentError::UnsupportedOperation {
            provider: ProviderName::Cash.to_string(),
            operation: "callbacks",
        })
    }
}
