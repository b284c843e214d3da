use crate::payments::error::PaymentResult;
use crate::payments::types::{
    CallbackEvent, CallbackVerification, NormalizedGatewayResponse, PaymentRequest, ProviderName,
    RefundRequest, StatusQuery, StatusResponse,
};
use async_trait::async_trait;
use serde_json::Value as JsonValue;

/// Provider-specific client. Implementations hold their own secrets and
/// never mutate local state; persisting results is the caller's job.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    fn name(&self) -> ProviderName;

    /// Never fails past the caller: transport problems come back as a
    /// response whose outcome is `Rejected` or `Unknown`.
    async fn create_payment_request(&self, request: PaymentRequest) -> NormalizedGatewayResponse;

    /// Re-asks the provider for the current state of an order. Only used by
    /// reconciliation.
    async fn query_status(&self, query: StatusQuery) -> PaymentResult<StatusResponse>;

    async fn refund(&self, request: RefundRequest) -> NormalizedGatewayResponse;

    fn supports_status_query(&self) -> bool {
        true
    }

    /// `header_signature` is used by providers that sign out of band.
    fn verify_callback(
        &self,
        payload: &JsonValue,
        header_signature: Option<&str>,
    ) -> CallbackVerification;

    fn parse_callback(&self, payload: &JsonValue) -> PaymentResult<CallbackEvent>;
}
