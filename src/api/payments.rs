use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tracing::info;
use uuid::Uuid;

use super::{with_request_id, AppState, Caller};
use crate::error::{AppError, AppResult};
use crate::middleware::error::get_request_id_from_headers;
use crate::payments::types::ProviderName;
use crate::services::fee_calculation::FeeBreakdown;
use crate::services::payment_orchestrator::{
    CreatePaymentRequest, PaymentDetails, PaymentInitiation, RefundResult,
};

#[derive(Debug, Deserialize)]
pub struct RefundBody {
    pub amount: i64,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ConfirmBody {
    /// Receipt number or bank statement line.
    #[serde(default)]
    pub reference: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct FeesQueryParams {
    pub amount: i64,
    pub provider: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct FeesResponse {
    pub amount: i64,
    pub quotes: Vec<FeeBreakdown>,
}

/// POST /api/payments
pub async fn create_payment(
    State(state): State<AppState>,
    caller: Caller,
    Json(mut request): Json<CreatePaymentRequest>,
) -> Result<(StatusCode, Json<PaymentInitiation>), AppError> {
    request.context = caller.context.clone();
    let initiation = state
        .orchestrator
        .create_payment(caller.customer_id, request)
        .await
        .map_err(|e| with_request_id(e, &caller.request_id))?;

    info!(
        payment_id = %initiation.payment.id,
        order_id = %initiation.payment.order_id,
        "Payment initiated via API"
    );
    Ok((StatusCode::CREATED, Json(initiation)))
}

/// GET /api/payments/{id}
pub async fn get_payment(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<Uuid>,
) -> Result<Json<PaymentDetails>, AppError> {
    state
        .orchestrator
        .get_payment(id, caller.customer_id)
        .await
        .map(Json)
        .map_err(|e| with_request_id(e, &caller.request_id))
}

/// POST /api/payments/{id}/refunds
pub async fn refund_payment(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<Uuid>,
    Json(body): Json<RefundBody>,
) -> Result<(StatusCode, Json<RefundResult>), AppError> {
    let result = state
        .orchestrator
        .refund_payment(caller.customer_id, id, body.amount, body.reason)
        .await
        .map_err(|e| with_request_id(e, &caller.request_id))?;
    Ok((StatusCode::CREATED, Json(result)))
}

/// POST /api/payments/{id}/confirm
///
/// Front-desk confirmation of cash or a reconciled bank transfer. Staff
/// authorization is enforced upstream.
pub async fn confirm_payment(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    body: Option<Json<ConfirmBody>>,
) -> Result<Json<PaymentDetails>, AppError> {
    let request_id = get_request_id_from_headers(&headers);
    let body = body.map(|Json(b)| b).unwrap_or_default();
    state
        .orchestrator
        .confirm_offline_payment(id, body.reference)
        .await
        .map(Json)
        .map_err(|e| with_request_id(e, &request_id))
}

/// GET /api/payments/fees?amount=..&provider=..
pub async fn get_fees(
    State(state): State<AppState>,
    Query(params): Query<FeesQueryParams>,
) -> AppResult<impl IntoResponse> {
    if params.amount <= 0 {
        return Err(AppError::invalid_amount(params.amount, "amount must be positive"));
    }

    let quotes = match params.provider.as_deref() {
        Some(raw) => {
            let provider = ProviderName::from_str(raw)
                .map_err(|_| AppError::invalid_field("provider", format!("unknown provider '{}'", raw)))?;
            vec![state.orchestrator.fees().calculate_fees(provider, params.amount)?]
        }
        None => state.orchestrator.fees().quote_all(params.amount),
    };

    Ok(Json(FeesResponse {
        amount: params.amount,
        quotes,
    }))
}
