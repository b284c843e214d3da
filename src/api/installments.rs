use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use uuid::Uuid;

use super::{with_request_id, AppState, Caller};
use crate::domain::installment::InstallmentSchedule;
use crate::error::AppError;
use crate::payments::types::ProviderName;
use crate::services::installment_scheduler::NewSchedule;
use crate::services::payment_orchestrator::PaymentInitiation;

#[derive(Debug, Deserialize)]
pub struct PayInstallmentBody {
    pub method: ProviderName,
}

#[derive(Debug, Default, Deserialize)]
pub struct CancelBody {
    #[serde(default)]
    pub reason: Option<String>,
}

/// POST /api/installments
pub async fn create_schedule(
    State(state): State<AppState>,
    caller: Caller,
    Json(request): Json<NewSchedule>,
) -> Result<(StatusCode, Json<InstallmentSchedule>), AppError> {
    let schedule = state
        .orchestrator
        .scheduler()
        .create_schedule(caller.customer_id, request)
        .await
        .map_err(|e| with_request_id(e, &caller.request_id))?;
    Ok((StatusCode::CREATED, Json(schedule)))
}

/// GET /api/installments/{id}
pub async fn get_schedule(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<Uuid>,
) -> Result<Json<InstallmentSchedule>, AppError> {
    state
        .orchestrator
        .scheduler()
        .get(id, caller.customer_id)
        .await
        .map(Json)
        .map_err(|e| with_request_id(e, &caller.request_id))
}

/// POST /api/installments/{id}/payments
///
/// Starts a payment for the plan's next installment.
pub async fn pay_installment(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<Uuid>,
    Json(body): Json<PayInstallmentBody>,
) -> Result<(StatusCode, Json<PaymentInitiation>), AppError> {
    let initiation = state
        .orchestrator
        .initiate_installment_payment(caller.customer_id, id, body.method, caller.context.clone())
        .await
        .map_err(|e| with_request_id(e, &caller.request_id))?;
    Ok((StatusCode::CREATED, Json(initiation)))
}

/// POST /api/installments/{id}/cancel
pub async fn cancel_schedule(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<Uuid>,
    body: Option<Json<CancelBody>>,
) -> Result<Json<InstallmentSchedule>, AppError> {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    state
        .orchestrator
        .scheduler()
        .cancel(id, caller.customer_id, body.reason)
        .await
        .map(Json)
        .map_err(|e| with_request_id(e, &caller.request_id))
}
