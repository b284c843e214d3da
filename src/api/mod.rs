//! HTTP surface

pub mod installments;
pub mod payments;
pub mod webhooks;

use axum::{
    extract::{FromRequestParts, State},
    http::{request::Parts, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;
use uuid::Uuid;

use crate::domain::transaction::AttemptContext;
use crate::error::{AppError, AppErrorKind, ValidationError};
use crate::health::{HealthChecker, HealthState};
use crate::middleware::error::get_request_id_from_headers;
use crate::services::{PaymentOrchestrator, WebhookProcessor};

pub const CUSTOMER_ID_HEADER: &str = "x-customer-id";
pub const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";
pub const DEVICE_ID_HEADER: &str = "x-device-id";

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<PaymentOrchestrator>,
    pub webhooks: Arc<WebhookProcessor>,
    pub health: HealthChecker,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/payments", post(payments::create_payment))
        .route("/api/payments/fees", get(payments::get_fees))
        .route("/api/payments/{id}", get(payments::get_payment))
        .route("/api/payments/{id}/refunds", post(payments::refund_payment))
        .route("/api/payments/{id}/confirm", post(payments::confirm_payment))
        .route("/api/installments", post(installments::create_schedule))
        .route("/api/installments/{id}", get(installments::get_schedule))
        .route(
            "/api/installments/{id}/payments",
            post(installments::pay_installment),
        )
        .route(
            "/api/installments/{id}/cancel",
            post(installments::cancel_schedule),
        )
        .route("/webhooks/{provider}", post(webhooks::handle_webhook))
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let status = state.health.check_health().await;
    let code = if status.status != HealthState::Unhealthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(status))
}

/// Who is calling and from where. Authentication happens in front of this
/// service; the gateway forwards the customer id as a header.
#[derive(Debug, Clone)]
pub struct Caller {
    pub customer_id: Uuid,
    pub context: AttemptContext,
    pub request_id: Option<String>,
}

impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let request_id = get_request_id_from_headers(&parts.headers);
        let raw = parts
            .headers
            .get(CUSTOMER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                with_request_id(
                    AppError::new(AppErrorKind::Validation(ValidationError::MissingField {
                        field: CUSTOMER_ID_HEADER.to_string(),
                    })),
                    &request_id,
                )
            })?;
        let customer_id = Uuid::parse_str(raw.trim()).map_err(|_| {
            with_request_id(
                AppError::invalid_field(CUSTOMER_ID_HEADER, "must be a UUID"),
                &request_id,
            )
        })?;

        Ok(Self {
            customer_id,
            context: attempt_context(&parts.headers),
            request_id,
        })
    }
}

/// First hop of `x-forwarded-for` and the `x-device-id` header.
pub fn attempt_context(headers: &HeaderMap) -> AttemptContext {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };
    AttemptContext {
        client_ip: header(FORWARDED_FOR_HEADER)
            .and_then(|v| v.split(',').next())
            .map(|ip| ip.trim().to_string())
            .filter(|ip| !ip.is_empty()),
        device_id: header(DEVICE_ID_HEADER).map(str::to_string),
    }
}

pub(crate) fn with_request_id(error: AppError, request_id: &Option<String>) -> AppError {
    match request_id {
        Some(id) if error.request_id.is_none() => error.with_request_id(id.clone()),
        _ => error,
    }
}
