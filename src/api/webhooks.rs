use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::Value as JsonValue;
use tracing::{info, warn};

use super::AppState;
use crate::payments::providers::bank_transfer::SIGNATURE_HEADER as BANK_SIGNATURE_HEADER;
use crate::payments::types::CallbackAck;

/// POST /webhooks/{provider}
///
/// MoMo signs inside the JSON body; the bank puts its HMAC in a header.
pub async fn handle_webhook(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: String,
) -> Response {
    info!(provider = %provider, "Received webhook");

    let signature = headers
        .get(BANK_SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    let payload: JsonValue = match serde_json::from_str(&body) {
        Ok(p) => p,
        Err(e) => {
            warn!(provider = %provider, error = %e, "Invalid JSON payload");
            return (
                StatusCode::BAD_REQUEST,
                Json(CallbackAck::rejected("invalid JSON payload")),
            )
                .into_response();
        }
    };

    let receipt = state
        .webhooks
        .handle(&provider, signature.as_deref(), &payload)
        .await;

    let status = StatusCode::from_u16(receipt.status_code).unwrap_or(StatusCode::OK);
    (status, Json(receipt.ack)).into_response()
}
