//! Error response formatting
//!
//! Every failed API call answers with the same JSON envelope: machine code,
//! user message, request id, timestamp, optional details and a retry hint.

use crate::error::{AppError, ErrorCode};
use axum::{
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Standardized error response structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Machine-readable error code
    pub error: ErrorCode,

    /// Human-readable error message
    pub message: String,

    pub request_id: Option<String>,

    /// RFC 3339 timestamp of the error
    pub timestamp: String,

    /// Failed risk checks, remaining balance, offending field...
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,

    /// Whether the client should retry the request
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
}

impl ErrorResponse {
    pub fn from_app_error(error: &AppError) -> Self {
        Self {
            error: error.error_code(),
            message: error.user_message(),
            request_id: error.request_id.clone(),
            timestamp: Utc::now().to_rfc3339(),
            details: error.details(),
            retryable: Some(error.is_retryable()),
        }
    }

    /// Envelope for a request body or header that could not be read.
    pub fn bad_request(request_id: Option<String>, message: impl Into<String>) -> Self {
        Self {
            error: ErrorCode::ValidationError,
            message: message.into(),
            request_id,
            timestamp: Utc::now().to_rfc3339(),
            details: None,
            retryable: Some(false),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status_code =
            StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        if status_code.is_server_error() {
            tracing::error!(
                error = %self,
                request_id = ?self.request_id,
                status = %status_code.as_u16(),
                "Server error occurred"
            );
        } else {
            tracing::warn!(
                error = %self,
                request_id = ?self.request_id,
                status = %status_code.as_u16(),
                "Client error occurred"
            );
        }

        let error_response = ErrorResponse::from_app_error(&self);
        (status_code, Json(error_response)).into_response()
    }
}

pub fn get_request_id_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{AppErrorKind, DomainError};

    #[test]
    fn test_error_response_carries_details() {
        let app_error = AppError::new(AppErrorKind::Domain(
            DomainError::InsufficientRemainingBalance {
                booking_total: 1_000_000,
                already_paid: 700_000,
                requested: 400_000,
            },
        ))
        .with_request_id("req_123");

        let response = ErrorResponse::from_app_error(&app_error);

        assert_eq!(response.error, ErrorCode::InsufficientRemainingBalance);
        assert_eq!(response.request_id.as_deref(), Some("req_123"));
        assert_eq!(response.retryable, Some(false));
        assert_eq!(response.details.unwrap()["remaining_balance"], 300_000);
    }

    #[test]
    fn test_app_error_into_response_status() {
        let response = AppError::invalid_amount(-100, "must be positive").into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = AppError::forbidden("payment").into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = AppError::internal("boom").into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_request_id_from_headers() {
        let mut headers = HeaderMap::new();
        assert_eq!(get_request_id_from_headers(&headers), None);
        headers.insert(REQUEST_ID_HEADER, "abc".parse().unwrap());
        assert_eq!(get_request_id_from_headers(&headers).as_deref(), Some("abc"));
    }
}
