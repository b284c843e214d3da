//! Unified error handling for the payment engine
//!
//! Every layer converts its own error type into [`AppError`], which knows its
//! HTTP status, machine-readable code, user message and retry hint.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use std::fmt;

use crate::domain::installment::ScheduleError;
use crate::domain::risk::RiskAssessment;

/// Error codes for programmatic handling by clients
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorCode {
    // Domain errors (4xx)
    #[serde(rename = "INVALID_STATE_TRANSITION")]
    InvalidStateTransition,
    #[serde(rename = "NOT_FOUND")]
    NotFound,
    #[serde(rename = "FORBIDDEN")]
    Forbidden,
    #[serde(rename = "PAYMENT_BLOCKED")]
    PaymentBlocked,
    #[serde(rename = "INVALID_SIGNATURE")]
    InvalidSignature,
    #[serde(rename = "DUPLICATE_PAYMENT")]
    DuplicatePayment,
    #[serde(rename = "INSUFFICIENT_REMAINING_BALANCE")]
    InsufficientRemainingBalance,
    #[serde(rename = "BOOKING_NOT_PAYABLE")]
    BookingNotPayable,
    #[serde(rename = "SCHEDULE_BUSY")]
    ScheduleBusy,

    // Infrastructure errors (5xx)
    #[serde(rename = "DATABASE_ERROR")]
    DatabaseError,
    #[serde(rename = "CONFIGURATION_ERROR")]
    ConfigurationError,

    // External errors
    #[serde(rename = "GATEWAY_UNAVAILABLE")]
    GatewayUnavailable,
    #[serde(rename = "GATEWAY_REJECTED")]
    GatewayRejected,
    #[serde(rename = "EXTERNAL_SERVICE_TIMEOUT")]
    ExternalServiceTimeout,

    // Generic
    #[serde(rename = "INTERNAL_ERROR")]
    InternalError,
    #[serde(rename = "VALIDATION_ERROR")]
    ValidationError,
}

/// Business rule violations
#[derive(Debug, Clone)]
pub enum DomainError {
    /// Ledger entity asked to move along an edge its state table forbids
    InvalidStateTransition {
        entity: String,
        id: String,
        from: String,
        to: String,
    },
    NotFound { entity: String, id: String },
    /// Caller does not own the resource
    Forbidden { resource: String },
    /// Risk engine refused the attempt; carries the full assessment for audit
    PaymentBlocked { assessment: Box<RiskAssessment> },
    /// Callback failed authenticity checks
    InvalidSignature { provider: String },
    /// Another attempt for the same customer, booking and amount is in flight
    DuplicatePayment {
        booking_id: String,
        existing_transaction_id: Option<String>,
    },
    /// Paying this much would exceed what the booking owes
    InsufficientRemainingBalance {
        booking_total: i64,
        /// Completed plus in-flight payments, net of completed refunds.
        already_paid: i64,
        requested: i64,
    },
    BookingNotPayable { booking_id: String, status: String },
    /// Another worker holds the schedule lease
    ScheduleBusy { schedule_id: String },
}

/// Infrastructure-level errors (database, configuration)
#[derive(Debug, Clone)]
pub enum InfrastructureError {
    Database { message: String, is_retryable: bool },
    Configuration { message: String },
    Internal { message: String },
}

/// Payment gateway failures
#[derive(Debug, Clone)]
pub enum ExternalError {
    /// No definite answer from the provider. When `outcome_unknown` is set the
    /// attempt is still pending and will be reconciled.
    GatewayUnavailable {
        provider: String,
        reason: String,
        outcome_unknown: bool,
    },
    /// Provider answered and declined
    GatewayRejected {
        provider: String,
        message: String,
        provider_code: Option<String>,
    },
    Timeout { service: String, timeout_secs: u64 },
}

/// Input validation errors
#[derive(Debug, Clone)]
pub enum ValidationError {
    InvalidAmount { amount: String, reason: String },
    MissingField { field: String },
    InvalidField { field: String, reason: String },
    OutOfRange {
        field: String,
        min: Option<String>,
        max: Option<String>,
    },
}

/// Unified application error type
#[derive(Debug, Clone)]
pub struct AppError {
    pub kind: AppErrorKind,
    pub request_id: Option<String>,
    pub context: Option<String>,
}

#[derive(Debug, Clone)]
pub enum AppErrorKind {
    Domain(DomainError),
    Infrastructure(InfrastructureError),
    External(ExternalError),
    Validation(ValidationError),
}

impl AppError {
    pub fn new(kind: AppErrorKind) -> Self {
        Self {
            kind,
            request_id: None,
            context: None,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn not_found(entity: &str, id: impl fmt::Display) -> Self {
        Self::new(AppErrorKind::Domain(DomainError::NotFound {
            entity: entity.to_string(),
            id: id.to_string(),
        }))
    }

    pub fn forbidden(resource: &str) -> Self {
        Self::new(AppErrorKind::Domain(DomainError::Forbidden {
            resource: resource.to_string(),
        }))
    }

    pub fn invalid_amount(amount: i64, reason: impl Into<String>) -> Self {
        Self::new(AppErrorKind::Validation(ValidationError::InvalidAmount {
            amount: amount.to_string(),
            reason: reason.into(),
        }))
    }

    pub fn invalid_field(field: &str, reason: impl Into<String>) -> Self {
        Self::new(AppErrorKind::Validation(ValidationError::InvalidField {
            field: field.to_string(),
            reason: reason.into(),
        }))
    }

    pub fn invalid_transition(
        entity: &str,
        id: impl fmt::Display,
        from: impl fmt::Display,
        to: impl fmt::Display,
    ) -> Self {
        Self::new(AppErrorKind::Domain(DomainError::InvalidStateTransition {
            entity: entity.to_string(),
            id: id.to_string(),
            from: from.to_string(),
            to: to.to_string(),
        }))
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(AppErrorKind::Infrastructure(InfrastructureError::Internal {
            message: message.into(),
        }))
    }

    /// Map error to HTTP status code
    pub fn status_code(&self) -> u16 {
        match &self.kind {
            AppErrorKind::Domain(err) => match err {
                DomainError::InvalidStateTransition { .. } => 409, // Conflict
                DomainError::NotFound { .. } => 404,
                DomainError::Forbidden { .. } => 403,
                DomainError::PaymentBlocked { .. } => 422,
                DomainError::InvalidSignature { .. } => 400,
                DomainError::DuplicatePayment { .. } => 409,
                DomainError::InsufficientRemainingBalance { .. } => 422,
                DomainError::BookingNotPayable { .. } => 409,
                DomainError::ScheduleBusy { .. } => 409,
            },
            AppErrorKind::Infrastructure(_) => 500,
            AppErrorKind::External(err) => match err {
                ExternalError::GatewayUnavailable { .. } => 503,
                ExternalError::GatewayRejected { .. } => 402, // Payment Required
                ExternalError::Timeout { .. } => 504,
            },
            AppErrorKind::Validation(_) => 400,
        }
    }

    /// Get error code for client handling
    pub fn error_code(&self) -> ErrorCode {
        match &self.kind {
            AppErrorKind::Domain(err) => match err {
                DomainError::InvalidStateTransition { .. } => ErrorCode::InvalidStateTransition,
                DomainError::NotFound { .. } => ErrorCode::NotFound,
                DomainError::Forbidden { .. } => ErrorCode::Forbidden,
                DomainError::PaymentBlocked { .. } => ErrorCode::PaymentBlocked,
                DomainError::InvalidSignature { .. } => ErrorCode::InvalidSignature,
                DomainError::DuplicatePayment { .. } => ErrorCode::DuplicatePayment,
                DomainError::InsufficientRemainingBalance { .. } => {
                    ErrorCode::InsufficientRemainingBalance
                }
                DomainError::BookingNotPayable { .. } => ErrorCode::BookingNotPayable,
                DomainError::ScheduleBusy { .. } => ErrorCode::ScheduleBusy,
            },
            AppErrorKind::Infrastructure(err) => match err {
                InfrastructureError::Database { .. } => ErrorCode::DatabaseError,
                InfrastructureError::Configuration { .. } => ErrorCode::ConfigurationError,
                InfrastructureError::Internal { .. } => ErrorCode::InternalError,
            },
            AppErrorKind::External(err) => match err {
                ExternalError::GatewayUnavailable { .. } => ErrorCode::GatewayUnavailable,
                ExternalError::GatewayRejected { .. } => ErrorCode::GatewayRejected,
                ExternalError::Timeout { .. } => ErrorCode::ExternalServiceTimeout,
            },
            AppErrorKind::Validation(_) => ErrorCode::ValidationError,
        }
    }

    /// Get user-friendly error message
    pub fn user_message(&self) -> String {
        match &self.kind {
            AppErrorKind::Domain(err) => match err {
                DomainError::InvalidStateTransition {
                    entity,
                    id,
                    from,
                    to,
                } => format!("Cannot move {} '{}' from {} to {}", entity, id, from, to),
                DomainError::NotFound { entity, id } => {
                    format!("{} '{}' not found", capitalize(entity), id)
                }
                DomainError::Forbidden { resource } => {
                    format!("You do not have access to this {}", resource)
                }
                DomainError::PaymentBlocked { .. } => {
                    "This payment was blocked by our fraud checks".to_string()
                }
                DomainError::InvalidSignature { provider } => {
                    format!("Invalid {} callback signature", provider)
                }
                DomainError::DuplicatePayment { .. } => {
                    "A payment for this booking is already being processed".to_string()
                }
                DomainError::InsufficientRemainingBalance {
                    booking_total,
                    already_paid,
                    ..
                } => format!(
                    "Amount exceeds the remaining balance of {} for this booking",
                    (booking_total - already_paid).max(0)
                ),
                DomainError::BookingNotPayable { status, .. } => {
                    format!("Bookings in status '{}' cannot be paid", status)
                }
                DomainError::ScheduleBusy { .. } => {
                    "This installment plan is being processed. Please try again shortly"
                        .to_string()
                }
            },
            AppErrorKind::Infrastructure(_) => {
                "Service temporarily unavailable. Please try again later".to_string()
            }
            AppErrorKind::External(err) => match err {
                ExternalError::GatewayUnavailable {
                    provider,
                    outcome_unknown,
                    ..
                } => {
                    if *outcome_unknown {
                        format!(
                            "{} did not confirm the payment in time. We are checking its status; please do not pay again yet",
                            provider
                        )
                    } else {
                        format!(
                            "Payment provider ({}) is temporarily unavailable. Please try again",
                            provider
                        )
                    }
                }
                ExternalError::GatewayRejected { message, .. } => {
                    format!("Payment was declined: {}", message)
                }
                ExternalError::Timeout {
                    service,
                    timeout_secs,
                } => format!(
                    "{} request timed out after {} seconds. Please try again",
                    service, timeout_secs
                ),
            },
            AppErrorKind::Validation(err) => match err {
                ValidationError::InvalidAmount { amount, reason } => {
                    format!("Invalid amount '{}': {}", amount, reason)
                }
                ValidationError::MissingField { field } => {
                    format!("Required field '{}' is missing", field)
                }
                ValidationError::InvalidField { field, reason } => {
                    format!("Invalid value for '{}': {}", field, reason)
                }
                ValidationError::OutOfRange { field, min, max } => match (min, max) {
                    (Some(min), Some(max)) => {
                        format!("Field '{}' must be between {} and {}", field, min, max)
                    }
                    (Some(min), None) => format!("Field '{}' must be at least {}", field, min),
                    (None, Some(max)) => format!("Field '{}' must be at most {}", field, max),
                    (None, None) => format!("Field '{}' is out of acceptable range", field),
                },
            },
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        match &self.kind {
            AppErrorKind::Domain(err) => matches!(err, DomainError::ScheduleBusy { .. }),
            AppErrorKind::Infrastructure(err) => match err {
                InfrastructureError::Database { is_retryable, .. } => *is_retryable,
                InfrastructureError::Configuration { .. } => false,
                InfrastructureError::Internal { .. } => false,
            },
            AppErrorKind::External(err) => match err {
                ExternalError::GatewayUnavailable {
                    outcome_unknown, ..
                } => !outcome_unknown,
                ExternalError::GatewayRejected { .. } => false,
                ExternalError::Timeout { .. } => true,
            },
            AppErrorKind::Validation(_) => false,
        }
    }

    /// Structured payload for clients that need more than the message.
    pub fn details(&self) -> Option<JsonValue> {
        match &self.kind {
            AppErrorKind::Domain(DomainError::PaymentBlocked { assessment }) => Some(json!({
                "risk_score": assessment.risk_score,
                "risk_level": assessment.risk_level,
                "failed_checks": assessment.failed_checks(),
                "blocking_failures": assessment.blocking_failures,
            })),
            AppErrorKind::Domain(DomainError::InsufficientRemainingBalance {
                booking_total,
                already_paid,
                requested,
            }) => Some(json!({
                "booking_total": booking_total,
                "already_paid": already_paid,
                "remaining_balance": (booking_total - already_paid).max(0),
                "requested": requested,
            })),
            AppErrorKind::Domain(DomainError::DuplicatePayment {
                existing_transaction_id,
                ..
            }) => Some(json!({ "existing_transaction_id": existing_transaction_id })),
            AppErrorKind::Validation(ValidationError::MissingField { field })
            | AppErrorKind::Validation(ValidationError::InvalidField { field, .. }) => {
                Some(json!({ "field": field }))
            }
            AppErrorKind::External(ExternalError::GatewayUnavailable {
                outcome_unknown, ..
            }) => Some(json!({ "outcome_unknown": outcome_unknown })),
            _ => None,
        }
    }
}

fn capitalize(value: &str) -> String {
    let mut chars = value.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.context {
            Some(context) => write!(f, "{} ({})", self.user_message(), context),
            None => write!(f, "{}", self.user_message()),
        }
    }
}

impl std::error::Error for AppError {}

// Conversions from specific error types
// Note: From<DatabaseError> lives in database/error.rs and From<PaymentError> in payments/error.rs

impl From<ScheduleError> for AppError {
    fn from(err: ScheduleError) -> Self {
        let kind = match err {
            ScheduleError::InvalidTotal(amount) => {
                AppErrorKind::Validation(ValidationError::InvalidAmount {
                    amount: amount.to_string(),
                    reason: err.to_string(),
                })
            }
            ScheduleError::InvalidCount(_) => AppErrorKind::Validation(ValidationError::OutOfRange {
                field: "installment_count".to_string(),
                min: Some("1".to_string()),
                max: None,
            }),
            ScheduleError::DateOutOfRange => AppErrorKind::Validation(ValidationError::InvalidField {
                field: "start_date".to_string(),
                reason: err.to_string(),
            }),
            ScheduleError::NotActive(status) => {
                AppErrorKind::Domain(DomainError::InvalidStateTransition {
                    entity: "installment schedule".to_string(),
                    id: String::new(),
                    from: status.to_string(),
                    to: "charged".to_string(),
                })
            }
            ScheduleError::NothingRemaining => {
                AppErrorKind::Validation(ValidationError::InvalidAmount {
                    amount: "0".to_string(),
                    reason: err.to_string(),
                })
            }
            ScheduleError::NotOwner => AppErrorKind::Domain(DomainError::Forbidden {
                resource: "installment schedule".to_string(),
            }),
        };
        AppError::new(kind)
    }
}

/// Result type for operations that can fail with AppError
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::risk::{CheckResult, RiskCheck, RiskLevel};
    use std::collections::BTreeMap;

    #[test]
    fn test_payment_blocked_carries_assessment() {
        let mut checks = BTreeMap::new();
        checks.insert(RiskCheck::Duplicate, CheckResult::fail(json!({})));
        checks.insert(RiskCheck::Velocity, CheckResult::pass(json!({})));
        let error = AppError::new(AppErrorKind::Domain(DomainError::PaymentBlocked {
            assessment: Box::new(RiskAssessment {
                checks,
                risk_score: 9,
                risk_level: RiskLevel::High,
                approved: false,
                blocking_failures: vec![RiskCheck::Duplicate],
                assessed_at: chrono::Utc::now(),
            }),
        }));

        assert_eq!(error.status_code(), 422);
        assert_eq!(error.error_code(), ErrorCode::PaymentBlocked);
        let details = error.details().unwrap();
        assert_eq!(details["failed_checks"], json!(["duplicate"]));
        assert!(!error.is_retryable());
    }

    #[test]
    fn test_insufficient_balance_reports_remaining() {
        let error = AppError::new(AppErrorKind::Domain(
            DomainError::InsufficientRemainingBalance {
                booking_total: 2_000_000,
                already_paid: 1_500_000,
                requested: 800_000,
            },
        ));

        assert_eq!(error.error_code(), ErrorCode::InsufficientRemainingBalance);
        assert_eq!(error.details().unwrap()["remaining_balance"], json!(500_000));
        assert!(error.user_message().contains("500000"));
    }

    #[test]
    fn test_unknown_gateway_outcome_is_not_retryable() {
        let unknown = AppError::new(AppErrorKind::External(ExternalError::GatewayUnavailable {
            provider: "momo".to_string(),
            reason: "timeout".to_string(),
            outcome_unknown: true,
        }));
        let down = AppError::new(AppErrorKind::External(ExternalError::GatewayUnavailable {
            provider: "momo".to_string(),
            reason: "connection refused".to_string(),
            outcome_unknown: false,
        }));

        assert_eq!(unknown.status_code(), 503);
        assert!(!unknown.is_retryable());
        assert!(down.is_retryable());
    }

    #[test]
    fn test_validation_error() {
        let error = AppError::invalid_amount(-100, "Amount must be positive");

        assert_eq!(error.status_code(), 400);
        assert_eq!(error.error_code(), ErrorCode::ValidationError);
        assert!(!error.is_retryable());
    }

    #[test]
    fn test_schedule_error_mapping() {
        let error: AppError = ScheduleError::NotOwner.into();
        assert_eq!(error.status_code(), 403);

        let error: AppError = ScheduleError::InvalidCount(0).into();
        assert_eq!(error.status_code(), 400);
    }
}
