use thiserror::Error;

use crate::domain::transaction::GatewayOutcome;

pub type PaymentResult<T> = Result<T, PaymentError>;

#[derive(Debug, Clone, Error)]
pub enum PaymentError {
    #[error("Validation error: {message}")]
    ValidationError {
        message: String,
        field: Option<String>,
    },

    #[error("Payment declined: {message}")]
    PaymentDeclinedError {
        message: String,
        provider_code: Option<String>,
    },

    #[error("Network error: {message}")]
    NetworkError { message: String },

    #[error("Request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("Rate limit exceeded: {message}")]
    RateLimitError {
        message: String,
        retry_after_seconds: Option<u64>,
    },

    #[error("Invalid provider response: {message}")]
    InvalidResponse { message: String },

    #[error("Webhook verification failed: {message}")]
    WebhookVerificationError { message: String },

    #[error("{provider} does not support {operation}")]
    UnsupportedOperation {
        provider: String,
        operation: &'static str,
    },

    #[error("Provider error: provider={provider}, message={message}")]
    ProviderError {
        provider: String,
        message: String,
        provider_code: Option<String>,
        retryable: bool,
    },
}

impl PaymentError {
    pub fn is_retryable(&self) -> bool {
        match self {
            PaymentError::ValidationError { .. } => false,
            PaymentError::PaymentDeclinedError { .. } => false,
            PaymentError::NetworkError { .. } => true,
            PaymentError::Timeout { .. } => true,
            PaymentError::RateLimitError { .. } => true,
            PaymentError::InvalidResponse { .. } => false,
            PaymentError::WebhookVerificationError { .. } => false,
            PaymentError::UnsupportedOperation { .. } => false,
            PaymentError::ProviderError { retryable, .. } => *retryable,
        }
    }

    /// Whether the provider definitely refused the request, or we simply do
    /// not know what happened on its side.
    pub fn outcome(&self) -> GatewayOutcome {
        match self {
            PaymentError::ValidationError { .. }
            | PaymentError::PaymentDeclinedError { .. }
            | PaymentError::UnsupportedOperation { .. } => GatewayOutcome::Rejected,
            PaymentError::ProviderError { retryable, .. } if !retryable => {
                GatewayOutcome::Rejected
            }
            _ => GatewayOutcome::Unknown,
        }
    }

    pub fn http_status_code(&self) -> u16 {
        match self {
            PaymentError::ValidationError { .. } => 400,
            PaymentError::PaymentDeclinedError { .. } => 402,
            PaymentError::NetworkError { .. } => 503,
            PaymentError::Timeout { .. } => 504,
            PaymentError::RateLimitError { .. } => 429,
            PaymentError::InvalidResponse { .. } => 502,
            PaymentError::WebhookVerificationError { .. } => 400,
            PaymentError::UnsupportedOperation { .. } => 400,
            PaymentError::ProviderError { .. } => 502,
        }
    }

    pub fn user_message(&self) -> String {
        match self {
            PaymentError::ValidationError { message, .. } => message.clone(),
            PaymentError::PaymentDeclinedError { .. } => {
                "Payment was declined by the provider".to_string()
            }
            PaymentError::NetworkError { .. } | PaymentError::Timeout { .. } => {
                "Payment provider is temporarily unavailable".to_string()
            }
            PaymentError::RateLimitError { .. } => {
                "Too many requests to payment provider. Please retry shortly".to_string()
            }
            PaymentError::InvalidResponse { .. } => {
                "Payment provider returned an unreadable response".to_string()
            }
            PaymentError::WebhookVerificationError { .. } => {
                "Invalid webhook signature".to_string()
            }
            PaymentError::UnsupportedOperation { operation, .. } => {
                format!("This payment method does not support {}", operation)
            }
            PaymentError::ProviderError { .. } => "Payment provider returned an error".to_string(),
        }
    }
}

impl From<PaymentError> for crate::error::AppError {
    fn from(err: PaymentError) -> Self {
        use crate::error::{AppError, AppErrorKind, ExternalError, ValidationError};

        let kind = match &err {
            PaymentError::ValidationError { message, field } => {
                AppErrorKind::Validation(ValidationError::InvalidField {
                    field: field.clone().unwrap_or_else(|| "request".to_string()),
                    reason: message.clone(),
                })
            }
            PaymentError::UnsupportedOperation { operation, .. } => {
                AppErrorKind::Validation(ValidationError::InvalidField {
                    field: "method".to_string(),
                    reason: format!("{} is not supported", operation),
                })
            }
            PaymentError::PaymentDeclinedError {
                message,
                provider_code,
            } => AppErrorKind::External(ExternalError::GatewayRejected {
                provider: "payments".to_string(),
                message: message.clone(),
                provider_code: provider_code.clone(),
            }),
            PaymentError::Timeout { timeout_secs } => AppErrorKind::External(ExternalError::Timeout {
                service: "payment provider".to_string(),
                timeout_secs: *timeout_secs,
            }),
            _ => AppErrorKind::External(ExternalError::GatewayUnavailable {
                provider: "payments".to_string(),
                reason: err.to_string(),
                outcome_unknown: false,
            }),
        };

        AppError::new(kind)
    }
}
