use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    PaymentInitiated,
    PaymentSucceeded,
    PaymentFailed,
    RefundProcessed,
    InstallmentDue,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::PaymentInitiated => "payment_initiated",
            NotificationKind::PaymentSucceeded => "payment_succeeded",
            NotificationKind::PaymentFailed => "payment_failed",
            NotificationKind::RefundProcessed => "refund_processed",
            NotificationKind::InstallmentDue => "installment_due",
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum NotificationError {
    #[error("notification channel unavailable: {0}")]
    Unavailable(String),
    #[error("notification rejected: {0}")]
    Rejected(String),
}

/// Fire-and-forget user messages. Callers log failures and move on.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(
        &self,
        customer_id: Uuid,
        kind: NotificationKind,
        payload: JsonValue,
    ) -> Result<(), NotificationError>;
}

/// Writes notifications to the log. Delivery channels (push, email) plug in
/// behind the same trait.
#[derive(Debug, Default, Clone)]
pub struct LogNotificationSink;

impl LogNotificationSink {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl NotificationSink for LogNotificationSink {
    async fn notify(
        &self,
        customer_id: Uuid,
        kind: NotificationKind,
        payload: JsonValue,
    ) -> Result<(), NotificationError> {
        match kind {
            NotificationKind::PaymentFailed => warn!(
                customer_id = %customer_id,
                kind = kind.as_str(),
                payload = %payload,
                "🔔 NOTIFICATION: Payment Failed"
            ),
            NotificationKind::PaymentInitiated => info!(
                customer_id = %customer_id,
                kind = kind.as_str(),
                payload = %payload,
                "🔔 NOTIFICATION: Payment Initiated"
            ),
            NotificationKind::PaymentSucceeded => info!(
                customer_id = %customer_id,
                kind = kind.as_str(),
                payload = %payload,
                "🔔 NOTIFICATION: Payment Succeeded"
            ),
            NotificationKind::RefundProcessed => info!(
                customer_id = %customer_id,
                kind = kind.as_str(),
                payload = %payload,
                "🔔 NOTIFICATION: Refund Processed"
            ),
            NotificationKind::InstallmentDue => info!(
                customer_id = %customer_id,
                kind = kind.as_str(),
                payload = %payload,
                "🔔 NOTIFICATION: Installment Due"
            ),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn log_sink_never_fails() {
        let sink = LogNotificationSink::new();
        let result = sink
            .notify(
                Uuid::new_v4(),
                NotificationKind::PaymentSucceeded,
                serde_json::json!({ "amount": 500000 }),
            )
            .await;
        assert!(result.is_ok());
    }

    #[test]
    fn kinds_serialize_snake_case() {
        assert_eq!(
            serde_json::to_value(NotificationKind::InstallmentDue).unwrap(),
            serde_json::json!("installment_due")
        );
    }
}
