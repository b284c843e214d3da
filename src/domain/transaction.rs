use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::payment::Payment;
use super::ParseEnumError;
use crate::payments::types::ProviderName;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Payment,
    Refund,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Payment => "payment",
            TransactionType::Refund => "refund",
        }
    }
}

impl FromStr for TransactionType {
    type Err = ParseEnumError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "payment" => Ok(TransactionType::Payment),
            "refund" => Ok(TransactionType::Refund),
            _ => Err(ParseEnumError::new("transaction type", value)),
        }
    }
}

/// One-shot lifecycle: a transaction leaves `pending` exactly once.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Completed => "completed",
            TransactionStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransactionStatus::Pending)
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionStatus {
    type Err = ParseEnumError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(TransactionStatus::Pending),
            "completed" => Ok(TransactionStatus::Completed),
            "failed" => Ok(TransactionStatus::Failed),
            _ => Err(ParseEnumError::new("transaction status", value)),
        }
    }
}

/// What the provider told us about an outbound request.
///
/// `Unknown` means we never got a definite answer (timeout, dropped
/// connection, garbage body). Such transactions stay pending until
/// reconciliation or a callback settles them.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum GatewayOutcome {
    Accepted,
    Rejected,
    Unknown,
}

impl GatewayOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            GatewayOutcome::Accepted => "accepted",
            GatewayOutcome::Rejected => "rejected",
            GatewayOutcome::Unknown => "unknown",
        }
    }
}

impl FromStr for GatewayOutcome {
    type Err = ParseEnumError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "accepted" => Ok(GatewayOutcome::Accepted),
            "rejected" => Ok(GatewayOutcome::Rejected),
            "unknown" => Ok(GatewayOutcome::Unknown),
            _ => Err(ParseEnumError::new("gateway outcome", value)),
        }
    }
}

/// Where a payment attempt came from. Feeds the risk checks.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AttemptContext {
    pub client_ip: Option<String>,
    pub device_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PaymentTransaction {
    pub id: Uuid,
    pub payment_id: Uuid,
    pub booking_id: Uuid,
    pub customer_id: Uuid,
    pub transaction_type: TransactionType,
    pub provider: ProviderName,
    /// Signed: refunds are stored negative.
    pub gross_amount: i64,
    pub currency: String,
    pub fee_amount: i64,
    pub net_amount: i64,
    pub status: TransactionStatus,
    pub gateway_transaction_id: Option<String>,
    pub gateway_response: Option<JsonValue>,
    pub gateway_outcome: Option<GatewayOutcome>,
    pub failure_reason: Option<String>,
    pub description: Option<String>,
    pub refunded_transaction_id: Option<Uuid>,
    pub client_ip: Option<String>,
    pub device_id: Option<String>,
    pub initiated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl PaymentTransaction {
    pub fn for_payment(
        payment: &Payment,
        fee_amount: i64,
        context: &AttemptContext,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            payment_id: payment.id,
            booking_id: payment.booking_id,
            customer_id: payment.customer_id,
            transaction_type: TransactionType::Payment,
            provider: payment.method,
            gross_amount: payment.amount,
            currency: payment.currency.clone(),
            fee_amount,
            net_amount: payment.amount - fee_amount,
            status: TransactionStatus::Pending,
            gateway_transaction_id: None,
            gateway_response: None,
            gateway_outcome: None,
            failure_reason: None,
            description: None,
            refunded_transaction_id: None,
            client_ip: context.client_ip.clone(),
            device_id: context.device_id.clone(),
            initiated_at: now,
            completed_at: None,
        }
    }

    /// Refunds carry no fee of their own; gross and net are both `-amount`.
    pub fn for_refund(
        original: &PaymentTransaction,
        amount: i64,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            payment_id: original.payment_id,
            booking_id: original.booking_id,
            customer_id: original.customer_id,
            transaction_type: TransactionType::Refund,
            provider: original.provider,
            gross_amount: -amount,
            currency: original.currency.clone(),
            fee_amount: 0,
            net_amount: -amount,
            status: TransactionStatus::Pending,
            gateway_transaction_id: None,
            gateway_response: None,
            gateway_outcome: None,
            failure_reason: None,
            description: reason,
            refunded_transaction_id: Some(original.id),
            client_ip: None,
            device_id: None,
            initiated_at: now,
            completed_at: None,
        }
    }

    /// Moves a pending transaction to a terminal state. Returns `false`
    /// without touching anything when the transaction is already terminal.
    pub fn settle(
        &mut self,
        status: TransactionStatus,
        gateway_transaction_id: Option<String>,
        gateway_response: Option<JsonValue>,
        failure_reason: Option<String>,
        now: DateTime<Utc>,
    ) -> bool {
        if self.status.is_terminal() || !status.is_terminal() {
            return false;
        }
        self.status = status;
        if gateway_transaction_id.is_some() {
            self.gateway_transaction_id = gateway_transaction_id;
        }
        if gateway_response.is_some() {
            self.gateway_response = gateway_response;
        }
        self.failure_reason = failure_reason;
        self.completed_at = Some(now);
        true
    }

    /// Absolute amount moved by a refund row.
    pub fn refund_amount(&self) -> i64 {
        match self.transaction_type {
            TransactionType::Refund => -self.gross_amount,
            TransactionType::Payment => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::payment::NewPayment;

    fn payment(amount: i64) -> Payment {
        Payment::open(
            NewPayment {
                booking_id: Uuid::new_v4(),
                customer_id: Uuid::new_v4(),
                amount,
                currency: "VND".to_string(),
                method: ProviderName::Momo,
                installment_schedule_id: None,
            },
            Utc::now(),
        )
    }

    #[test]
    fn net_is_gross_minus_fee() {
        let tx = PaymentTransaction::for_payment(
            &payment(1_000_000),
            22_000,
            &AttemptContext::default(),
            Utc::now(),
        );
        assert_eq!(tx.gross_amount, 1_000_000);
        assert_eq!(tx.net_amount, 978_000);
        assert_eq!(tx.status, TransactionStatus::Pending);
    }

    #[test]
    fn refund_is_stored_negative() {
        let original = PaymentTransaction::for_payment(
            &payment(1_000_000),
            22_000,
            &AttemptContext::default(),
            Utc::now(),
        );
        let refund = PaymentTransaction::for_refund(&original, 300_000, None, Utc::now());
        assert_eq!(refund.gross_amount, -300_000);
        assert_eq!(refund.net_amount, -300_000);
        assert_eq!(refund.refund_amount(), 300_000);
        assert_eq!(refund.refunded_transaction_id, Some(original.id));
    }

    #[test]
    fn settle_happens_once() {
        let mut tx = PaymentTransaction::for_payment(
            &payment(10_000),
            0,
            &AttemptContext::default(),
            Utc::now(),
        );
        assert!(tx.settle(
            TransactionStatus::Completed,
            Some("2304".to_string()),
            None,
            None,
            Utc::now()
        ));
        assert!(!tx.settle(
            TransactionStatus::Failed,
            None,
            None,
            Some("late".to_string()),
            Utc::now()
        ));
        assert_eq!(tx.status, TransactionStatus::Completed);
        assert_eq!(tx.failure_reason, None);
    }

    #[test]
    fn settle_to_pending_is_rejected() {
        let mut tx = PaymentTransaction::for_payment(
            &payment(10_000),
            0,
            &AttemptContext::default(),
            Utc::now(),
        );
        assert!(!tx.settle(TransactionStatus::Pending, None, None, None, Utc::now()));
        assert!(tx.completed_at.is_none());
    }
}
