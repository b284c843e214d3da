use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::ParseEnumError;
use crate::payments::types::ProviderName;

/// Lifecycle of the money owed for one booking attempt.
///
/// `pending -> completed | failed` and `completed -> refunded` are the only
/// legal moves. Failed and refunded payments are never reopened.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    #[serde(alias = "paid")]
    Completed,
    Failed,
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Completed => "completed",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Refunded => "refunded",
        }
    }

    pub fn valid_transitions(&self) -> &'static [PaymentStatus] {
        match self {
            PaymentStatus::Pending => &[PaymentStatus::Completed, PaymentStatus::Failed],
            PaymentStatus::Completed => &[PaymentStatus::Refunded],
            PaymentStatus::Failed | PaymentStatus::Refunded => &[],
        }
    }

    pub fn can_transition_to(&self, next: PaymentStatus) -> bool {
        self.valid_transitions().contains(&next)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PaymentStatus::Failed | PaymentStatus::Refunded)
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentStatus {
    type Err = ParseEnumError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "pending" => Ok(PaymentStatus::Pending),
            "completed" | "paid" => Ok(PaymentStatus::Completed),
            "failed" => Ok(PaymentStatus::Failed),
            "refunded" => Ok(PaymentStatus::Refunded),
            _ => Err(ParseEnumError::new("payment status", value)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Payment {
    pub id: Uuid,
    pub booking_id: Uuid,
    pub customer_id: Uuid,
    /// Minor units of `currency`.
    pub amount: i64,
    pub currency: String,
    pub method: ProviderName,
    pub status: PaymentStatus,
    /// Our order reference, sent to the gateway and echoed back in callbacks.
    pub order_id: String,
    pub request_id: String,
    pub external_transaction_id: Option<String>,
    pub pay_url: Option<String>,
    pub installment_schedule_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
}

/// Input for opening a new payment record.
#[derive(Debug, Clone)]
pub struct NewPayment {
    pub booking_id: Uuid,
    pub customer_id: Uuid,
    pub amount: i64,
    pub currency: String,
    pub method: ProviderName,
    pub installment_schedule_id: Option<Uuid>,
}

impl Payment {
    pub fn open(new: NewPayment, now: DateTime<Utc>) -> Self {
        let id = Uuid::new_v4();
        Self {
            id,
            booking_id: new.booking_id,
            customer_id: new.customer_id,
            amount: new.amount,
            currency: new.currency,
            method: new.method,
            status: PaymentStatus::Pending,
            order_id: order_reference(id),
            request_id: Uuid::new_v4().to_string(),
            external_transaction_id: None,
            pay_url: None,
            installment_schedule_id: new.installment_schedule_id,
            created_at: now,
            updated_at: now,
            paid_at: None,
        }
    }

    /// Applies `next` in memory. Same-state requests are accepted as no-ops
    /// so replays stay harmless; the caller decides whether that matters.
    pub fn transition(
        &mut self,
        next: PaymentStatus,
        now: DateTime<Utc>,
    ) -> Result<bool, PaymentStatus> {
        if self.status == next {
            return Ok(false);
        }
        if !self.status.can_transition_to(next) {
            return Err(self.status);
        }
        self.status = next;
        self.updated_at = now;
        if next == PaymentStatus::Completed {
            self.paid_at = Some(now);
        }
        Ok(true)
    }
}

/// Gateways cap order ids at 50 chars and reject most punctuation.
pub fn order_reference(payment_id: Uuid) -> String {
    format!("HS{}", payment_id.simple()).to_uppercase()
}
