//! Persistence seams.
//!
//! Each trait is narrow and owns one set of invariants. Composite writes
//! (opening an attempt, settling, inserting a refund) are single methods so
//! every adapter can run them atomically.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::database::error::DbResult;
use crate::domain::booking::{BookingDetails, BookingStatus};
use crate::domain::installment::{AppliedInstallment, InstallmentSchedule, ScheduleStatus};
use crate::domain::payment::{Payment, PaymentStatus};
use crate::domain::transaction::{GatewayOutcome, PaymentTransaction, TransactionStatus};
use crate::payments::types::ProviderName;

/// Payment plus its first pending transaction, written together.
#[derive(Debug, Clone)]
pub struct NewPaymentAttempt {
    pub payment: Payment,
    pub transaction: PaymentTransaction,
    /// Pending or completed payment rows for the same customer, booking and
    /// amount initiated after this instant count as duplicates.
    pub duplicate_since: DateTime<Utc>,
    /// Ceiling for everything committed to the booking, this attempt included.
    pub booking_total: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOpening {
    Opened,
    Duplicate { existing_transaction_id: Uuid },
    /// In-flight and completed payments already cover too much of the booking.
    ExceedsBookingTotal { already_committed: i64 },
}

/// Synchronous gateway answer stored against a still-pending attempt.
#[derive(Debug, Clone)]
pub struct GatewayCorrelation {
    pub payment_id: Uuid,
    pub transaction_id: Uuid,
    pub outcome: GatewayOutcome,
    pub external_transaction_id: Option<String>,
    pub pay_url: Option<String>,
    pub gateway_response: JsonValue,
    pub failure_reason: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentEffect {
    Unchanged,
    /// `pending -> completed`
    MarkCompleted,
    /// `pending -> failed`
    MarkFailed,
    /// `completed -> refunded` once completed refunds cover the original net amount.
    MarkRefundedIfFullyRefunded,
}

#[derive(Debug, Clone)]
pub struct Settlement {
    pub transaction_id: Uuid,
    pub status: TransactionStatus,
    pub gateway_transaction_id: Option<String>,
    pub gateway_response: Option<JsonValue>,
    pub gateway_outcome: Option<GatewayOutcome>,
    pub failure_reason: Option<String>,
    pub payment_effect: PaymentEffect,
    /// Flip a `pending` booking to `confirmed` in the same unit of work.
    pub confirm_booking: bool,
    pub settled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum InstallmentApplication {
    Applied(AppliedInstallment),
    /// The money moved but the plan could not absorb it; kept for operators.
    Skipped { schedule_id: Uuid, reason: String },
}

#[derive(Debug, Clone)]
pub enum SettlementOutcome {
    Applied {
        transaction: PaymentTransaction,
        payment: Payment,
        booking_confirmed: bool,
        installment: Option<InstallmentApplication>,
    },
    /// The transaction was already terminal; nothing was written.
    AlreadySettled { transaction: PaymentTransaction },
}

#[derive(Debug, Clone, PartialEq)]
pub enum RefundInsertion {
    Inserted,
    ExceedsBound { already_refunded: i64 },
    OriginalNotCompleted { status: TransactionStatus },
}

#[async_trait]
pub trait LedgerRepository: Send + Sync {
    async fn insert_payment(&self, payment: &Payment) -> DbResult<()>;

    async fn insert_transaction(&self, transaction: &PaymentTransaction) -> DbResult<()>;

    /// Duplicate guard and both inserts, serialized per customer and booking.
    async fn open_payment_attempt(&self, attempt: NewPaymentAttempt) -> DbResult<AttemptOpening>;

    async fn find_payment(&self, id: Uuid) -> DbResult<Option<Payment>>;

    async fn find_payment_by_order_id(&self, order_id: &str) -> DbResult<Option<Payment>>;

    async fn find_transaction(&self, id: Uuid) -> DbResult<Option<PaymentTransaction>>;

    async fn list_transactions_for_payment(
        &self,
        payment_id: Uuid,
    ) -> DbResult<Vec<PaymentTransaction>>;

    /// The `payment`-type transaction opened with the payment.
    async fn find_payment_transaction(
        &self,
        payment_id: Uuid,
    ) -> DbResult<Option<PaymentTransaction>>;

    /// No-op when the transaction is no longer pending.
    async fn record_gateway_response(&self, correlation: GatewayCorrelation) -> DbResult<()>;

    async fn settle_transaction(&self, settlement: Settlement) -> DbResult<SettlementOutcome>;

    /// Conditional on the stored status still being `from`. Returns the
    /// updated row, or `None` when another writer got there first.
    async fn update_payment_status(
        &self,
        id: Uuid,
        from: PaymentStatus,
        to: PaymentStatus,
        at: DateTime<Utc>,
    ) -> DbResult<Option<Payment>>;

    /// Inserts `refund` only while the original is completed and pending plus
    /// completed refunds stay within `bound`.
    async fn insert_refund(
        &self,
        refund: &PaymentTransaction,
        bound: i64,
    ) -> DbResult<RefundInsertion>;

    /// Sum of pending and completed refunds against one transaction.
    async fn refunded_total(&self, original_transaction_id: Uuid) -> DbResult<i64>;

    /// Money committed to a booking: pending and completed payments minus
    /// completed refunds.
    async fn committed_total_for_booking(&self, booking_id: Uuid) -> DbResult<i64>;

    /// Pending payment rows of the given providers, oldest first.
    async fn find_stale_pending(
        &self,
        initiated_before: DateTime<Utc>,
        providers: &[ProviderName],
        limit: i64,
    ) -> DbResult<Vec<PaymentTransaction>>;
}

/// Historical reads behind the risk checks. Only `payment`-type rows count.
#[async_trait]
pub trait RiskHistoryRepository: Send + Sync {
    /// `(sum of gross amounts, count)` of completed payments.
    async fn completed_totals_since(
        &self,
        customer_id: Uuid,
        since: DateTime<Utc>,
    ) -> DbResult<(i64, i64)>;

    async fn attempts_since(&self, customer_id: Uuid, since: DateTime<Utc>) -> DbResult<i64>;

    async fn failed_attempts_since(&self, customer_id: Uuid, since: DateTime<Utc>)
        -> DbResult<i64>;

    async fn recent_duplicate(
        &self,
        customer_id: Uuid,
        booking_id: Uuid,
        amount: i64,
        since: DateTime<Utc>,
    ) -> DbResult<Option<Uuid>>;

    async fn other_customers_on_ip(
        &self,
        client_ip: &str,
        customer_id: Uuid,
        since: DateTime<Utc>,
    ) -> DbResult<i64>;

    async fn recent_devices(
        &self,
        customer_id: Uuid,
        since: DateTime<Utc>,
    ) -> DbResult<Vec<String>>;
}

#[async_trait]
pub trait InstallmentRepository: Send + Sync {
    async fn insert_schedule(&self, schedule: &InstallmentSchedule) -> DbResult<()>;

    async fn find_schedule(&self, id: Uuid) -> DbResult<Option<InstallmentSchedule>>;

    async fn find_active_for_booking(
        &self,
        booking_id: Uuid,
    ) -> DbResult<Option<InstallmentSchedule>>;

    /// Takes the exclusive lease on a schedule until `until`. Expired leases
    /// can be taken over.
    async fn try_acquire(
        &self,
        id: Uuid,
        holder: &str,
        until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> DbResult<bool>;

    async fn release(&self, id: Uuid, holder: &str) -> DbResult<()>;

    /// Writes `schedule` only if the stored row still has
    /// `expected_completed` installments and `expected_status`.
    async fn save_schedule(
        &self,
        schedule: &InstallmentSchedule,
        expected_completed: i32,
        expected_status: ScheduleStatus,
    ) -> DbResult<bool>;

    async fn find_due(&self, today: NaiveDate, limit: i64) -> DbResult<Vec<InstallmentSchedule>>;
}

/// The booking service, seen from the payment engine.
#[async_trait]
pub trait BookingDirectory: Send + Sync {
    async fn find_booking_with_details(&self, id: Uuid) -> DbResult<Option<BookingDetails>>;

    async fn set_booking_status(&self, id: Uuid, status: BookingStatus) -> DbResult<()>;
}
