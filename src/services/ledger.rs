//! Transaction ledger service
//!
//! The only writer of payments and payment transactions. Every mutation goes
//! through one repository call so the adapter can make it atomic; this layer
//! adds validation, state-table checks, idempotency and logging.

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::database::repository::{
    AttemptOpening, GatewayCorrelation, LedgerRepository, NewPaymentAttempt, PaymentEffect,
    RefundInsertion, Settlement, SettlementOutcome,
};
use crate::domain::payment::{NewPayment, Payment, PaymentStatus};
use crate::domain::transaction::{
    AttemptContext, PaymentTransaction, TransactionStatus, TransactionType,
};
use crate::error::{AppError, AppErrorKind, AppResult, DomainError};
use crate::payments::types::ProviderName;

#[derive(Clone)]
pub struct TransactionLedger {
    repo: Arc<dyn LedgerRepository>,
}

impl TransactionLedger {
    pub fn new(repo: Arc<dyn LedgerRepository>) -> Self {
        Self { repo }
    }

    // =========================================================================
    // Creation
    // =========================================================================

    /// Opens a `pending` payment. Nothing is written until a transaction is
    /// attached, see [`TransactionLedger::open_attempt`].
    pub fn create_payment(&self, new: NewPayment) -> AppResult<Payment> {
        if new.amount <= 0 {
            return Err(AppError::invalid_amount(
                new.amount,
                "amount must be greater than zero",
            ));
        }
        if new.currency.trim().is_empty() {
            return Err(AppError::invalid_field("currency", "currency is required"));
        }
        Ok(Payment::open(new, Utc::now()))
    }

    /// Persists a standalone payment row.
    pub async fn insert_payment(&self, payment: &Payment) -> AppResult<()> {
        self.repo.insert_payment(payment).await?;
        Ok(())
    }

    /// Appends a `pending` payment-type transaction to an existing payment.
    /// Refunds go through [`TransactionLedger::create_refund`] instead.
    pub async fn create_transaction(
        &self,
        payment_id: Uuid,
        transaction_type: TransactionType,
        amount: i64,
        fee: i64,
        provider: ProviderName,
        context: &AttemptContext,
    ) -> AppResult<PaymentTransaction> {
        if transaction_type == TransactionType::Refund {
            return Err(AppError::invalid_field(
                "transaction_type",
                "refunds must reference a completed transaction",
            ));
        }
        if amount <= 0 {
            return Err(AppError::invalid_amount(amount, "amount must be greater than zero"));
        }
        if fee < 0 || fee > amount {
            return Err(AppError::invalid_amount(fee, "fee must be between zero and the amount"));
        }

        let payment = self.find_payment(payment_id).await?;
        let mut transaction = PaymentTransaction::for_payment(&payment, fee, context, Utc::now());
        transaction.provider = provider;
        transaction.gross_amount = amount;
        transaction.net_amount = amount - fee;

        self.repo.insert_transaction(&transaction).await?;

        info!(
            payment_id = %payment_id,
            transaction_id = %transaction.id,
            amount,
            fee,
            "Ledger transaction created"
        );
        Ok(transaction)
    }

    /// Writes the payment and its first transaction together, refusing when
    /// an equivalent attempt exists since `duplicate_since` or when the
    /// booking's committed money plus this amount would pass `booking_total`.
    pub async fn open_attempt(
        &self,
        payment: &Payment,
        transaction: &PaymentTransaction,
        duplicate_since: DateTime<Utc>,
        booking_total: i64,
    ) -> AppResult<()> {
        let opening = self
            .repo
            .open_payment_attempt(NewPaymentAttempt {
                payment: payment.clone(),
                transaction: transaction.clone(),
                duplicate_since,
                booking_total,
            })
            .await?;

        match opening {
            AttemptOpening::Opened => {
                info!(
                    payment_id = %payment.id,
                    transaction_id = %transaction.id,
                    order_id = %payment.order_id,
                    booking_id = %payment.booking_id,
                    amount = payment.amount,
                    "Payment attempt opened"
                );
                Ok(())
            }
            AttemptOpening::Duplicate {
                existing_transaction_id,
            } => {
                warn!(
                    booking_id = %payment.booking_id,
                    customer_id = %payment.customer_id,
                    existing_transaction_id = %existing_transaction_id,
                    "Duplicate payment attempt refused"
                );
                Err(AppError::new(AppErrorKind::Domain(
                    DomainError::DuplicatePayment {
                        booking_id: payment.booking_id.to_string(),
                        existing_transaction_id: Some(existing_transaction_id.to_string()),
                    },
                )))
            }
            AttemptOpening::ExceedsBookingTotal { already_committed } => {
                warn!(
                    booking_id = %payment.booking_id,
                    already_committed,
                    requested = payment.amount,
                    booking_total,
                    "Payment attempt would overpay booking"
                );
                Err(AppError::new(AppErrorKind::Domain(
                    DomainError::InsufficientRemainingBalance {
                        booking_total,
                        already_paid: already_committed,
                        requested: payment.amount,
                    },
                )))
            }
        }
    }

    // =========================================================================
    // Transitions
    // =========================================================================

    /// One-shot terminal transition. A transaction that already left
    /// `pending` is returned unchanged, so webhook replays are harmless.
    pub async fn transition_transaction(
        &self,
        id: Uuid,
        new_status: TransactionStatus,
        gateway_response: Option<JsonValue>,
        failure_reason: Option<String>,
    ) -> AppResult<PaymentTransaction> {
        let current = self.find_transaction(id).await?;
        if !new_status.is_terminal() {
            if current.status == new_status {
                return Ok(current);
            }
            return Err(AppError::invalid_transition(
                "transaction",
                id,
                current.status,
                new_status,
            ));
        }

        let outcome = self
            .settle(Settlement {
                transaction_id: id,
                status: new_status,
                gateway_transaction_id: None,
                gateway_response,
                gateway_outcome: None,
                failure_reason,
                payment_effect: PaymentEffect::Unchanged,
                confirm_booking: false,
                settled_at: Utc::now(),
            })
            .await?;

        Ok(match outcome {
            SettlementOutcome::Applied { transaction, .. } => transaction,
            SettlementOutcome::AlreadySettled { transaction } => transaction,
        })
    }

    /// Applies the payment state table. Same-state requests are no-ops;
    /// anything the table forbids is `InvalidStateTransition`.
    pub async fn transition_payment(
        &self,
        id: Uuid,
        new_status: PaymentStatus,
    ) -> AppResult<Payment> {
        let current = self.find_payment(id).await?;
        if current.status == new_status {
            return Ok(current);
        }
        if !current.status.can_transition_to(new_status) {
            return Err(AppError::invalid_transition(
                "payment",
                id,
                current.status,
                new_status,
            ));
        }

        match self
            .repo
            .update_payment_status(id, current.status, new_status, Utc::now())
            .await?
        {
            Some(updated) => {
                info!(
                    payment_id = %id,
                    order_id = %updated.order_id,
                    from = %current.status,
                    to = %new_status,
                    "Payment status transitioned"
                );
                Ok(updated)
            }
            None => {
                // Another writer moved it first
                let latest = self.find_payment(id).await?;
                if latest.status == new_status {
                    Ok(latest)
                } else {
                    Err(AppError::invalid_transition(
                        "payment",
                        id,
                        latest.status,
                        new_status,
                    ))
                }
            }
        }
    }

    /// Settles a pending transaction and applies the requested payment and
    /// booking side effects in one unit of work.
    pub async fn settle(&self, settlement: Settlement) -> AppResult<SettlementOutcome> {
        let transaction_id = settlement.transaction_id;
        let status = settlement.status;
        let outcome = self.repo.settle_transaction(settlement).await?;

        match &outcome {
            SettlementOutcome::Applied {
                transaction,
                payment,
                booking_confirmed,
                installment,
            } => info!(
                transaction_id = %transaction_id,
                payment_id = %payment.id,
                order_id = %payment.order_id,
                from = "pending",
                to = %status,
                payment_status = %payment.status,
                booking_confirmed,
                installment_applied = installment.is_some(),
                failure_reason = transaction.failure_reason.as_deref().unwrap_or(""),
                "Transaction settled"
            ),
            SettlementOutcome::AlreadySettled { transaction } => debug!(
                transaction_id = %transaction_id,
                current = %transaction.status,
                requested = %status,
                "Transaction already settled, ignoring"
            ),
        }
        Ok(outcome)
    }

    pub async fn record_gateway_response(&self, correlation: GatewayCorrelation) -> AppResult<()> {
        debug!(
            transaction_id = %correlation.transaction_id,
            outcome = correlation.outcome.as_str(),
            "Recording gateway response"
        );
        self.repo.record_gateway_response(correlation).await?;
        Ok(())
    }

    // =========================================================================
    // Refunds
    // =========================================================================

    /// Inserts a `pending` refund against a completed payment transaction.
    /// The bound is the original net amount minus every pending or completed
    /// refund already recorded, checked atomically by the repository.
    pub async fn create_refund(
        &self,
        original_transaction_id: Uuid,
        amount: i64,
        reason: Option<String>,
    ) -> AppResult<PaymentTransaction> {
        if amount <= 0 {
            return Err(AppError::invalid_amount(amount, "refund amount must be greater than zero"));
        }

        let original = self.find_transaction(original_transaction_id).await?;
        if original.transaction_type != TransactionType::Payment {
            return Err(AppError::invalid_field(
                "original_transaction_id",
                "only payment transactions can be refunded",
            ));
        }
        if original.status != TransactionStatus::Completed {
            return Err(AppError::invalid_field(
                "original_transaction_id",
                format!("transaction is {}, not completed", original.status),
            ));
        }
        if amount > original.net_amount {
            return Err(AppError::invalid_amount(
                amount,
                format!("refund exceeds the net amount {}", original.net_amount),
            ));
        }

        let refund = PaymentTransaction::for_refund(&original, amount, reason, Utc::now());
        match self.repo.insert_refund(&refund, original.net_amount).await? {
            RefundInsertion::Inserted => {
                info!(
                    refund_id = %refund.id,
                    original_transaction_id = %original.id,
                    payment_id = %original.payment_id,
                    amount,
                    "Refund transaction created"
                );
                Ok(refund)
            }
            RefundInsertion::ExceedsBound { already_refunded } => Err(AppError::invalid_amount(
                amount,
                format!(
                    "only {} of the net amount {} remains refundable",
                    (original.net_amount - already_refunded).max(0),
                    original.net_amount
                ),
            )),
            RefundInsertion::OriginalNotCompleted { status } => Err(AppError::invalid_field(
                "original_transaction_id",
                format!("transaction is {}, not completed", status),
            )),
        }
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub async fn find_payment(&self, id: Uuid) -> AppResult<Payment> {
        self.repo
            .find_payment(id)
            .await?
            .ok_or_else(|| AppError::not_found("payment", id))
    }

    pub async fn find_payment_by_order_id(&self, order_id: &str) -> AppResult<Payment> {
        self.repo
            .find_payment_by_order_id(order_id)
            .await?
            .ok_or_else(|| AppError::not_found("payment", order_id))
    }

    pub async fn find_transaction(&self, id: Uuid) -> AppResult<PaymentTransaction> {
        self.repo
            .find_transaction(id)
            .await?
            .ok_or_else(|| AppError::not_found("transaction", id))
    }

    pub async fn payment_transaction(&self, payment_id: Uuid) -> AppResult<PaymentTransaction> {
        self.repo
            .find_payment_transaction(payment_id)
            .await?
            .ok_or_else(|| AppError::not_found("transaction", payment_id))
    }

    pub async fn list_transactions(&self, payment_id: Uuid) -> AppResult<Vec<PaymentTransaction>> {
        Ok(self.repo.list_transactions_for_payment(payment_id).await?)
    }

    pub async fn committed_total_for_booking(&self, booking_id: Uuid) -> AppResult<i64> {
        Ok(self.repo.committed_total_for_booking(booking_id).await?)
    }

    pub async fn find_stale_pending(
        &self,
        initiated_before: DateTime<Utc>,
        providers: &[ProviderName],
        limit: i64,
    ) -> AppResult<Vec<PaymentTransaction>> {
        Ok(self
            .repo
            .find_stale_pending(initiated_before, providers, limit)
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::memory::InMemoryStore;
    use crate::error::ErrorCode;

    fn ledger() -> TransactionLedger {
        TransactionLedger::new(Arc::new(InMemoryStore::new()))
    }

    fn new_payment(amount: i64) -> NewPayment {
        NewPayment {
            booking_id: Uuid::new_v4(),
            customer_id: Uuid::new_v4(),
            amount,
            currency: "VND".to_string(),
            method: ProviderName::Momo,
            installment_schedule_id: None,
        }
    }

    async fn completed_attempt(
        ledger: &TransactionLedger,
        amount: i64,
        fee: i64,
    ) -> (Payment, PaymentTransaction) {
        let payment = ledger.create_payment(new_payment(amount)).unwrap();
        let tx =
            PaymentTransaction::for_payment(&payment, fee, &AttemptContext::default(), Utc::now());
        ledger
            .open_attempt(&payment, &tx, Utc::now() - chrono::Duration::minutes(5), amount)
            .await
            .unwrap();
        let settled = ledger
            .transition_transaction(tx.id, TransactionStatus::Completed, None, None)
            .await
            .unwrap();
        let payment = ledger
            .transition_payment(payment.id, PaymentStatus::Completed)
            .await
            .unwrap();
        (payment, settled)
    }

    #[test]
    fn non_positive_amount_is_rejected() {
        let err = ledger().create_payment(new_payment(0)).unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::ValidationError);
        assert!(ledger().create_payment(new_payment(-5)).is_err());
    }

    #[tokio::test]
    async fn create_transaction_computes_net() {
        let ledger = ledger();
        let payment = ledger.create_payment(new_payment(200_000)).unwrap();
        ledger.insert_payment(&payment).await.unwrap();

        let tx = ledger
            .create_transaction(
                payment.id,
                TransactionType::Payment,
                200_000,
                4_000,
                ProviderName::Momo,
                &AttemptContext::default(),
            )
            .await
            .unwrap();
        assert_eq!(tx.net_amount, 196_000);
        assert_eq!(tx.status, TransactionStatus::Pending);

        let refund = ledger
            .create_transaction(
                payment.id,
                TransactionType::Refund,
                1_000,
                0,
                ProviderName::Momo,
                &AttemptContext::default(),
            )
            .await;
        assert!(refund.is_err());
    }

    #[tokio::test]
    async fn terminal_transition_is_idempotent() {
        let ledger = ledger();
        let (_, settled) = completed_attempt(&ledger, 500_000, 10_000).await;

        let replay = ledger
            .transition_transaction(
                settled.id,
                TransactionStatus::Failed,
                None,
                Some("late failure".to_string()),
            )
            .await
            .unwrap();
        assert_eq!(replay.status, TransactionStatus::Completed);
        assert_eq!(replay.failure_reason, None);
    }

    #[tokio::test]
    async fn illegal_payment_transitions_fail() {
        let ledger = ledger();
        let (payment, _) = completed_attempt(&ledger, 500_000, 10_000).await;

        let err = ledger
            .transition_payment(payment.id, PaymentStatus::Pending)
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::InvalidStateTransition);

        let pending = ledger.create_payment(new_payment(10_000)).unwrap();
        ledger.insert_payment(&pending).await.unwrap();
        let err = ledger
            .transition_payment(pending.id, PaymentStatus::Refunded)
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::InvalidStateTransition);
    }

    #[tokio::test]
    async fn refund_of_full_net_amount_succeeds() {
        let ledger = ledger();
        let (_, original) = completed_attempt(&ledger, 1_000_000, 20_000).await;

        let refund = ledger
            .create_refund(original.id, 980_000, Some("guest cancelled".to_string()))
            .await
            .unwrap();
        assert_eq!(refund.gross_amount, -980_000);
        assert_eq!(refund.refunded_transaction_id, Some(original.id));
    }

    #[tokio::test]
    async fn refund_above_net_amount_fails() {
        let ledger = ledger();
        let (_, original) = completed_attempt(&ledger, 1_000_000, 20_000).await;

        let err = ledger
            .create_refund(original.id, 980_001, None)
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::ValidationError);
    }

    #[tokio::test]
    async fn cumulative_refunds_respect_the_bound() {
        let ledger = ledger();
        let (_, original) = completed_attempt(&ledger, 1_000_000, 0).await;

        ledger.create_refund(original.id, 600_000, None).await.unwrap();
        let err = ledger
            .create_refund(original.id, 400_001, None)
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::ValidationError);
        ledger.create_refund(original.id, 400_000, None).await.unwrap();
    }

    #[tokio::test]
    async fn refund_of_pending_transaction_fails() {
        let ledger = ledger();
        let payment = ledger.create_payment(new_payment(50_000)).unwrap();
        let tx =
            PaymentTransaction::for_payment(&payment, 0, &AttemptContext::default(), Utc::now());
        ledger
            .open_attempt(&payment, &tx, Utc::now(), payment.amount)
            .await
            .unwrap();

        let err = ledger.create_refund(tx.id, 10_000, None).await.unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::ValidationError);
    }
}
