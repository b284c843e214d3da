//! In-process implementation of every repository trait.
//!
//! One async mutex guards all state, so each trait method is atomic the same
//! way a single SQL transaction is. Used by the test suite and by local runs
//! with `SKIP_EXTERNALS=true`.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::database::error::{DatabaseError, DatabaseErrorKind, DbResult};
use crate::database::repository::{
    AttemptOpening, BookingDirectory, GatewayCorrelation, InstallmentApplication,
    InstallmentRepository, LedgerRepository, NewPaymentAttempt, PaymentEffect, RefundInsertion,
    RiskHistoryRepository, Settlement, SettlementOutcome,
};
use crate::domain::booking::{BookingDetails, BookingStatus};
use crate::domain::installment::{InstallmentSchedule, ScheduleStatus};
use crate::domain::payment::{Payment, PaymentStatus};
use crate::domain::transaction::{PaymentTransaction, TransactionStatus, TransactionType};
use crate::payments::types::ProviderName;

#[derive(Default)]
struct MemoryState {
    payments: HashMap<Uuid, Payment>,
    /// Insertion order doubles as creation order.
    transactions: Vec<PaymentTransaction>,
    schedules: HashMap<Uuid, InstallmentSchedule>,
    leases: HashMap<Uuid, (String, DateTime<Utc>)>,
    bookings: HashMap<Uuid, BookingDetails>,
}

impl MemoryState {
    fn transaction_index(&self, id: Uuid) -> DbResult<usize> {
        self.transactions
            .iter()
            .position(|t| t.id == id)
            .ok_or_else(|| DatabaseError::not_found("payment transaction", id))
    }

    fn duplicate_of(
        &self,
        customer_id: Uuid,
        booking_id: Uuid,
        amount: i64,
        since: DateTime<Utc>,
    ) -> Option<Uuid> {
        self.transactions
            .iter()
            .filter(|t| {
                t.transaction_type == TransactionType::Payment
                    && t.customer_id == customer_id
                    && t.booking_id == booking_id
                    && t.gross_amount == amount
                    && matches!(
                        t.status,
                        TransactionStatus::Pending | TransactionStatus::Completed
                    )
                    && t.initiated_at >= since
            })
            .max_by_key(|t| t.initiated_at)
            .map(|t| t.id)
    }

    fn committed_for_booking(&self, booking_id: Uuid) -> i64 {
        self.transactions
            .iter()
            .filter(|t| t.booking_id == booking_id)
            .filter(|t| match t.transaction_type {
                TransactionType::Payment => matches!(
                    t.status,
                    TransactionStatus::Pending | TransactionStatus::Completed
                ),
                TransactionType::Refund => t.status == TransactionStatus::Completed,
            })
            .map(|t| t.gross_amount)
            .sum()
    }

    fn refunds_against(&self, original_id: Uuid, statuses: &[TransactionStatus]) -> i64 {
        self.transactions
            .iter()
            .filter(|t| t.refunded_transaction_id == Some(original_id) && statuses.contains(&t.status))
            .map(PaymentTransaction::refund_amount)
            .sum()
    }

    fn payment_rows(&self, customer_id: Uuid) -> impl Iterator<Item = &PaymentTransaction> + '_ {
        self.transactions.iter().filter(move |t| {
            t.transaction_type == TransactionType::Payment && t.customer_id == customer_id
        })
    }
}

#[derive(Clone, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn seed_booking(&self, booking: BookingDetails) {
        self.state.lock().await.bookings.insert(booking.id, booking);
    }

    pub async fn booking(&self, id: Uuid) -> Option<BookingDetails> {
        self.state.lock().await.bookings.get(&id).cloned()
    }

    /// Snapshot of every ledger row, oldest first.
    pub async fn transactions(&self) -> Vec<PaymentTransaction> {
        self.state.lock().await.transactions.clone()
    }
}

#[async_trait]
impl LedgerRepository for InMemoryStore {
    async fn insert_payment(&self, payment: &Payment) -> DbResult<()> {
        let mut state = self.state.lock().await;
        if state.payments.contains_key(&payment.id)
            || state.payments.values().any(|p| p.order_id == payment.order_id)
        {
            return Err(DatabaseError::new(DatabaseErrorKind::UniqueViolation {
                constraint: Some("payments_order_id_key".to_string()),
            }));
        }
        state.payments.insert(payment.id, payment.clone());
        Ok(())
    }

    async fn insert_transaction(&self, transaction: &PaymentTransaction) -> DbResult<()> {
        let mut state = self.state.lock().await;
        if !state.payments.contains_key(&transaction.payment_id) {
            return Err(DatabaseError::not_found("payment", transaction.payment_id));
        }
        state.transactions.push(transaction.clone());
        Ok(())
    }

    async fn open_payment_attempt(&self, attempt: NewPaymentAttempt) -> DbResult<AttemptOpening> {
        let mut state = self.state.lock().await;
        let payment = &attempt.payment;
        if let Some(existing) = state.duplicate_of(
            payment.customer_id,
            payment.booking_id,
            payment.amount,
            attempt.duplicate_since,
        ) {
            return Ok(AttemptOpening::Duplicate {
                existing_transaction_id: existing,
            });
        }
        let already_committed = state.committed_for_booking(payment.booking_id);
        if already_committed.saturating_add(payment.amount) > attempt.booking_total {
            return Ok(AttemptOpening::ExceedsBookingTotal { already_committed });
        }

        state.payments.insert(payment.id, attempt.payment.clone());
        state.transactions.push(attempt.transaction);
        Ok(AttemptOpening::Opened)
    }

    async fn find_payment(&self, id: Uuid) -> DbResult<Option<Payment>> {
        Ok(self.state.lock().await.payments.get(&id).cloned())
    }

    async fn find_payment_by_order_id(&self, order_id: &str) -> DbResult<Option<Payment>> {
        Ok(self
            .state
            .lock()
            .await
            .payments
            .values()
            .find(|p| p.order_id == order_id)
            .cloned())
    }

    async fn find_transaction(&self, id: Uuid) -> DbResult<Option<PaymentTransaction>> {
        Ok(self
            .state
            .lock()
            .await
            .transactions
            .iter()
            .find(|t| t.id == id)
            .cloned())
    }

    async fn list_transactions_for_payment(
        &self,
        payment_id: Uuid,
    ) -> DbResult<Vec<PaymentTransaction>> {
        Ok(self
            .state
            .lock()
            .await
            .transactions
            .iter()
            .filter(|t| t.payment_id == payment_id)
            .cloned()
            .collect())
    }

    async fn find_payment_transaction(
        &self,
        payment_id: Uuid,
    ) -> DbResult<Option<PaymentTransaction>> {
        Ok(self
            .state
            .lock()
            .await
            .transactions
            .iter()
            .find(|t| t.payment_id == payment_id && t.transaction_type == TransactionType::Payment)
            .cloned())
    }

    async fn record_gateway_response(&self, correlation: GatewayCorrelation) -> DbResult<()> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let index = state.transaction_index(correlation.transaction_id)?;
        let transaction = &mut state.transactions[index];
        if transaction.status != TransactionStatus::Pending {
            return Ok(());
        }
        transaction.gateway_outcome = Some(correlation.outcome);
        transaction.gateway_response = Some(correlation.gateway_response);
        if correlation.external_transaction_id.is_some() {
            transaction.gateway_transaction_id = correlation.external_transaction_id.clone();
        }
        if correlation.failure_reason.is_some() {
            transaction.failure_reason = correlation.failure_reason;
        }

        if let Some(payment) = state.payments.get_mut(&correlation.payment_id) {
            if correlation.external_transaction_id.is_some() {
                payment.external_transaction_id = correlation.external_transaction_id;
            }
            if correlation.pay_url.is_some() {
                payment.pay_url = correlation.pay_url;
            }
            payment.updated_at = correlation.recorded_at;
        }
        Ok(())
    }

    async fn settle_transaction(&self, settlement: Settlement) -> DbResult<SettlementOutcome> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let index = state.transaction_index(settlement.transaction_id)?;

        let transaction = {
            let row = &mut state.transactions[index];
            if row.status.is_terminal() {
                return Ok(SettlementOutcome::AlreadySettled {
                    transaction: row.clone(),
                });
            }
            if !row.settle(
                settlement.status,
                settlement.gateway_transaction_id.clone(),
                settlement.gateway_response,
                settlement.failure_reason,
                settlement.settled_at,
            ) {
                return Err(DatabaseError::new(DatabaseErrorKind::Unknown {
                    message: format!("{} is not a terminal status", settlement.status),
                }));
            }
            if settlement.gateway_outcome.is_some() {
                row.gateway_outcome = settlement.gateway_outcome;
            }
            row.clone()
        };

        let refunded_completed = transaction
            .refunded_transaction_id
            .map(|original| {
                let net = state
                    .transactions
                    .iter()
                    .find(|t| t.id == original)
                    .map(|t| t.net_amount)
                    .unwrap_or(i64::MAX);
                (state.refunds_against(original, &[TransactionStatus::Completed]), net)
            });

        let payment = state
            .payments
            .get_mut(&transaction.payment_id)
            .ok_or_else(|| DatabaseError::not_found("payment", transaction.payment_id))?;

        let mut newly_completed = false;
        match settlement.payment_effect {
            PaymentEffect::Unchanged => {}
            PaymentEffect::MarkCompleted => {
                if payment.status == PaymentStatus::Pending {
                    newly_completed = payment
                        .transition(PaymentStatus::Completed, settlement.settled_at)
                        .unwrap_or(false);
                    if settlement.gateway_transaction_id.is_some() {
                        payment.external_transaction_id = settlement.gateway_transaction_id;
                    }
                }
            }
            PaymentEffect::MarkFailed => {
                if payment.status == PaymentStatus::Pending {
                    let _ = payment.transition(PaymentStatus::Failed, settlement.settled_at);
                }
            }
            PaymentEffect::MarkRefundedIfFullyRefunded => {
                if let Some((refunded, net)) = refunded_completed {
                    if payment.status == PaymentStatus::Completed && refunded >= net {
                        let _ = payment.transition(PaymentStatus::Refunded, settlement.settled_at);
                    }
                }
            }
        }
        let payment = payment.clone();

        let installment = match payment.installment_schedule_id {
            Some(schedule_id) if newly_completed => Some(match state.schedules.get_mut(&schedule_id) {
                Some(schedule) => match schedule.apply_payment(settlement.settled_at) {
                    Ok(applied) => InstallmentApplication::Applied(applied),
                    Err(err) => InstallmentApplication::Skipped {
                        schedule_id,
                        reason: err.to_string(),
                    },
                },
                None => InstallmentApplication::Skipped {
                    schedule_id,
                    reason: "schedule not found".to_string(),
                },
            }),
            _ => None,
        };

        let mut booking_confirmed = false;
        if settlement.confirm_booking && payment.status == PaymentStatus::Completed {
            if let Some(booking) = state.bookings.get_mut(&payment.booking_id) {
                if booking.status == BookingStatus::Pending {
                    booking.status = BookingStatus::Confirmed;
                    booking_confirmed = true;
                }
            }
        }

        Ok(SettlementOutcome::Applied {
            transaction,
            payment,
            booking_confirmed,
            installment,
        })
    }

    async fn update_payment_status(
        &self,
        id: Uuid,
        from: PaymentStatus,
        to: PaymentStatus,
        at: DateTime<Utc>,
    ) -> DbResult<Option<Payment>> {
        let mut state = self.state.lock().await;
        let payment = state
            .payments
            .get_mut(&id)
            .ok_or_else(|| DatabaseError::not_found("payment", id))?;
        if payment.status != from {
            return Ok(None);
        }
        match payment.transition(to, at) {
            Ok(_) => Ok(Some(payment.clone())),
            Err(_) => Ok(None),
        }
    }

    async fn insert_refund(
        &self,
        refund: &PaymentTransaction,
        bound: i64,
    ) -> DbResult<RefundInsertion> {
        let mut state = self.state.lock().await;
        let original_id = refund
            .refunded_transaction_id
            .ok_or_else(|| DatabaseError::decode("refund without original transaction"))?;
        let index = state.transaction_index(original_id)?;
        let status = state.transactions[index].status;
        if status != TransactionStatus::Completed {
            return Ok(RefundInsertion::OriginalNotCompleted { status });
        }

        let already_refunded = state.refunds_against(
            original_id,
            &[TransactionStatus::Pending, TransactionStatus::Completed],
        );
        if already_refunded + refund.refund_amount() > bound {
            return Ok(RefundInsertion::ExceedsBound { already_refunded });
        }

        state.transactions.push(refund.clone());
        Ok(RefundInsertion::Inserted)
    }

    async fn refunded_total(&self, original_transaction_id: Uuid) -> DbResult<i64> {
        Ok(self.state.lock().await.refunds_against(
            original_transaction_id,
            &[TransactionStatus::Pending, TransactionStatus::Completed],
        ))
    }

    async fn committed_total_for_booking(&self, booking_id: Uuid) -> DbResult<i64> {
        Ok(self.state.lock().await.committed_for_booking(booking_id))
    }

    async fn find_stale_pending(
        &self,
        initiated_before: DateTime<Utc>,
        providers: &[ProviderName],
        limit: i64,
    ) -> DbResult<Vec<PaymentTransaction>> {
        let state = self.state.lock().await;
        let mut stale: Vec<_> = state
            .transactions
            .iter()
            .filter(|t| {
                t.transaction_type == TransactionType::Payment
                    && t.status == TransactionStatus::Pending
                    && t.initiated_at < initiated_before
                    && providers.contains(&t.provider)
            })
            .cloned()
            .collect();
        stale.sort_by_key(|t| t.initiated_at);
        stale.truncate(limit.max(0) as usize);
        Ok(stale)
    }
}

#[async_trait]
impl RiskHistoryRepository for InMemoryStore {
    async fn completed_totals_since(
        &self,
        customer_id: Uuid,
        since: DateTime<Utc>,
    ) -> DbResult<(i64, i64)> {
        let state = self.state.lock().await;
        Ok(state
            .payment_rows(customer_id)
            .filter(|t| {
                t.status == TransactionStatus::Completed
                    && t.completed_at.unwrap_or(t.initiated_at) >= since
            })
            .fold((0, 0), |(sum, count), t| (sum + t.gross_amount, count + 1)))
    }

    async fn attempts_since(&self, customer_id: Uuid, since: DateTime<Utc>) -> DbResult<i64> {
        let state = self.state.lock().await;
        Ok(state
            .payment_rows(customer_id)
            .filter(|t| t.initiated_at >= since)
            .count() as i64)
    }

    async fn failed_attempts_since(
        &self,
        customer_id: Uuid,
        since: DateTime<Utc>,
    ) -> DbResult<i64> {
        let state = self.state.lock().await;
        Ok(state
            .payment_rows(customer_id)
            .filter(|t| t.status == TransactionStatus::Failed && t.initiated_at >= since)
            .count() as i64)
    }

    async fn recent_duplicate(
        &self,
        customer_id: Uuid,
        booking_id: Uuid,
        amount: i64,
        since: DateTime<Utc>,
    ) -> DbResult<Option<Uuid>> {
        Ok(self
            .state
            .lock()
            .await
            .duplicate_of(customer_id, booking_id, amount, since))
    }

    async fn other_customers_on_ip(
        &self,
        client_ip: &str,
        customer_id: Uuid,
        since: DateTime<Utc>,
    ) -> DbResult<i64> {
        let state = self.state.lock().await;
        let customers: HashSet<Uuid> = state
            .transactions
            .iter()
            .filter(|t| {
                t.client_ip.as_deref() == Some(client_ip)
                    && t.customer_id != customer_id
                    && t.initiated_at >= since
            })
            .map(|t| t.customer_id)
            .collect();
        Ok(customers.len() as i64)
    }

    async fn recent_devices(
        &self,
        customer_id: Uuid,
        since: DateTime<Utc>,
    ) -> DbResult<Vec<String>> {
        let state = self.state.lock().await;
        let mut devices: Vec<String> = state
            .payment_rows(customer_id)
            .filter(|t| t.initiated_at >= since)
            .filter_map(|t| t.device_id.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        devices.sort();
        Ok(devices)
    }
}

#[async_trait]
impl InstallmentRepository for InMemoryStore {
    async fn insert_schedule(&self, schedule: &InstallmentSchedule) -> DbResult<()> {
        self.state
            .lock()
            .await
            .schedules
            .insert(schedule.id, schedule.clone());
        Ok(())
    }

    async fn find_schedule(&self, id: Uuid) -> DbResult<Option<InstallmentSchedule>> {
        Ok(self.state.lock().await.schedules.get(&id).cloned())
    }

    async fn find_active_for_booking(
        &self,
        booking_id: Uuid,
    ) -> DbResult<Option<InstallmentSchedule>> {
        Ok(self
            .state
            .lock()
            .await
            .schedules
            .values()
            .find(|s| s.booking_id == booking_id && s.status == ScheduleStatus::Active)
            .cloned())
    }

    async fn try_acquire(
        &self,
        id: Uuid,
        holder: &str,
        until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> DbResult<bool> {
        let mut state = self.state.lock().await;
        if !state.schedules.contains_key(&id) {
            return Err(DatabaseError::not_found("installment schedule", id));
        }
        if let Some((current, expires)) = state.leases.get(&id) {
            if current != holder && *expires > now {
                return Ok(false);
            }
        }
        state.leases.insert(id, (holder.to_string(), until));
        Ok(true)
    }

    async fn release(&self, id: Uuid, holder: &str) -> DbResult<()> {
        let mut state = self.state.lock().await;
        if state.leases.get(&id).map_or(false, |(current, _)| current == holder) {
            state.leases.remove(&id);
        }
        Ok(())
    }

    async fn save_schedule(
        &self,
        schedule: &InstallmentSchedule,
        expected_completed: i32,
        expected_status: ScheduleStatus,
    ) -> DbResult<bool> {
        let mut state = self.state.lock().await;
        let stored = state
            .schedules
            .get_mut(&schedule.id)
            .ok_or_else(|| DatabaseError::not_found("installment schedule", schedule.id))?;
        if stored.completed_installments != expected_completed || stored.status != expected_status
        {
            return Ok(false);
        }
        *stored = schedule.clone();
        Ok(true)
    }

    async fn find_due(&self, today: NaiveDate, limit: i64) -> DbResult<Vec<InstallmentSchedule>> {
        let state = self.state.lock().await;
        let mut due: Vec<_> = state
            .schedules
            .values()
            .filter(|s| s.is_due(today))
            .cloned()
            .collect();
        due.sort_by_key(|s| s.next_payment_date);
        due.truncate(limit.max(0) as usize);
        Ok(due)
    }
}

#[async_trait]
impl BookingDirectory for InMemoryStore {
    async fn find_booking_with_details(&self, id: Uuid) -> DbResult<Option<BookingDetails>> {
        Ok(self.state.lock().await.bookings.get(&id).cloned())
    }

    async fn set_booking_status(&self, id: Uuid, status: BookingStatus) -> DbResult<()> {
        let mut state = self.state.lock().await;
        let booking = state
            .bookings
            .get_mut(&id)
            .ok_or_else(|| DatabaseError::not_found("booking", id))?;
        booking.status = status;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::payment::NewPayment;
    use crate::domain::transaction::AttemptContext;
    use chrono::Duration;

    fn attempt(customer_id: Uuid, booking_id: Uuid, amount: i64) -> NewPaymentAttempt {
        let now = Utc::now();
        let payment = Payment::open(
            NewPayment {
                booking_id,
                customer_id,
                amount,
                currency: "VND".to_string(),
                method: ProviderName::Momo,
                installment_schedule_id: None,
            },
            now,
        );
        let transaction =
            PaymentTransaction::for_payment(&payment, 10_000, &AttemptContext::default(), now);
        NewPaymentAttempt {
            payment,
            transaction,
            duplicate_since: now - Duration::minutes(5),
            booking_total: 5_000_000,
        }
    }

    #[tokio::test]
    async fn second_identical_attempt_is_duplicate() {
        let store = InMemoryStore::new();
        let (customer, booking) = (Uuid::new_v4(), Uuid::new_v4());

        let first = attempt(customer, booking, 500_000);
        let first_tx = first.transaction.id;
        assert_eq!(
            store.open_payment_attempt(first).await.unwrap(),
            AttemptOpening::Opened
        );
        assert_eq!(
            store
                .open_payment_attempt(attempt(customer, booking, 500_000))
                .await
                .unwrap(),
            AttemptOpening::Duplicate {
                existing_transaction_id: first_tx
            }
        );
        assert_eq!(
            store
                .open_payment_attempt(attempt(customer, booking, 400_000))
                .await
                .unwrap(),
            AttemptOpening::Opened
        );
    }

    #[tokio::test]
    async fn pending_attempts_reserve_booking_balance() {
        let store = InMemoryStore::new();
        let (customer, booking) = (Uuid::new_v4(), Uuid::new_v4());

        store
            .open_payment_attempt(attempt(customer, booking, 3_000_000))
            .await
            .unwrap();

        assert_eq!(
            store
                .open_payment_attempt(attempt(customer, booking, 2_500_000))
                .await
                .unwrap(),
            AttemptOpening::ExceedsBookingTotal {
                already_committed: 3_000_000
            }
        );
        assert_eq!(
            store
                .open_payment_attempt(attempt(customer, booking, 2_000_000))
                .await
                .unwrap(),
            AttemptOpening::Opened
        );
        assert_eq!(store.committed_total_for_booking(booking).await.unwrap(), 5_000_000);
    }

    #[tokio::test]
    async fn settlement_is_one_shot() {
        let store = InMemoryStore::new();
        let opened = attempt(Uuid::new_v4(), Uuid::new_v4(), 500_000);
        let tx_id = opened.transaction.id;
        store.open_payment_attempt(opened).await.unwrap();

        let settle = |status| Settlement {
            transaction_id: tx_id,
            status,
            gateway_transaction_id: Some("T1".to_string()),
            gateway_response: None,
            gateway_outcome: None,
            failure_reason: None,
            payment_effect: PaymentEffect::MarkCompleted,
            confirm_booking: true,
            settled_at: Utc::now(),
        };

        let first = store
            .settle_transaction(settle(TransactionStatus::Completed))
            .await
            .unwrap();
        assert!(matches!(first, SettlementOutcome::Applied { ref payment, .. } if payment.status == PaymentStatus::Completed));

        let second = store
            .settle_transaction(settle(TransactionStatus::Failed))
            .await
            .unwrap();
        match second {
            SettlementOutcome::AlreadySettled { transaction } => {
                assert_eq!(transaction.status, TransactionStatus::Completed)
            }
            other => panic!("expected AlreadySettled, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn lease_excludes_other_holders_until_expiry() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let schedule = InstallmentSchedule::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            900_000,
            3,
            crate::domain::installment::Frequency::Monthly,
            now.date_naive(),
            now,
        )
        .unwrap();
        store.insert_schedule(&schedule).await.unwrap();

        let until = now + Duration::seconds(30);
        assert!(store.try_acquire(schedule.id, "a", until, now).await.unwrap());
        assert!(!store.try_acquire(schedule.id, "b", until, now).await.unwrap());
        assert!(store
            .try_acquire(schedule.id, "b", until, now + Duration::seconds(31))
            .await
            .unwrap());
        store.release(schedule.id, "b").await.unwrap();
        assert!(store.try_acquire(schedule.id, "a", until, now).await.unwrap());
    }
}
