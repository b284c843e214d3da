//! Installment scheduler
//!
//! Owns the lifecycle of installment plans. Every mutation of an existing
//! schedule runs under an exclusive, expiring lease so two sweeps (or a sweep
//! and a customer request) never process the same schedule at once.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::database::repository::{BookingDirectory, InstallmentRepository};
use crate::domain::installment::{
    AppliedInstallment, Frequency, InstallmentSchedule, ScheduleStatus,
};
use crate::error::{AppError, AppErrorKind, AppResult, DomainError};
use crate::services::notification::{NotificationKind, NotificationSink};

/// Payment being applied to a plan outside the normal settlement path, e.g.
/// money collected at the front desk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledPaymentDetails {
    pub payment_id: Option<Uuid>,
    /// When set, must equal the amount the plan expects next.
    pub amount: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSchedule {
    pub booking_id: Uuid,
    pub total_amount: i64,
    pub installment_count: i32,
    pub frequency: Frequency,
    pub start_date: NaiveDate,
}

#[derive(Clone)]
pub struct InstallmentScheduler {
    schedules: Arc<dyn InstallmentRepository>,
    bookings: Arc<dyn BookingDirectory>,
    notifier: Arc<dyn NotificationSink>,
    instance_id: String,
    lease_ttl: Duration,
}

impl InstallmentScheduler {
    pub fn new(
        schedules: Arc<dyn InstallmentRepository>,
        bookings: Arc<dyn BookingDirectory>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            schedules,
            bookings,
            notifier,
            instance_id: format!("scheduler-{}", Uuid::new_v4().simple()),
            lease_ttl: Duration::seconds(60),
        }
    }

    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    /// Creates a plan for a booking the customer owns. A booking carries at
    /// most one active plan.
    pub async fn create_schedule(
        &self,
        customer_id: Uuid,
        request: NewSchedule,
    ) -> AppResult<InstallmentSchedule> {
        let booking = self
            .bookings
            .find_booking_with_details(request.booking_id)
            .await?
            .ok_or_else(|| AppError::not_found("booking", request.booking_id))?;
        if booking.owner_id != customer_id {
            return Err(AppError::forbidden("booking"));
        }
        if !booking.status.is_payable() {
            return Err(AppError::new(AppErrorKind::Domain(
                DomainError::BookingNotPayable {
                    booking_id: booking.id.to_string(),
                    status: booking.status.to_string(),
                },
            )));
        }
        if request.total_amount > booking.total_amount {
            return Err(AppError::invalid_amount(
                request.total_amount,
                format!("exceeds the booking total {}", booking.total_amount),
            ));
        }
        if self
            .schedules
            .find_active_for_booking(booking.id)
            .await?
            .is_some()
        {
            return Err(AppError::invalid_field(
                "booking_id",
                "booking already has an active installment plan",
            ));
        }

        let schedule = InstallmentSchedule::new(
            customer_id,
            booking.id,
            request.total_amount,
            request.installment_count,
            request.frequency,
            request.start_date,
            Utc::now(),
        )?;
        self.schedules.insert_schedule(&schedule).await?;

        info!(
            schedule_id = %schedule.id,
            booking_id = %schedule.booking_id,
            customer_id = %customer_id,
            total_amount = schedule.total_amount,
            installment_count = schedule.installment_count,
            installment_amount = schedule.installment_amount,
            frequency = %schedule.frequency,
            end_date = %schedule.end_date,
            "Installment schedule created"
        );
        Ok(schedule)
    }

    pub async fn find(&self, schedule_id: Uuid) -> AppResult<InstallmentSchedule> {
        self.schedules
            .find_schedule(schedule_id)
            .await?
            .ok_or_else(|| AppError::not_found("installment schedule", schedule_id))
    }

    /// Same as [`InstallmentScheduler::find`], restricted to the owner.
    pub async fn get(&self, schedule_id: Uuid, customer_id: Uuid) -> AppResult<InstallmentSchedule> {
        let schedule = self.find(schedule_id).await?;
        if schedule.customer_id != customer_id {
            return Err(AppError::forbidden("installment schedule"));
        }
        Ok(schedule)
    }

    /// Records one installment against the plan and advances its due date.
    pub async fn apply_scheduled_payment(
        &self,
        schedule_id: Uuid,
        details: ScheduledPaymentDetails,
    ) -> AppResult<AppliedInstallment> {
        self.with_lease(schedule_id, |mut schedule, now| async move {
            if let Some(amount) = details.amount {
                let expected = schedule.next_charge_amount();
                if amount != expected {
                    return Err(AppError::invalid_amount(
                        amount,
                        format!("the next installment is {}", expected),
                    ));
                }
            }

            let expected_completed = schedule.completed_installments;
            let applied = schedule.apply_payment(now)?;
            self.persist(&schedule, expected_completed).await?;

            info!(
                schedule_id = %schedule_id,
                payment_id = ?details.payment_id,
                amount_charged = applied.amount_charged,
                remaining_amount = applied.remaining_amount,
                is_completed = applied.is_completed,
                next_payment_date = ?applied.next_payment_date,
                "Installment applied"
            );
            Ok(applied)
        })
        .await
    }

    /// Only the plan's owner may cancel, and only while it is active.
    pub async fn cancel(
        &self,
        schedule_id: Uuid,
        customer_id: Uuid,
        reason: Option<String>,
    ) -> AppResult<InstallmentSchedule> {
        self.with_lease(schedule_id, |mut schedule, now| async move {
            let expected_completed = schedule.completed_installments;
            schedule.cancel(customer_id, reason, now)?;
            self.persist(&schedule, expected_completed).await?;

            info!(
                schedule_id = %schedule_id,
                customer_id = %customer_id,
                reason = schedule.cancellation_reason.as_deref().unwrap_or(""),
                "Installment schedule cancelled"
            );
            Ok(schedule)
        })
        .await
    }

    /// Active schedules whose next installment is due on or before `today`.
    pub async fn due_schedules(
        &self,
        today: NaiveDate,
        limit: i64,
    ) -> AppResult<Vec<InstallmentSchedule>> {
        let due = self.schedules.find_due(today, limit).await?;
        Ok(due.into_iter().filter(|s| s.is_due(today)).collect())
    }

    /// Sends one `InstallmentDue` notification per schedule and due date.
    /// Returns how many reminders went out.
    pub async fn send_due_reminders(&self, today: NaiveDate, limit: i64) -> AppResult<usize> {
        let mut sent = 0;
        for candidate in self.due_schedules(today, limit).await? {
            if candidate.reminder_sent_for.is_some()
                && candidate.reminder_sent_for == candidate.next_payment_date
            {
                continue;
            }

            let result = self
                .with_lease(candidate.id, |mut schedule, now| async move {
                    let due_date = match schedule.next_payment_date {
                        Some(date) if schedule.is_due(today) => date,
                        _ => return Ok(false),
                    };
                    if schedule.reminder_sent_for == Some(due_date) {
                        return Ok(false);
                    }

                    let payload = json!({
                        "schedule_id": schedule.id,
                        "booking_id": schedule.booking_id,
                        "due_date": due_date,
                        "amount": schedule.next_charge_amount(),
                        "remaining_amount": schedule.remaining_amount,
                    });
                    if let Err(e) = self
                        .notifier
                        .notify(schedule.customer_id, NotificationKind::InstallmentDue, payload)
                        .await
                    {
                        warn!(schedule_id = %schedule.id, error = %e, "installment reminder not delivered");
                        return Ok(false);
                    }

                    let expected_completed = schedule.completed_installments;
                    schedule.reminder_sent_for = Some(due_date);
                    schedule.updated_at = now;
                    self.persist(&schedule, expected_completed).await?;
                    Ok(true)
                })
                .await;

            match result {
                Ok(true) => sent += 1,
                Ok(false) => {}
                Err(e) if e.is_retryable() => {
                    info!(schedule_id = %candidate.id, "schedule busy, reminder deferred");
                }
                Err(e) => {
                    warn!(schedule_id = %candidate.id, error = %e, "installment reminder failed");
                }
            }
        }
        Ok(sent)
    }

    // =========================================================================
    // Lease handling
    // =========================================================================

    /// Runs `op` on a fresh copy of the schedule while holding its lease.
    async fn with_lease<T, F, Fut>(&self, schedule_id: Uuid, op: F) -> AppResult<T>
    where
        F: FnOnce(InstallmentSchedule, DateTime<Utc>) -> Fut,
        Fut: Future<Output = AppResult<T>>,
    {
        let holder = format!("{}:{}", self.instance_id, Uuid::new_v4().simple());
        let now = Utc::now();
        let acquired = self
            .schedules
            .try_acquire(schedule_id, &holder, now + self.lease_ttl, now)
            .await?;
        if !acquired {
            if self.schedules.find_schedule(schedule_id).await?.is_none() {
                return Err(AppError::not_found("installment schedule", schedule_id));
            }
            return Err(busy(schedule_id));
        }

        let result = match self.find(schedule_id).await {
            Ok(schedule) => op(schedule, Utc::now()).await,
            Err(e) => Err(e),
        };

        if let Err(e) = self.schedules.release(schedule_id, &holder).await {
            warn!(schedule_id = %schedule_id, error = %e, "failed to release schedule lease");
        }
        result
    }

    async fn persist(&self, schedule: &InstallmentSchedule, expected_completed: i32) -> AppResult<()> {
        let saved = self
            .schedules
            .save_schedule(schedule, expected_completed, ScheduleStatus::Active)
            .await?;
        if saved {
            Ok(())
        } else {
            Err(busy(schedule.id))
        }
    }
}

fn busy(schedule_id: Uuid) -> AppError {
    AppError::new(AppErrorKind::Domain(DomainError::ScheduleBusy {
        schedule_id: schedule_id.to_string(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::memory::InMemoryStore;
    use crate::domain::booking::{BookingDetails, BookingStatus};
    use crate::error::ErrorCode;
    use crate::services::notification::LogNotificationSink;

    async fn setup(total: i64) -> (InstallmentScheduler, InMemoryStore, Uuid, Uuid) {
        let store = InMemoryStore::new();
        let (customer, booking) = (Uuid::new_v4(), Uuid::new_v4());
        store
            .seed_booking(BookingDetails {
                id: booking,
                total_amount: total,
                status: BookingStatus::Pending,
                owner_id: customer,
            })
            .await;
        let scheduler = InstallmentScheduler::new(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            Arc::new(LogNotificationSink::new()),
        );
        (scheduler, store, customer, booking)
    }

    fn plan(booking_id: Uuid, total: i64, count: i32, start: NaiveDate) -> NewSchedule {
        NewSchedule {
            booking_id,
            total_amount: total,
            installment_count: count,
            frequency: Frequency::Monthly,
            start_date: start,
        }
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[tokio::test]
    async fn only_the_owner_can_create_a_plan() {
        let (scheduler, _, _, booking) = setup(3_000_000).await;
        let err = scheduler
            .create_schedule(Uuid::new_v4(), plan(booking, 3_000_000, 3, date(2024, 11, 1)))
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::Forbidden);
    }

    #[tokio::test]
    async fn second_active_plan_is_rejected() {
        let (scheduler, _, customer, booking) = setup(3_000_000).await;
        scheduler
            .create_schedule(customer, plan(booking, 3_000_000, 3, date(2024, 11, 1)))
            .await
            .unwrap();
        let err = scheduler
            .create_schedule(customer, plan(booking, 3_000_000, 2, date(2024, 11, 1)))
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::ValidationError);
    }

    #[tokio::test]
    async fn applying_every_installment_completes_the_plan() {
        let (scheduler, _, customer, booking) = setup(1_000_000).await;
        let schedule = scheduler
            .create_schedule(customer, plan(booking, 1_000_000, 3, date(2024, 1, 31)))
            .await
            .unwrap();
        assert_eq!(schedule.installment_amount, 333_334);

        let mut charged = Vec::new();
        for _ in 0..3 {
            let applied = scheduler
                .apply_scheduled_payment(
                    schedule.id,
                    ScheduledPaymentDetails {
                        payment_id: None,
                        amount: None,
                    },
                )
                .await
                .unwrap();
            charged.push(applied.amount_charged);
        }
        assert_eq!(charged, vec![333_334, 333_334, 333_332]);

        let done = scheduler.find(schedule.id).await.unwrap();
        assert_eq!(done.status, ScheduleStatus::Completed);
        assert_eq!(done.remaining_amount, 0);
        assert_eq!(done.next_payment_date, None);

        let err = scheduler
            .apply_scheduled_payment(
                schedule.id,
                ScheduledPaymentDetails {
                    payment_id: None,
                    amount: None,
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::InvalidStateTransition);
    }

    #[tokio::test]
    async fn wrong_installment_amount_is_rejected() {
        let (scheduler, _, customer, booking) = setup(900_000).await;
        let schedule = scheduler
            .create_schedule(customer, plan(booking, 900_000, 3, date(2024, 11, 1)))
            .await
            .unwrap();
        let err = scheduler
            .apply_scheduled_payment(
                schedule.id,
                ScheduledPaymentDetails {
                    payment_id: None,
                    amount: Some(100_000),
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::ValidationError);
        assert_eq!(scheduler.find(schedule.id).await.unwrap().completed_installments, 0);
    }

    #[tokio::test]
    async fn held_lease_makes_schedule_busy() {
        let (scheduler, store, customer, booking) = setup(900_000).await;
        let schedule = scheduler
            .create_schedule(customer, plan(booking, 900_000, 3, date(2024, 11, 1)))
            .await
            .unwrap();
        let now = Utc::now();
        assert!(store
            .try_acquire(schedule.id, "other-worker", now + Duration::minutes(5), now)
            .await
            .unwrap());

        let err = scheduler
            .cancel(schedule.id, customer, None)
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::ScheduleBusy);
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn cancel_requires_owner_and_active_plan() {
        let (scheduler, _, customer, booking) = setup(900_000).await;
        let schedule = scheduler
            .create_schedule(customer, plan(booking, 900_000, 3, date(2024, 11, 1)))
            .await
            .unwrap();

        let err = scheduler
            .cancel(schedule.id, Uuid::new_v4(), None)
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::Forbidden);

        let cancelled = scheduler
            .cancel(schedule.id, customer, Some("trip postponed".to_string()))
            .await
            .unwrap();
        assert_eq!(cancelled.status, ScheduleStatus::Cancelled);
        assert_eq!(cancelled.next_payment_date, None);

        let err = scheduler.cancel(schedule.id, customer, None).await.unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::InvalidStateTransition);
    }

    #[tokio::test]
    async fn reminders_go_out_once_per_due_date() {
        let (scheduler, _, customer, booking) = setup(900_000).await;
        scheduler
            .create_schedule(customer, plan(booking, 900_000, 3, date(2024, 11, 1)))
            .await
            .unwrap();

        assert_eq!(scheduler.send_due_reminders(date(2024, 10, 31), 10).await.unwrap(), 0);
        assert_eq!(scheduler.send_due_reminders(date(2024, 11, 1), 10).await.unwrap(), 1);
        assert_eq!(scheduler.send_due_reminders(date(2024, 11, 2), 10).await.unwrap(), 0);
    }
}
