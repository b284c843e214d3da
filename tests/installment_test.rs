mod common;

use chrono::{NaiveDate, Utc};
use proptest::prelude::*;
use uuid::Uuid;

use common::{Harness, ScriptedGateway};
use homestay_payments::domain::booking::BookingStatus;
use homestay_payments::domain::installment::{Frequency, InstallmentSchedule, ScheduleStatus};
use homestay_payments::payments::types::ProviderName;
use homestay_payments::services::installment_scheduler::NewSchedule;
use homestay_payments::domain::transaction::AttemptContext;

fn start() -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 1, 31).unwrap()
}

proptest! {
    #[test]
    fn schedule_converges_to_exact_total(total in 1i64..1_000_000_000, count in 1i32..=24) {
        let mut schedule = InstallmentSchedule::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            total,
            count,
            Frequency::Monthly,
            start(),
            Utc::now(),
        )
        .unwrap();

        let mut charged = 0i64;
        let mut applications = 0;
        while schedule.status == ScheduleStatus::Active {
            let applied = schedule.apply_payment(Utc::now()).unwrap();
            prop_assert!(applied.amount_charged > 0);
            prop_assert!(applied.amount_charged <= schedule.installment_amount);
            charged += applied.amount_charged;
            applications += 1;
            prop_assert!(applications <= count);
        }

        prop_assert_eq!(charged, total);
        prop_assert_eq!(schedule.remaining_amount, 0);
        prop_assert_eq!(schedule.next_payment_date, None);
        prop_assert!(schedule.apply_payment(Utc::now()).is_err());
    }

    #[test]
    fn due_dates_never_precede_the_anchor(count in 1i32..=36, completed in 0i32..36) {
        let schedule = InstallmentSchedule::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            10_000_000,
            count,
            Frequency::Monthly,
            start(),
            Utc::now(),
        )
        .unwrap();
        let due = schedule.calculate_next_payment_date(completed).unwrap();
        prop_assert!(due >= start());
        prop_assert!(due <= schedule.frequency.advance(start(), 36).unwrap());
    }
}

#[tokio::test]
async fn test_settled_installment_payments_advance_the_plan() {
    let harness = Harness::new(vec![ScriptedGateway::accepting(ProviderName::Momo)]);
    let (customer, booking) = harness.booking(2_000_001).await;
    let scheduler = harness.orchestrator.scheduler();

    let schedule = scheduler
        .create_schedule(
            customer,
            NewSchedule {
                booking_id: booking,
                total_amount: 2_000_001,
                installment_count: 2,
                frequency: Frequency::Monthly,
                start_date: start(),
            },
        )
        .await
        .unwrap();
    assert_eq!(schedule.installment_amount, 1_000_001);

    let first = harness
        .orchestrator
        .initiate_installment_payment(customer, schedule.id, ProviderName::Momo, AttemptContext::default())
        .await
        .unwrap();
    assert_eq!(first.payment.amount, 1_000_001);
    assert_eq!(first.payment.installment_schedule_id, Some(schedule.id));

    // Unsettled attempts do not move the plan
    let unchanged = scheduler.get(schedule.id, customer).await.unwrap();
    assert_eq!(unchanged.completed_installments, 0);

    harness
        .orchestrator
        .handle_payment_success(&first.payment.order_id, None, None)
        .await
        .unwrap();
    let after_first = scheduler.get(schedule.id, customer).await.unwrap();
    assert_eq!(after_first.completed_installments, 1);
    assert_eq!(after_first.remaining_amount, 1_000_000);
    assert_eq!(
        after_first.next_payment_date,
        NaiveDate::from_ymd_opt(2026, 2, 28)
    );
    assert_eq!(
        harness.store.booking(booking).await.unwrap().status,
        BookingStatus::Confirmed
    );

    let second = harness
        .orchestrator
        .initiate_installment_payment(customer, schedule.id, ProviderName::Momo, AttemptContext::default())
        .await
        .unwrap();
    assert_eq!(second.payment.amount, 1_000_000);
    harness
        .orchestrator
        .handle_payment_success(&second.payment.order_id, None, None)
        .await
        .unwrap();
    // A replayed success must not charge the plan twice
    harness
        .orchestrator
        .handle_payment_success(&second.payment.order_id, None, None)
        .await
        .unwrap();

    let done = scheduler.get(schedule.id, customer).await.unwrap();
    assert_eq!(done.status, ScheduleStatus::Completed);
    assert_eq!(done.remaining_amount, 0);
    assert_eq!(done.completed_installments, 2);

    let err = harness
        .orchestrator
        .initiate_installment_payment(customer, schedule.id, ProviderName::Momo, AttemptContext::default())
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), 409);
}

#[tokio::test]
async fn test_failed_installment_payment_leaves_plan_untouched() {
    let harness = Harness::new(vec![ScriptedGateway::accepting(ProviderName::Momo)]);
    let (customer, booking) = harness.booking(3_000_000).await;
    let scheduler = harness.orchestrator.scheduler();
    let schedule = scheduler
        .create_schedule(
            customer,
            NewSchedule {
                booking_id: booking,
                total_amount: 3_000_000,
                installment_count: 3,
                frequency: Frequency::Weekly,
                start_date: start(),
            },
        )
        .await
        .unwrap();

    let payment = harness
        .orchestrator
        .initiate_installment_payment(customer, schedule.id, ProviderName::Momo, AttemptContext::default())
        .await
        .unwrap();
    harness
        .orchestrator
        .handle_payment_failure(&payment.payment.order_id, "declined", None)
        .await
        .unwrap();

    let plan = scheduler.get(schedule.id, customer).await.unwrap();
    assert_eq!(plan.completed_installments, 0);
    assert_eq!(plan.remaining_amount, 3_000_000);
    assert_eq!(plan.status, ScheduleStatus::Active);
}

#[tokio::test]
async fn test_cancelled_plan_cannot_be_charged() {
    let harness = Harness::new(vec![ScriptedGateway::accepting(ProviderName::Momo)]);
    let (customer, booking) = harness.booking(3_000_000).await;
    let scheduler = harness.orchestrator.scheduler();
    let schedule = scheduler
        .create_schedule(
            customer,
            NewSchedule {
                booking_id: booking,
                total_amount: 3_000_000,
                installment_count: 3,
                frequency: Frequency::Monthly,
                start_date: start(),
            },
        )
        .await
        .unwrap();

    let cancelled = scheduler
        .cancel(schedule.id, customer, Some("trip postponed".to_string()))
        .await
        .unwrap();
    assert_eq!(cancelled.status, ScheduleStatus::Cancelled);

    let err = harness
        .orchestrator
        .initiate_installment_payment(customer, schedule.id, ProviderName::Momo, AttemptContext::default())
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), 409);
}
