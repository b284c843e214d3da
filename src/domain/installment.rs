use chrono::{DateTime, Days, Months, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

use super::ParseEnumError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Frequency {
    Weekly,
    Monthly,
    Quarterly,
    Yearly,
}

impl Frequency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Frequency::Weekly => "weekly",
            Frequency::Monthly => "monthly",
            Frequency::Quarterly => "quarterly",
            Frequency::Yearly => "yearly",
        }
    }

    /// `start` moved forward by `periods` whole periods.
    ///
    /// Always computed from the anchor date, so a schedule starting on the
    /// 31st lands on the last day of shorter months and returns to the 31st
    /// afterwards instead of drifting.
    pub fn advance(&self, start: NaiveDate, periods: u32) -> Option<NaiveDate> {
        match self {
            Frequency::Weekly => start.checked_add_days(Days::new(7 * u64::from(periods))),
            Frequency::Monthly => start.checked_add_months(Months::new(periods)),
            Frequency::Quarterly => start.checked_add_months(Months::new(periods.checked_mul(3)?)),
            Frequency::Yearly => start.checked_add_months(Months::new(periods.checked_mul(12)?)),
        }
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Frequency {
    type Err = ParseEnumError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "weekly" => Ok(Frequency::Weekly),
            "monthly" => Ok(Frequency::Monthly),
            "quarterly" => Ok(Frequency::Quarterly),
            "yearly" | "annually" => Ok(Frequency::Yearly),
            _ => Err(ParseEnumError::new("frequency", value)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleStatus {
    Active,
    Completed,
    Cancelled,
}

impl ScheduleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleStatus::Active => "active",
            ScheduleStatus::Completed => "completed",
            ScheduleStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ScheduleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScheduleStatus {
    type Err = ParseEnumError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "active" => Ok(ScheduleStatus::Active),
            "completed" => Ok(ScheduleStatus::Completed),
            "cancelled" => Ok(ScheduleStatus::Cancelled),
            _ => Err(ParseEnumError::new("schedule status", value)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    #[error("total amount must be positive, got {0}")]
    InvalidTotal(i64),
    #[error("installment count must be at least 1, got {0}")]
    InvalidCount(i32),
    #[error("schedule dates fall outside the supported calendar range")]
    DateOutOfRange,
    #[error("schedule is {0}, not active")]
    NotActive(ScheduleStatus),
    #[error("schedule has no remaining balance")]
    NothingRemaining,
    #[error("schedule belongs to another customer")]
    NotOwner,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstallmentSchedule {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub booking_id: Uuid,
    pub total_amount: i64,
    pub installment_count: i32,
    pub installment_amount: i64,
    pub frequency: Frequency,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub status: ScheduleStatus,
    pub next_payment_date: Option<NaiveDate>,
    pub completed_installments: i32,
    pub remaining_amount: i64,
    pub cancellation_reason: Option<String>,
    /// Due date a reminder was last sent for.
    pub reminder_sent_for: Option<NaiveDate>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Result of charging one installment against a schedule.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppliedInstallment {
    pub schedule_id: Uuid,
    pub amount_charged: i64,
    pub remaining_amount: i64,
    pub is_completed: bool,
    pub next_payment_date: Option<NaiveDate>,
}

impl InstallmentSchedule {
    pub fn new(
        customer_id: Uuid,
        booking_id: Uuid,
        total_amount: i64,
        installment_count: i32,
        frequency: Frequency,
        start_date: NaiveDate,
        now: DateTime<Utc>,
    ) -> Result<Self, ScheduleError> {
        if total_amount <= 0 {
            return Err(ScheduleError::InvalidTotal(total_amount));
        }
        if installment_count < 1 {
            return Err(ScheduleError::InvalidCount(installment_count));
        }
        let count = i64::from(installment_count);
        let installment_amount = total_amount / count + i64::from(total_amount % count != 0);
        let end_date = frequency
            .advance(start_date, installment_count as u32)
            .ok_or(ScheduleError::DateOutOfRange)?;

        Ok(Self {
            id: Uuid::new_v4(),
            customer_id,
            booking_id,
            total_amount,
            installment_count,
            installment_amount,
            frequency,
            start_date,
            end_date,
            status: ScheduleStatus::Active,
            next_payment_date: Some(start_date),
            completed_installments: 0,
            remaining_amount: total_amount,
            cancellation_reason: None,
            reminder_sent_for: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// Amount the next charge should collect. The last installment takes
    /// whatever remainder is left.
    pub fn next_charge_amount(&self) -> i64 {
        self.installment_amount.min(self.remaining_amount)
    }

    /// Due date after `completed` installments have been paid.
    pub fn calculate_next_payment_date(&self, completed: i32) -> Option<NaiveDate> {
        self.frequency.advance(self.start_date, completed as u32)
    }

    pub fn is_due(&self, today: NaiveDate) -> bool {
        self.status == ScheduleStatus::Active
            && self.next_payment_date.map_or(false, |due| due <= today)
    }

    pub fn apply_payment(&mut self, now: DateTime<Utc>) -> Result<AppliedInstallment, ScheduleError> {
        if self.status != ScheduleStatus::Active {
            return Err(ScheduleError::NotActive(self.status));
        }
        if self.remaining_amount <= 0 {
            return Err(ScheduleError::NothingRemaining);
        }

        let amount_charged = self.next_charge_amount();
        self.remaining_amount -= amount_charged;
        self.completed_installments += 1;
        self.updated_at = now;

        if self.remaining_amount == 0 {
            self.status = ScheduleStatus::Completed;
            self.next_payment_date = None;
        } else {
            self.next_payment_date = self.calculate_next_payment_date(self.completed_installments);
        }

        Ok(AppliedInstallment {
            schedule_id: self.id,
            amount_charged,
            remaining_amount: self.remaining_amount,
            is_completed: self.status == ScheduleStatus::Completed,
            next_payment_date: self.next_payment_date,
        })
    }

    pub fn cancel(
        &mut self,
        customer_id: Uuid,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), ScheduleError> {
        if self.customer_id != customer_id {
            return Err(ScheduleError::NotOwner);
        }
        if self.status != ScheduleStatus::Active {
            return Err(ScheduleError::NotActive(self.status));
        }
        self.status = ScheduleStatus::Cancelled;
        self.next_payment_date = None;
        self.cancellation_reason = reason;
        self.updated_at = now;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn schedule(total: i64, count: i32, frequency: Frequency) -> InstallmentSchedule {
        InstallmentSchedule::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            total,
            count,
            frequency,
            date(2024, 1, 31),
            Utc::now(),
        )
        .unwrap()
    }

    #[test]
    fn installment_amount_is_rounded_up() {
        assert_eq!(schedule(1_000_000, 3, Frequency::Monthly).installment_amount, 333_334);
        assert_eq!(schedule(900_000, 3, Frequency::Monthly).installment_amount, 300_000);
    }

    #[test]
    fn end_date_is_count_periods_after_start() {
        let s = schedule(1_000_000, 3, Frequency::Monthly);
        assert_eq!(s.end_date, date(2024, 4, 30));
        let q = schedule(1_000_000, 2, Frequency::Quarterly);
        assert_eq!(q.end_date, date(2024, 7, 31));
        let w = schedule(1_000_000, 2, Frequency::Weekly);
        assert_eq!(w.end_date, date(2024, 2, 14));
        let y = schedule(1_000_000, 1, Frequency::Yearly);
        assert_eq!(y.end_date, date(2025, 1, 31));
    }

    #[test]
    fn monthly_due_dates_do_not_drift_after_short_months() {
        let mut s = schedule(400, 4, Frequency::Monthly);
        assert_eq!(s.next_payment_date, Some(date(2024, 1, 31)));
        s.apply_payment(Utc::now()).unwrap();
        assert_eq!(s.next_payment_date, Some(date(2024, 2, 29)));
        s.apply_payment(Utc::now()).unwrap();
        assert_eq!(s.next_payment_date, Some(date(2024, 3, 31)));
    }

    #[test]
    fn final_installment_absorbs_remainder() {
        let mut s = schedule(1_000_000, 3, Frequency::Monthly);
        let first = s.apply_payment(Utc::now()).unwrap();
        let second = s.apply_payment(Utc::now()).unwrap();
        let last = s.apply_payment(Utc::now()).unwrap();
        assert_eq!(first.amount_charged, 333_334);
        assert_eq!(second.amount_charged, 333_334);
        assert_eq!(last.amount_charged, 333_332);
        assert!(last.is_completed);
        assert_eq!(s.remaining_amount, 0);
        assert_eq!(s.next_payment_date, None);
        assert_eq!(s.status, ScheduleStatus::Completed);
    }

    #[test]
    fn applying_to_a_completed_schedule_fails() {
        let mut s = schedule(100, 1, Frequency::Weekly);
        s.apply_payment(Utc::now()).unwrap();
        assert_eq!(
            s.apply_payment(Utc::now()),
            Err(ScheduleError::NotActive(ScheduleStatus::Completed))
        );
    }

    #[test]
    fn cancel_only_while_active_and_by_owner() {
        let mut s = schedule(1_000, 2, Frequency::Weekly);
        assert_eq!(
            s.cancel(Uuid::new_v4(), None, Utc::now()),
            Err(ScheduleError::NotOwner)
        );
        let owner = s.customer_id;
        s.cancel(owner, Some("changed plans".to_string()), Utc::now())
            .unwrap();
        assert_eq!(s.status, ScheduleStatus::Cancelled);
        assert_eq!(s.next_payment_date, None);
        assert_eq!(
            s.cancel(owner, None, Utc::now()),
            Err(ScheduleError::NotActive(ScheduleStatus::Cancelled))
        );
        assert!(s.apply_payment(Utc::now()).is_err());
    }

    #[test]
    fn rejects_invalid_input() {
        let start = date(2024, 1, 1);
        assert_eq!(
            InstallmentSchedule::new(Uuid::new_v4(), Uuid::new_v4(), 0, 3, Frequency::Monthly, start, Utc::now())
                .unwrap_err(),
            ScheduleError::InvalidTotal(0)
        );
        assert_eq!(
            InstallmentSchedule::new(Uuid::new_v4(), Uuid::new_v4(), 100, 0, Frequency::Monthly, start, Utc::now())
                .unwrap_err(),
            ScheduleError::InvalidCount(0)
        );
    }

    #[test]
    fn due_only_when_active_and_date_reached() {
        let s = schedule(1_000, 2, Frequency::Monthly);
        assert!(!s.is_due(date(2024, 1, 30)));
        assert!(s.is_due(date(2024, 1, 31)));
    }
}
