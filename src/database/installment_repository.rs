use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{FromRow, PgConnection, PgPool};
use uuid::Uuid;

use crate::database::error::{DatabaseError, DbResult};
use crate::database::repository::InstallmentRepository;
use crate::domain::installment::{InstallmentSchedule, ScheduleStatus};

const SCHEDULE_COLUMNS: &str = "id, customer_id, booking_id, total_amount, installment_count, \
     installment_amount, frequency, start_date, end_date, status, next_payment_date, \
     completed_installments, remaining_amount, cancellation_reason, reminder_sent_for, \
     created_at, updated_at";

#[derive(Debug, FromRow)]
struct ScheduleRow {
    id: Uuid,
    customer_id: Uuid,
    booking_id: Uuid,
    total_amount: i64,
    installment_count: i32,
    installment_amount: i64,
    frequency: String,
    start_date: NaiveDate,
    end_date: NaiveDate,
    status: String,
    next_payment_date: Option<NaiveDate>,
    completed_installments: i32,
    remaining_amount: i64,
    cancellation_reason: Option<String>,
    reminder_sent_for: Option<NaiveDate>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ScheduleRow> for InstallmentSchedule {
    type Error = DatabaseError;

    fn try_from(row: ScheduleRow) -> Result<Self, Self::Error> {
        Ok(InstallmentSchedule {
            id: row.id,
            customer_id: row.customer_id,
            booking_id: row.booking_id,
            total_amount: row.total_amount,
            installment_count: row.installment_count,
            installment_amount: row.installment_amount,
            frequency: row.frequency.parse()?,
            start_date: row.start_date,
            end_date: row.end_date,
            status: row.status.parse()?,
            next_payment_date: row.next_payment_date,
            completed_installments: row.completed_installments,
            remaining_amount: row.remaining_amount,
            cancellation_reason: row.cancellation_reason,
            reminder_sent_for: row.reminder_sent_for,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Row lock for use inside a settlement transaction.
pub(crate) async fn lock_schedule(
    conn: &mut PgConnection,
    id: Uuid,
) -> DbResult<Option<InstallmentSchedule>> {
    let row = sqlx::query_as::<_, ScheduleRow>(&format!(
        "SELECT {} FROM installment_schedules WHERE id = $1 FOR UPDATE",
        SCHEDULE_COLUMNS
    ))
    .bind(id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(DatabaseError::from_sqlx)?;
    row.map(InstallmentSchedule::try_from).transpose()
}

/// Writes the mutable columns back, guarded by the progress the caller read.
pub(crate) async fn write_schedule_progress(
    conn: &mut PgConnection,
    schedule: &InstallmentSchedule,
    expected_completed: i32,
) -> DbResult<bool> {
    write_schedule(conn, schedule, expected_completed, None).await
}

async fn write_schedule(
    conn: &mut PgConnection,
    schedule: &InstallmentSchedule,
    expected_completed: i32,
    expected_status: Option<ScheduleStatus>,
) -> DbResult<bool> {
    let updated = sqlx::query(
        "UPDATE installment_schedules
         SET status = $2,
             next_payment_date = $3,
             completed_installments = $4,
             remaining_amount = $5,
             cancellation_reason = $6,
             reminder_sent_for = $7,
             updated_at = $8
         WHERE id = $1
           AND completed_installments = $9
           AND ($10::TEXT IS NULL OR status = $10)",
    )
    .bind(schedule.id)
    .bind(schedule.status.as_str())
    .bind(schedule.next_payment_date)
    .bind(schedule.completed_installments)
    .bind(schedule.remaining_amount)
    .bind(&schedule.cancellation_reason)
    .bind(schedule.reminder_sent_for)
    .bind(schedule.updated_at)
    .bind(expected_completed)
    .bind(expected_status.map(|s| s.as_str()))
    .execute(&mut *conn)
    .await
    .map_err(DatabaseError::from_sqlx)?
    .rows_affected();
    Ok(updated > 0)
}

#[derive(Clone)]
pub struct PgInstallmentRepository {
    pool: PgPool,
}

impl PgInstallmentRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl InstallmentRepository for PgInstallmentRepository {
    async fn insert_schedule(&self, schedule: &InstallmentSchedule) -> DbResult<()> {
        sqlx::query(
            "INSERT INTO installment_schedules
             (id, customer_id, booking_id, total_amount, installment_count, installment_amount,
              frequency, start_date, end_date, status, next_payment_date, completed_installments,
              remaining_amount, cancellation_reason, reminder_sent_for, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)",
        )
        .bind(schedule.id)
        .bind(schedule.customer_id)
        .bind(schedule.booking_id)
        .bind(schedule.total_amount)
        .bind(schedule.installment_count)
        .bind(schedule.installment_amount)
        .bind(schedule.frequency.as_str())
        .bind(schedule.start_date)
        .bind(schedule.end_date)
        .bind(schedule.status.as_str())
        .bind(schedule.next_payment_date)
        .bind(schedule.completed_installments)
        .bind(schedule.remaining_amount)
        .bind(&schedule.cancellation_reason)
        .bind(schedule.reminder_sent_for)
        .bind(schedule.created_at)
        .bind(schedule.updated_at)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        Ok(())
    }

    async fn find_schedule(&self, id: Uuid) -> DbResult<Option<InstallmentSchedule>> {
        let row = sqlx::query_as::<_, ScheduleRow>(&format!(
            "SELECT {} FROM installment_schedules WHERE id = $1",
            SCHEDULE_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        row.map(InstallmentSchedule::try_from).transpose()
    }

    async fn find_active_for_booking(
        &self,
        booking_id: Uuid,
    ) -> DbResult<Option<InstallmentSchedule>> {
        let row = sqlx::query_as::<_, ScheduleRow>(&format!(
            "SELECT {} FROM installment_schedules WHERE booking_id = $1 AND status = 'active'",
            SCHEDULE_COLUMNS
        ))
        .bind(booking_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        row.map(InstallmentSchedule::try_from).transpose()
    }

    async fn try_acquire(
        &self,
        id: Uuid,
        holder: &str,
        until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> DbResult<bool> {
        let updated = sqlx::query(
            "UPDATE installment_schedules
             SET locked_by = $2, locked_until = $3
             WHERE id = $1
               AND (locked_by IS NULL OR locked_by = $2 OR locked_until <= $4)",
        )
        .bind(id)
        .bind(holder)
        .bind(until)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?
        .rows_affected();
        Ok(updated > 0)
    }

    async fn release(&self, id: Uuid, holder: &str) -> DbResult<()> {
        sqlx::query(
            "UPDATE installment_schedules SET locked_by = NULL, locked_until = NULL
             WHERE id = $1 AND locked_by = $2",
        )
        .bind(id)
        .bind(holder)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        Ok(())
    }

    async fn save_schedule(
        &self,
        schedule: &InstallmentSchedule,
        expected_completed: i32,
        expected_status: ScheduleStatus,
    ) -> DbResult<bool> {
        let mut conn = self.pool.acquire().await.map_err(DatabaseError::from_sqlx)?;
        write_schedule(&mut conn, schedule, expected_completed, Some(expected_status)).await
    }

    async fn find_due(&self, today: NaiveDate, limit: i64) -> DbResult<Vec<InstallmentSchedule>> {
        let rows = sqlx::query_as::<_, ScheduleRow>(&format!(
            "SELECT {} FROM installment_schedules
             WHERE status = 'active' AND next_payment_date <= $1
             ORDER BY next_payment_date
             LIMIT $2",
            SCHEDULE_COLUMNS
        ))
        .bind(today)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        rows.into_iter().map(InstallmentSchedule::try_from).collect()
    }
}
