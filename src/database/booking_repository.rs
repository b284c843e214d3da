use async_trait::async_trait;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::database::error::{DatabaseError, DbResult};
use crate::database::repository::BookingDirectory;
use crate::domain::booking::{BookingDetails, BookingStatus};

#[derive(Debug, FromRow)]
struct BookingRow {
    id: Uuid,
    owner_id: Uuid,
    total_amount: i64,
    status: String,
}

impl TryFrom<BookingRow> for BookingDetails {
    type Error = DatabaseError;

    fn try_from(row: BookingRow) -> Result<Self, Self::Error> {
        Ok(BookingDetails {
            id: row.id,
            total_amount: row.total_amount,
            status: row.status.parse()?,
            owner_id: row.owner_id,
        })
    }
}

/// Read/flip access to the bookings table owned by the booking service.
#[derive(Clone)]
pub struct PgBookingDirectory {
    pool: PgPool,
}

impl PgBookingDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BookingDirectory for PgBookingDirectory {
    async fn find_booking_with_details(&self, id: Uuid) -> DbResult<Option<BookingDetails>> {
        let row = sqlx::query_as::<_, BookingRow>(
            "SELECT id, owner_id, total_amount, status FROM bookings WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        row.map(BookingDetails::try_from).transpose()
    }

    async fn set_booking_status(&self, id: Uuid, status: BookingStatus) -> DbResult<()> {
        let updated = sqlx::query("UPDATE bookings SET status = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(status.as_str())
            .execute(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?
            .rows_affected();
        if updated == 0 {
            return Err(DatabaseError::not_found("booking", id));
        }
        Ok(())
    }
}
