use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::{FromRow, PgConnection, PgPool};
use std::str::FromStr;
use tracing::warn;
use uuid::Uuid;

use crate::database::error::{DatabaseError, DbResult};
use crate::database::installment_repository::{
    lock_schedule, write_schedule_progress,
};
use crate::database::repository::{
    AttemptOpening, GatewayCorrelation, InstallmentApplication, LedgerRepository,
    NewPaymentAttempt, PaymentEffect, RefundInsertion, RiskHistoryRepository, Settlement,
    SettlementOutcome,
};
use crate::domain::payment::{Payment, PaymentStatus};
use crate::domain::transaction::{GatewayOutcome, PaymentTransaction, TransactionStatus};
use crate::payments::types::ProviderName;

const PAYMENT_COLUMNS: &str = "id, booking_id, customer_id, amount, currency, method, status, \
     order_id, request_id, external_transaction_id, pay_url, installment_schedule_id, \
     created_at, updated_at, paid_at";

const TRANSACTION_COLUMNS: &str = "id, payment_id, booking_id, customer_id, transaction_type, \
     provider, gross_amount, currency, fee_amount, net_amount, status, gateway_transaction_id, \
     gateway_response, gateway_outcome, failure_reason, description, refunded_transaction_id, \
     client_ip, device_id, initiated_at, completed_at";

/// In-flight and completed payments minus completed refunds.
const COMMITTED_FOR_BOOKING: &str = "SELECT COALESCE(SUM(gross_amount), 0)::BIGINT
     FROM payment_transactions
     WHERE booking_id = $1
       AND ((transaction_type = 'payment' AND status IN ('pending', 'completed'))
         OR (transaction_type = 'refund' AND status = 'completed'))";

#[derive(Debug, FromRow)]
struct PaymentRow {
    id: Uuid,
    booking_id: Uuid,
    customer_id: Uuid,
    amount: i64,
    currency: String,
    method: String,
    status: String,
    order_id: String,
    request_id: String,
    external_transaction_id: Option<String>,
    pay_url: Option<String>,
    installment_schedule_id: Option<Uuid>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    paid_at: Option<DateTime<Utc>>,
}

fn provider(value: &str) -> DbResult<ProviderName> {
    ProviderName::from_str(value).map_err(|e| DatabaseError::decode(e.to_string()))
}

impl TryFrom<PaymentRow> for Payment {
    type Error = DatabaseError;

    fn try_from(row: PaymentRow) -> Result<Self, Self::Error> {
        Ok(Payment {
            id: row.id,
            booking_id: row.booking_id,
            customer_id: row.customer_id,
            amount: row.amount,
            currency: row.currency,
            method: provider(&row.method)?,
            status: row.status.parse()?,
            order_id: row.order_id,
            request_id: row.request_id,
            external_transaction_id: row.external_transaction_id,
            pay_url: row.pay_url,
            installment_schedule_id: row.installment_schedule_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
            paid_at: row.paid_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct TransactionRow {
    id: Uuid,
    payment_id: Uuid,
    booking_id: Uuid,
    customer_id: Uuid,
    transaction_type: String,
    provider: String,
    gross_amount: i64,
    currency: String,
    fee_amount: i64,
    net_amount: i64,
    status: String,
    gateway_transaction_id: Option<String>,
    gateway_response: Option<JsonValue>,
    gateway_outcome: Option<String>,
    failure_reason: Option<String>,
    description: Option<String>,
    refunded_transaction_id: Option<Uuid>,
    client_ip: Option<String>,
    device_id: Option<String>,
    initiated_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<TransactionRow> for PaymentTransaction {
    type Error = DatabaseError;

    fn try_from(row: TransactionRow) -> Result<Self, Self::Error> {
        Ok(PaymentTransaction {
            id: row.id,
            payment_id: row.payment_id,
            booking_id: row.booking_id,
            customer_id: row.customer_id,
            transaction_type: row.transaction_type.parse()?,
            provider: provider(&row.provider)?,
            gross_amount: row.gross_amount,
            currency: row.currency,
            fee_amount: row.fee_amount,
            net_amount: row.net_amount,
            status: row.status.parse()?,
            gateway_transaction_id: row.gateway_transaction_id,
            gateway_response: row.gateway_response,
            gateway_outcome: row
                .gateway_outcome
                .as_deref()
                .map(GatewayOutcome::from_str)
                .transpose()?,
            failure_reason: row.failure_reason,
            description: row.description,
            refunded_transaction_id: row.refunded_transaction_id,
            client_ip: row.client_ip,
            device_id: row.device_id,
            initiated_at: row.initiated_at,
            completed_at: row.completed_at,
        })
    }
}

async fn insert_payment_row(conn: &mut PgConnection, payment: &Payment) -> DbResult<()> {
    sqlx::query(
        "INSERT INTO payments
         (id, booking_id, customer_id, amount, currency, method, status, order_id, request_id,
          external_transaction_id, pay_url, installment_schedule_id, created_at, updated_at, paid_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)",
    )
    .bind(payment.id)
    .bind(payment.booking_id)
    .bind(payment.customer_id)
    .bind(payment.amount)
    .bind(&payment.currency)
    .bind(payment.method.as_str())
    .bind(payment.status.as_str())
    .bind(&payment.order_id)
    .bind(&payment.request_id)
    .bind(&payment.external_transaction_id)
    .bind(&payment.pay_url)
    .bind(payment.installment_schedule_id)
    .bind(payment.created_at)
    .bind(payment.updated_at)
    .bind(payment.paid_at)
    .execute(&mut *conn)
    .await
    .map_err(DatabaseError::from_sqlx)?;
    Ok(())
}

async fn insert_transaction_row(
    conn: &mut PgConnection,
    transaction: &PaymentTransaction,
) -> DbResult<()> {
    sqlx::query(
        "INSERT INTO payment_transactions
         (id, payment_id, booking_id, customer_id, transaction_type, provider, gross_amount,
          currency, fee_amount, net_amount, status, gateway_transaction_id, gateway_response,
          gateway_outcome, failure_reason, description, refunded_transaction_id, client_ip,
          device_id, initiated_at, completed_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17,
                 $18, $19, $20, $21)",
    )
    .bind(transaction.id)
    .bind(transaction.payment_id)
    .bind(transaction.booking_id)
    .bind(transaction.customer_id)
    .bind(transaction.transaction_type.as_str())
    .bind(transaction.provider.as_str())
    .bind(transaction.gross_amount)
    .bind(&transaction.currency)
    .bind(transaction.fee_amount)
    .bind(transaction.net_amount)
    .bind(transaction.status.as_str())
    .bind(&transaction.gateway_transaction_id)
    .bind(&transaction.gateway_response)
    .bind(transaction.gateway_outcome.map(|o| o.as_str()))
    .bind(&transaction.failure_reason)
    .bind(&transaction.description)
    .bind(transaction.refunded_transaction_id)
    .bind(&transaction.client_ip)
    .bind(&transaction.device_id)
    .bind(transaction.initiated_at)
    .bind(transaction.completed_at)
    .execute(&mut *conn)
    .await
    .map_err(DatabaseError::from_sqlx)?;
    Ok(())
}

async fn select_payment(conn: &mut PgConnection, id: Uuid) -> DbResult<Payment> {
    let row = sqlx::query_as::<_, PaymentRow>(&format!(
        "SELECT {} FROM payments WHERE id = $1",
        PAYMENT_COLUMNS
    ))
    .bind(id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(DatabaseError::from_sqlx)?
    .ok_or_else(|| DatabaseError::not_found("payment", id))?;
    row.try_into()
}

/// Conditional status flip; `None` when the row was not in `from`.
async fn flip_payment_status(
    conn: &mut PgConnection,
    id: Uuid,
    from: PaymentStatus,
    to: PaymentStatus,
    at: DateTime<Utc>,
    external_transaction_id: Option<&str>,
) -> DbResult<Option<Payment>> {
    let row = sqlx::query_as::<_, PaymentRow>(&format!(
        "UPDATE payments
         SET status = $3,
             updated_at = $4,
             paid_at = CASE WHEN $3 = 'completed' THEN $4 ELSE paid_at END,
             external_transaction_id = COALESCE($5, external_transaction_id)
         WHERE id = $1 AND status = $2
         RETURNING {}",
        PAYMENT_COLUMNS
    ))
    .bind(id)
    .bind(from.as_str())
    .bind(to.as_str())
    .bind(at)
    .bind(external_transaction_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(DatabaseError::from_sqlx)?;
    row.map(Payment::try_from).transpose()
}

/// PostgreSQL ledger. Every composite write is one SQL transaction.
#[derive(Clone)]
pub struct PgLedgerRepository {
    pool: PgPool,
}

impl PgLedgerRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch_transactions(
        &self,
        filter: &str,
        id: Uuid,
    ) -> DbResult<Vec<PaymentTransaction>> {
        let rows = sqlx::query_as::<_, TransactionRow>(&format!(
            "SELECT {} FROM payment_transactions WHERE {} ORDER BY initiated_at, id",
            TRANSACTION_COLUMNS, filter
        ))
        .bind(id)
        .fetch_all(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        rows.into_iter().map(PaymentTransaction::try_from).collect()
    }
}

#[async_trait]
impl LedgerRepository for PgLedgerRepository {
    async fn insert_payment(&self, payment: &Payment) -> DbResult<()> {
        let mut conn = self.pool.acquire().await.map_err(DatabaseError::from_sqlx)?;
        insert_payment_row(&mut conn, payment).await
    }

    async fn insert_transaction(&self, transaction: &PaymentTransaction) -> DbResult<()> {
        let mut conn = self.pool.acquire().await.map_err(DatabaseError::from_sqlx)?;
        insert_transaction_row(&mut conn, transaction).await
    }

    async fn open_payment_attempt(&self, attempt: NewPaymentAttempt) -> DbResult<AttemptOpening> {
        let payment = &attempt.payment;
        let mut tx = self.pool.begin().await.map_err(DatabaseError::from_sqlx)?;

        // Serializes concurrent attempts for one booking until commit.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(format!("booking:{}", payment.booking_id))
            .execute(&mut *tx)
            .await
            .map_err(DatabaseError::from_sqlx)?;

        let existing = sqlx::query_scalar::<_, Uuid>(
            "SELECT id FROM payment_transactions
             WHERE transaction_type = 'payment'
               AND customer_id = $1 AND booking_id = $2 AND gross_amount = $3
               AND status IN ('pending', 'completed')
               AND initiated_at >= $4
             ORDER BY initiated_at DESC
             LIMIT 1",
        )
        .bind(payment.customer_id)
        .bind(payment.booking_id)
        .bind(payment.amount)
        .bind(attempt.duplicate_since)
        .fetch_optional(&mut *tx)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        if let Some(existing_transaction_id) = existing {
            tx.rollback().await.map_err(DatabaseError::from_sqlx)?;
            return Ok(AttemptOpening::Duplicate {
                existing_transaction_id,
            });
        }

        let already_committed: i64 = sqlx::query_scalar(COMMITTED_FOR_BOOKING)
            .bind(payment.booking_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        if already_committed.saturating_add(payment.amount) > attempt.booking_total {
            tx.rollback().await.map_err(DatabaseError::from_sqlx)?;
            return Ok(AttemptOpening::ExceedsBookingTotal { already_committed });
        }

        insert_payment_row(&mut tx, payment).await?;
        insert_transaction_row(&mut tx, &attempt.transaction).await?;
        tx.commit().await.map_err(DatabaseError::from_sqlx)?;
        Ok(AttemptOpening::Opened)
    }

    async fn find_payment(&self, id: Uuid) -> DbResult<Option<Payment>> {
        let row = sqlx::query_as::<_, PaymentRow>(&format!(
            "SELECT {} FROM payments WHERE id = $1",
            PAYMENT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        row.map(Payment::try_from).transpose()
    }

    async fn find_payment_by_order_id(&self, order_id: &str) -> DbResult<Option<Payment>> {
        let row = sqlx::query_as::<_, PaymentRow>(&format!(
            "SELECT {} FROM payments WHERE order_id = $1",
            PAYMENT_COLUMNS
        ))
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        row.map(Payment::try_from).transpose()
    }

    async fn find_transaction(&self, id: Uuid) -> DbResult<Option<PaymentTransaction>> {
        Ok(self.fetch_transactions("id = $1", id).await?.into_iter().next())
    }

    async fn list_transactions_for_payment(
        &self,
        payment_id: Uuid,
    ) -> DbResult<Vec<PaymentTransaction>> {
        self.fetch_transactions("payment_id = $1", payment_id).await
    }

    async fn find_payment_transaction(
        &self,
        payment_id: Uuid,
    ) -> DbResult<Option<PaymentTransaction>> {
        Ok(self
            .fetch_transactions("payment_id = $1 AND transaction_type = 'payment'", payment_id)
            .await?
            .into_iter()
            .next())
    }

    async fn record_gateway_response(&self, correlation: GatewayCorrelation) -> DbResult<()> {
        let mut tx = self.pool.begin().await.map_err(DatabaseError::from_sqlx)?;

        let updated = sqlx::query(
            "UPDATE payment_transactions
             SET gateway_outcome = $2,
                 gateway_response = $3,
                 gateway_transaction_id = COALESCE($4, gateway_transaction_id),
                 failure_reason = COALESCE($5, failure_reason)
             WHERE id = $1 AND status = 'pending'",
        )
        .bind(correlation.transaction_id)
        .bind(correlation.outcome.as_str())
        .bind(&correlation.gateway_response)
        .bind(&correlation.external_transaction_id)
        .bind(&correlation.failure_reason)
        .execute(&mut *tx)
        .await
        .map_err(DatabaseError::from_sqlx)?
        .rows_affected();

        if updated > 0 {
            sqlx::query(
                "UPDATE payments
                 SET external_transaction_id = COALESCE($2, external_transaction_id),
                     pay_url = COALESCE($3, pay_url),
                     updated_at = $4
                 WHERE id = $1",
            )
            .bind(correlation.payment_id)
            .bind(&correlation.external_transaction_id)
            .bind(&correlation.pay_url)
            .bind(correlation.recorded_at)
            .execute(&mut *tx)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        }

        tx.commit().await.map_err(DatabaseError::from_sqlx)?;
        Ok(())
    }

    async fn settle_transaction(&self, settlement: Settlement) -> DbResult<SettlementOutcome> {
        if !settlement.status.is_terminal() {
            return Err(DatabaseError::decode(format!(
                "{} is not a terminal status",
                settlement.status
            )));
        }

        let mut tx = self.pool.begin().await.map_err(DatabaseError::from_sqlx)?;

        let current: PaymentTransaction = sqlx::query_as::<_, TransactionRow>(&format!(
            "SELECT {} FROM payment_transactions WHERE id = $1 FOR UPDATE",
            TRANSACTION_COLUMNS
        ))
        .bind(settlement.transaction_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(DatabaseError::from_sqlx)?
        .ok_or_else(|| DatabaseError::not_found("payment transaction", settlement.transaction_id))?
        .try_into()?;

        if current.status.is_terminal() {
            tx.rollback().await.map_err(DatabaseError::from_sqlx)?;
            return Ok(SettlementOutcome::AlreadySettled {
                transaction: current,
            });
        }

        let transaction: PaymentTransaction = sqlx::query_as::<_, TransactionRow>(&format!(
            "UPDATE payment_transactions
             SET status = $2,
                 gateway_transaction_id = COALESCE($3, gateway_transaction_id),
                 gateway_response = COALESCE($4, gateway_response),
                 gateway_outcome = COALESCE($5, gateway_outcome),
                 failure_reason = $6,
                 completed_at = $7
             WHERE id = $1 AND status = 'pending'
             RETURNING {}",
            TRANSACTION_COLUMNS
        ))
        .bind(settlement.transaction_id)
        .bind(settlement.status.as_str())
        .bind(&settlement.gateway_transaction_id)
        .bind(&settlement.gateway_response)
        .bind(settlement.gateway_outcome.map(|o| o.as_str()))
        .bind(&settlement.failure_reason)
        .bind(settlement.settled_at)
        .fetch_one(&mut *tx)
        .await
        .map_err(DatabaseError::from_sqlx)?
        .try_into()?;

        let mut newly_completed = false;
        let flipped = match settlement.payment_effect {
            PaymentEffect::Unchanged => None,
            PaymentEffect::MarkCompleted => {
                let flipped = flip_payment_status(
                    &mut tx,
                    transaction.payment_id,
                    PaymentStatus::Pending,
                    PaymentStatus::Completed,
                    settlement.settled_at,
                    settlement.gateway_transaction_id.as_deref(),
                )
                .await?;
                newly_completed = flipped.is_some();
                flipped
            }
            PaymentEffect::MarkFailed => {
                flip_payment_status(
                    &mut tx,
                    transaction.payment_id,
                    PaymentStatus::Pending,
                    PaymentStatus::Failed,
                    settlement.settled_at,
                    None,
                )
                .await?
            }
            PaymentEffect::MarkRefundedIfFullyRefunded => {
                let covered = match transaction.refunded_transaction_id {
                    Some(original) => sqlx::query_scalar::<_, bool>(
                        "SELECT COALESCE(SUM(-r.gross_amount), 0)::BIGINT >= o.net_amount
                         FROM payment_transactions o
                         LEFT JOIN payment_transactions r
                           ON r.refunded_transaction_id = o.id AND r.status = 'completed'
                         WHERE o.id = $1
                         GROUP BY o.net_amount",
                    )
                    .bind(original)
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(DatabaseError::from_sqlx)?
                    .unwrap_or(false),
                    None => false,
                };
                if covered {
                    flip_payment_status(
                        &mut tx,
                        transaction.payment_id,
                        PaymentStatus::Completed,
                        PaymentStatus::Refunded,
                        settlement.settled_at,
                        None,
                    )
                    .await?
                } else {
                    None
                }
            }
        };
        let payment = match flipped {
            Some(payment) => payment,
            None => select_payment(&mut tx, transaction.payment_id).await?,
        };

        let installment = match payment.installment_schedule_id {
            Some(schedule_id) if newly_completed => {
                Some(match lock_schedule(&mut tx, schedule_id).await? {
                    Some(mut schedule) => {
                        let expected_completed = schedule.completed_installments;
                        match schedule.apply_payment(settlement.settled_at) {
                            Ok(applied) => {
                                write_schedule_progress(&mut tx, &schedule, expected_completed)
                                    .await?;
                                InstallmentApplication::Applied(applied)
                            }
                            Err(err) => InstallmentApplication::Skipped {
                                schedule_id,
                                reason: err.to_string(),
                            },
                        }
                    }
                    None => InstallmentApplication::Skipped {
                        schedule_id,
                        reason: "schedule not found".to_string(),
                    },
                })
            }
            _ => None,
        };

        let mut booking_confirmed = false;
        if settlement.confirm_booking && payment.status == PaymentStatus::Completed {
            booking_confirmed = sqlx::query(
                "UPDATE bookings SET status = 'confirmed', updated_at = $2
                 WHERE id = $1 AND status = 'pending'",
            )
            .bind(payment.booking_id)
            .bind(settlement.settled_at)
            .execute(&mut *tx)
            .await
            .map_err(DatabaseError::from_sqlx)?
            .rows_affected()
                > 0;
        }

        tx.commit().await.map_err(DatabaseError::from_sqlx)?;

        if settlement.payment_effect != PaymentEffect::Unchanged && payment.status == PaymentStatus::Pending {
            warn!(
                payment_id = %payment.id,
                transaction_id = %transaction.id,
                "transaction settled but payment was left pending"
            );
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
        let mut conn = self.pool.acquire().await.map_err(DatabaseError::from_sqlx)?;
        flip_payment_status(&mut conn, id, from, to, at, None).await
    }

    async fn insert_refund(
        &self,
        refund: &PaymentTransaction,
        bound: i64,
    ) -> DbResult<RefundInsertion> {
        let original_id = refund
            .refunded_transaction_id
            .ok_or_else(|| DatabaseError::decode("refund without original transaction"))?;
        let mut tx = self.pool.begin().await.map_err(DatabaseError::from_sqlx)?;

        let status: String = sqlx::query_scalar(
            "SELECT status FROM payment_transactions WHERE id = $1 FOR UPDATE",
        )
        .bind(original_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(DatabaseError::from_sqlx)?
        .ok_or_else(|| DatabaseError::not_found("payment transaction", original_id))?;
        let status: TransactionStatus = status.parse()?;
        if status != TransactionStatus::Completed {
            tx.rollback().await.map_err(DatabaseError::from_sqlx)?;
            return Ok(RefundInsertion::OriginalNotCompleted { status });
        }

        let already_refunded: i64 = sqlx::query_scalar(
            "SELECT COALESCE(SUM(-gross_amount), 0)::BIGINT FROM payment_transactions
             WHERE refunded_transaction_id = $1 AND status IN ('pending', 'completed')",
        )
        .bind(original_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        if already_refunded + refund.refund_amount() > bound {
            tx.rollback().await.map_err(DatabaseError::from_sqlx)?;
            return Ok(RefundInsertion::ExceedsBound { already_refunded });
        }

        insert_transaction_row(&mut tx, refund).await?;
        tx.commit().await.map_err(DatabaseError::from_sqlx)?;
        Ok(RefundInsertion::Inserted)
    }

    async fn refunded_total(&self, original_transaction_id: Uuid) -> DbResult<i64> {
        sqlx::query_scalar(
            "SELECT COALESCE(SUM(-gross_amount), 0)::BIGINT FROM payment_transactions
             WHERE refunded_transaction_id = $1 AND status IN ('pending', 'completed')",
        )
        .bind(original_transaction_id)
        .fetch_one(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn committed_total_for_booking(&self, booking_id: Uuid) -> DbResult<i64> {
        sqlx::query_scalar(COMMITTED_FOR_BOOKING)
            .bind(booking_id)
            .fetch_one(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)
    }

    async fn find_stale_pending(
        &self,
        initiated_before: DateTime<Utc>,
        providers: &[ProviderName],
        limit: i64,
    ) -> DbResult<Vec<PaymentTransaction>> {
        let providers: Vec<&str> = providers.iter().map(ProviderName::as_str).collect();
        let rows = sqlx::query_as::<_, TransactionRow>(&format!(
            "SELECT {} FROM payment_transactions
             WHERE transaction_type = 'payment' AND status = 'pending' AND initiated_at < $1
               AND provider = ANY($2)
             ORDER BY initiated_at
             LIMIT $3",
            TRANSACTION_COLUMNS
        ))
        .bind(initiated_before)
        .bind(&providers)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        rows.into_iter().map(PaymentTransaction::try_from).collect()
    }
}

#[async_trait]
impl RiskHistoryRepository for PgLedgerRepository {
    async fn completed_totals_since(
        &self,
        customer_id: Uuid,
        since: DateTime<Utc>,
    ) -> DbResult<(i64, i64)> {
        sqlx::query_as::<_, (i64, i64)>(
            "SELECT COALESCE(SUM(gross_amount), 0)::BIGINT, COUNT(*)
             FROM payment_transactions
             WHERE customer_id = $1 AND transaction_type = 'payment' AND status = 'completed'
               AND COALESCE(completed_at, initiated_at) >= $2",
        )
        .bind(customer_id)
        .bind(since)
        .fetch_one(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn attempts_since(&self, customer_id: Uuid, since: DateTime<Utc>) -> DbResult<i64> {
        sqlx::query_scalar(
            "SELECT COUNT(*) FROM payment_transactions
             WHERE customer_id = $1 AND transaction_type = 'payment' AND initiated_at >= $2",
        )
        .bind(customer_id)
        .bind(since)
        .fetch_one(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn failed_attempts_since(
        &self,
        customer_id: Uuid,
        since: DateTime<Utc>,
    ) -> DbResult<i64> {
        sqlx::query_scalar(
            "SELECT COUNT(*) FROM payment_transactions
             WHERE customer_id = $1 AND transaction_type = 'payment' AND status = 'failed'
               AND initiated_at >= $2",
        )
        .bind(customer_id)
        .bind(since)
        .fetch_one(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn recent_duplicate(
        &self,
        customer_id: Uuid,
        booking_id: Uuid,
        amount: i64,
        since: DateTime<Utc>,
    ) -> DbResult<Option<Uuid>> {
        sqlx::query_scalar(
            "SELECT id FROM payment_transactions
             WHERE transaction_type = 'payment'
               AND customer_id = $1 AND booking_id = $2 AND gross_amount = $3
               AND status IN ('pending', 'completed')
               AND initiated_at >= $4
             ORDER BY initiated_at DESC
             LIMIT 1",
        )
        .bind(customer_id)
        .bind(booking_id)
        .bind(amount)
        .bind(since)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn other_customers_on_ip(
        &self,
        client_ip: &str,
        customer_id: Uuid,
        since: DateTime<Utc>,
    ) -> DbResult<i64> {
        sqlx::query_scalar(
            "SELECT COUNT(DISTINCT customer_id) FROM payment_transactions
             WHERE client_ip = $1 AND customer_id <> $2 AND initiated_at >= $3",
        )
        .bind(client_ip)
        .bind(customer_id)
        .bind(since)
        .fetch_one(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn recent_devices(
        &self,
        customer_id: Uuid,
        since: DateTime<Utc>,
    ) -> DbResult<Vec<String>> {
        sqlx::query_scalar(
            "SELECT DISTINCT device_id FROM payment_transactions
             WHERE customer_id = $1 AND transaction_type = 'payment'
               AND device_id IS NOT NULL AND initiated_at >= $2
             ORDER BY device_id",
        )
        .bind(customer_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }
}
