//! Reconciliation of payment attempts the gateway never confirmed.
//!
//! Pending payment transactions older than `min_age` are re-queried at the
//! provider and settled through the same path as webhooks. Anything still
//! unresolved after `expire_after` is failed with reason `expired`. Cash is
//! settled by staff and never enters the scan.
//!
//! Refund rows are not scanned. A refund whose gateway call timed out stays
//! `pending` and keeps holding its share of the refund bound until an
//! operator settles it against the provider's refund report.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::database::repository::SettlementOutcome;
use crate::domain::transaction::PaymentTransaction;
use crate::error::AppResult;
use crate::payments::types::{GatewayPaymentState, ProviderName, StatusQuery};
use crate::services::payment_orchestrator::{PaymentOrchestrator, PaymentResolution};

pub const EXPIRED_REASON: &str = "expired";

/// Providers whose pending attempts resolve by status query or by expiry.
pub const RECONCILED_PROVIDERS: [ProviderName; 2] = [ProviderName::Momo, ProviderName::BankTransfer];

#[derive(Debug, Clone)]
pub struct ReconciliationPolicy {
    pub min_age: Duration,
    pub expire_after: Duration,
    pub batch_size: i64,
    /// Status queries in flight at once
    pub concurrency: usize,
    pub query_timeout: Duration,
}

impl Default for ReconciliationPolicy {
    fn default() -> Self {
        Self {
            min_age: Duration::from_secs(15 * 60),
            expire_after: Duration::from_secs(24 * 60 * 60),
            batch_size: 100,
            concurrency: 4,
            query_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileAction {
    Completed,
    Failed,
    Expired,
    StillPending,
    /// Settled by someone else between the scan and the update
    AlreadySettled,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconciliationReport {
    pub scanned: usize,
    pub completed: usize,
    pub failed: usize,
    pub expired: usize,
    pub still_pending: usize,
    pub already_settled: usize,
    pub errors: usize,
}

impl ReconciliationReport {
    fn record(&mut self, action: ReconcileAction) {
        match action {
            ReconcileAction::Completed => self.completed += 1,
            ReconcileAction::Failed => self.failed += 1,
            ReconcileAction::Expired => self.expired += 1,
            ReconcileAction::StillPending => self.still_pending += 1,
            ReconcileAction::AlreadySettled => self.already_settled += 1,
        }
    }
}

pub struct ReconciliationService {
    orchestrator: Arc<PaymentOrchestrator>,
    policy: ReconciliationPolicy,
}

impl ReconciliationService {
    pub fn new(orchestrator: Arc<PaymentOrchestrator>, policy: ReconciliationPolicy) -> Self {
        Self {
            orchestrator,
            policy,
        }
    }

    pub fn policy(&self) -> &ReconciliationPolicy {
        &self.policy
    }

    pub async fn run_cycle(&self) -> AppResult<ReconciliationReport> {
        self.run_cycle_at(Utc::now()).await
    }

    pub async fn run_cycle_at(&self, now: DateTime<Utc>) -> AppResult<ReconciliationReport> {
        let cutoff = now - chrono_duration(self.policy.min_age);
        let stale = self
            .orchestrator
            .ledger()
            .find_stale_pending(cutoff, &RECONCILED_PROVIDERS, self.policy.batch_size)
            .await?;

        let mut report = ReconciliationReport {
            scanned: stale.len(),
            ..ReconciliationReport::default()
        };
        if stale.is_empty() {
            return Ok(report);
        }

        let results: Vec<_> = stream::iter(stale)
            .map(|transaction| async move {
                let result = self.reconcile_one(&transaction, now).await;
                (transaction, result)
            })
            .buffer_unordered(self.policy.concurrency.max(1))
            .collect()
            .await;

        for (transaction, result) in results {
            match result {
                Ok(action) => report.record(action),
                Err(e) => {
                    report.errors += 1;
                    warn!(
                        transaction_id = %transaction.id,
                        payment_id = %transaction.payment_id,
                        error = %e,
                        "failed to reconcile transaction"
                    );
                }
            }
        }

        info!(
            scanned = report.scanned,
            completed = report.completed,
            failed = report.failed,
            expired = report.expired,
            still_pending = report.still_pending,
            errors = report.errors,
            "Reconciliation cycle finished"
        );
        Ok(report)
    }

    async fn reconcile_one(
        &self,
        transaction: &PaymentTransaction,
        now: DateTime<Utc>,
    ) -> AppResult<ReconcileAction> {
        if let Some(action) = self.query_provider(transaction).await? {
            return Ok(action);
        }

        let age = now - transaction.initiated_at;
        if RECONCILED_PROVIDERS.contains(&transaction.provider)
            && age >= chrono_duration(self.policy.expire_after)
        {
            let outcome = self
                .orchestrator
                .resolve_transaction(
                    transaction,
                    PaymentResolution::Failed {
                        reason: EXPIRED_REASON.to_string(),
                    },
                    None,
                )
                .await?;
            return Ok(match outcome {
                SettlementOutcome::Applied { .. } => {
                    info!(
                        transaction_id = %transaction.id,
                        age_secs = age.num_seconds(),
                        "Pending transaction expired"
                    );
                    ReconcileAction::Expired
                }
                SettlementOutcome::AlreadySettled { .. } => ReconcileAction::AlreadySettled,
            });
        }
        Ok(ReconcileAction::StillPending)
    }

    /// `None` when the provider cannot be asked or has no final answer yet.
    async fn query_provider(
        &self,
        transaction: &PaymentTransaction,
    ) -> AppResult<Option<ReconcileAction>> {
        let Ok(gateway) = self.orchestrator.gateways().get(transaction.provider) else {
            return Ok(None);
        };
        if !gateway.supports_status_query() {
            return Ok(None);
        }

        let payment = self.orchestrator.ledger().find_payment(transaction.payment_id).await?;
        let query = StatusQuery {
            order_id: payment.order_id.clone(),
            request_id: payment.request_id.clone(),
        };
        let status = match tokio::time::timeout(self.policy.query_timeout, gateway.query_status(query)).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                warn!(order_id = %payment.order_id, error = %e, "status query failed");
                return Ok(None);
            }
            Err(_) => {
                warn!(order_id = %payment.order_id, "status query timed out");
                return Ok(None);
            }
        };
        debug!(order_id = %payment.order_id, state = ?status.state, "provider status");

        let resolution = match status.state {
            GatewayPaymentState::Succeeded => PaymentResolution::Succeeded {
                gateway_transaction_id: status.provider_transaction_id.clone(),
            },
            GatewayPaymentState::Failed => PaymentResolution::Failed {
                reason: status
                    .message
                    .clone()
                    .unwrap_or_else(|| "failed at provider".to_string()),
            },
            GatewayPaymentState::Pending => return Ok(None),
        };
        let succeeded = matches!(resolution, PaymentResolution::Succeeded { .. });
        let outcome = self
            .orchestrator
            .resolve_transaction(transaction, resolution, Some(status.raw_response))
            .await?;

        Ok(Some(match outcome {
            SettlementOutcome::Applied { .. } if succeeded => ReconcileAction::Completed,
            SettlementOutcome::Applied { .. } => ReconcileAction::Failed,
            SettlementOutcome::AlreadySettled { .. } => ReconcileAction::AlreadySettled,
        }))
    }
}

fn chrono_duration(duration: Duration) -> ChronoDuration {
    ChronoDuration::from_std(duration).unwrap_or_else(|_| ChronoDuration::days(36_500))
}
