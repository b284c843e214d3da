use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::{parse_var, ConfigError};
use crate::services::reconciliation::{ReconciliationPolicy, ReconciliationService};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ReconciliationWorkerConfig {
    /// How often the worker wakes up to scan pending transactions.
    pub poll_interval: Duration,
    /// Pending transactions younger than this are left to the webhook.
    pub min_age: Duration,
    /// Pending transactions older than this are failed as expired.
    pub expire_after: Duration,
    /// Maximum number of pending transactions fetched per cycle.
    pub batch_size: i64,
    pub concurrency: usize,
    pub query_timeout: Duration,
}

impl Default for ReconciliationWorkerConfig {
    fn default() -> Self {
        let policy = ReconciliationPolicy::default();
        Self {
            poll_interval: Duration::from_secs(60),
            min_age: policy.min_age,
            expire_after: policy.expire_after,
            batch_size: policy.batch_size,
            concurrency: policy.concurrency,
            query_timeout: policy.query_timeout,
        }
    }
}

impl ReconciliationWorkerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let cfg = Self::default();
        Ok(Self {
            poll_interval: Duration::from_secs(parse_var(
                "RECONCILIATION_POLL_INTERVAL_SECONDS",
                cfg.poll_interval.as_secs(),
            )?),
            min_age: Duration::from_secs(parse_var(
                "RECONCILIATION_MIN_AGE_SECONDS",
                cfg.min_age.as_secs(),
            )?),
            expire_after: Duration::from_secs(parse_var(
                "RECONCILIATION_EXPIRE_AFTER_SECONDS",
                cfg.expire_after.as_secs(),
            )?),
            batch_size: parse_var("RECONCILIATION_BATCH_SIZE", cfg.batch_size)?,
            concurrency: parse_var("RECONCILIATION_CONCURRENCY", cfg.concurrency)?,
            query_timeout: Duration::from_secs(parse_var(
                "RECONCILIATION_QUERY_TIMEOUT_SECONDS",
                cfg.query_timeout.as_secs(),
            )?),
        })
    }

    pub fn policy(&self) -> ReconciliationPolicy {
        ReconciliationPolicy {
            min_age: self.min_age,
            expire_after: self.expire_after,
            batch_size: self.batch_size,
            concurrency: self.concurrency,
            query_timeout: self.query_timeout,
        }
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

pub struct ReconciliationWorker {
    service: Arc<ReconciliationService>,
    config: ReconciliationWorkerConfig,
}

impl ReconciliationWorker {
    pub fn new(service: Arc<ReconciliationService>, config: ReconciliationWorkerConfig) -> Self {
        Self { service, config }
    }

    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            min_age_secs = self.config.min_age.as_secs(),
            expire_after_secs = self.config.expire_after.as_secs(),
            batch_size = self.config.batch_size,
            "payment reconciliation worker started"
        );

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("payment reconciliation worker stopping");
                        break;
                    }
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.service.run_cycle().await {
                        warn!(error = %e, "reconciliation cycle failed");
                    }
                }
            }
        }

        info!("payment reconciliation worker stopped");
    }
}
