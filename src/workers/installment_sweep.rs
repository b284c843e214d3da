use chrono::{Duration as ChronoDuration, NaiveDate, Utc};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::{parse_var, ConfigError};
use crate::services::installment_scheduler::InstallmentScheduler;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct InstallmentSweepConfig {
    pub poll_interval: Duration,
    /// Maximum number of due schedules handled per cycle.
    pub batch_size: i64,
    /// Due dates are calendar days at the property, not UTC.
    pub utc_offset_hours: i64,
}

impl Default for InstallmentSweepConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(300),
            batch_size: 100,
            utc_offset_hours: 7,
        }
    }
}

impl InstallmentSweepConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let cfg = Self::default();
        Ok(Self {
            poll_interval: Duration::from_secs(parse_var(
                "INSTALLMENT_SWEEP_INTERVAL_SECONDS",
                cfg.poll_interval.as_secs(),
            )?),
            batch_size: parse_var("INSTALLMENT_SWEEP_BATCH_SIZE", cfg.batch_size)?,
            utc_offset_hours: parse_var("INSTALLMENT_SWEEP_UTC_OFFSET_HOURS", cfg.utc_offset_hours)?,
        })
    }

    pub fn local_today(&self) -> NaiveDate {
        (Utc::now() + ChronoDuration::hours(self.utc_offset_hours)).date_naive()
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

/// Reminds customers of installments that fell due. Each schedule is handled
/// under its lease, so several instances can sweep side by side.
pub struct InstallmentSweepWorker {
    scheduler: InstallmentScheduler,
    config: InstallmentSweepConfig,
}

impl InstallmentSweepWorker {
    pub fn new(scheduler: InstallmentScheduler, config: InstallmentSweepConfig) -> Self {
        Self { scheduler, config }
    }

    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            batch_size = self.config.batch_size,
            "installment sweep worker started"
        );

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("installment sweep worker stopping");
                        break;
                    }
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {
                    self.run_cycle().await;
                }
            }
        }

        info!("installment sweep worker stopped");
    }

    async fn run_cycle(&self) {
        let today = self.config.local_today();
        match self
            .scheduler
            .send_due_reminders(today, self.config.batch_size)
            .await
        {
            Ok(0) => debug!(today = %today, "no installment reminders due"),
            Ok(sent) => info!(today = %today, sent, "installment reminders sent"),
            Err(e) => warn!(error = %e, "installment sweep cycle failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::memory::InMemoryStore;
    use crate::services::notification::LogNotificationSink;
    use std::sync::Arc;

    #[tokio::test]
    async fn worker_stops_on_shutdown_signal() {
        let store = Arc::new(InMemoryStore::new());
        let scheduler = InstallmentScheduler::new(
            store.clone(),
            store,
            Arc::new(LogNotificationSink::new()),
        );
        let worker = InstallmentSweepWorker::new(
            scheduler,
            InstallmentSweepConfig {
                poll_interval: Duration::from_secs(3600),
                ..InstallmentSweepConfig::default()
            },
        );

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(worker.run(rx));
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("worker did not stop")
            .unwrap();
    }
}
