//! Risk engine
//!
//! Scores one payment attempt against the customer's recent ledger history.
//! Every check is independent and deterministic: the same history and input
//! always give the same assessment.

use chrono::{DateTime, Duration, FixedOffset, Offset, Timelike, Utc};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{parse_var, ConfigError};
use crate::database::repository::RiskHistoryRepository;
use crate::domain::risk::{CheckResult, RiskAssessment, RiskCheck, RiskLevel};
use crate::domain::transaction::AttemptContext;
use crate::error::AppResult;
use crate::payments::types::ProviderName;

// ============================================================================
// Configuration
// ============================================================================

/// Relative weight of each check in the 0-100 score.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RiskWeights {
    pub amount_limit: u32,
    pub daily_limit: u32,
    pub velocity: u32,
    pub duplicate: u32,
    pub failed_attempts: u32,
    pub suspicious_activity: u32,
    pub device: u32,
}

impl Default for RiskWeights {
    fn default() -> Self {
        Self {
            amount_limit: 30,
            daily_limit: 25,
            velocity: 20,
            duplicate: 15,
            failed_attempts: 35,
            suspicious_activity: 25,
            device: 10,
        }
    }
}

impl RiskWeights {
    pub fn weight(&self, check: RiskCheck) -> u32 {
        match check {
            RiskCheck::AmountLimit => self.amount_limit,
            RiskCheck::DailyLimit => self.daily_limit,
            RiskCheck::Velocity => self.velocity,
            RiskCheck::Duplicate => self.duplicate,
            RiskCheck::FailedAttempts => self.failed_attempts,
            RiskCheck::SuspiciousActivity => self.suspicious_activity,
            RiskCheck::Device => self.device,
        }
    }

    pub fn total(&self) -> u32 {
        RiskCheck::ALL.iter().map(|check| self.weight(*check)).sum()
    }
}

/// Limits, windows, weights and thresholds. The defaults are starting
/// values, not calibrated fraud rates; every field can be overridden.
#[derive(Debug, Clone)]
pub struct RiskConfig {
    /// Single-payment ceiling in minor units.
    pub max_transaction_amount: i64,
    pub max_daily_amount: i64,
    pub max_daily_transactions: i64,
    pub velocity_window_secs: i64,
    pub velocity_limit: i64,
    pub duplicate_window_secs: i64,
    pub failed_attempts_window_secs: i64,
    pub max_failed_attempts: i64,
    pub shared_ip_window_secs: i64,
    /// Other customers seen on the same IP before it counts as shared.
    pub shared_ip_threshold: i64,
    /// Local hours `[start, end)` considered off-hours.
    pub off_hours_start: u32,
    pub off_hours_end: u32,
    /// Offset of the property's local time from UTC, used for "today" and
    /// off-hours.
    pub utc_offset_hours: i32,
    pub device_window_secs: i64,
    pub max_devices_per_customer: usize,
    pub low_threshold: u8,
    pub medium_threshold: u8,
    pub weights: RiskWeights,
    /// Checks whose failure forces the level to high regardless of score.
    pub blocking_checks: Vec<RiskCheck>,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_transaction_amount: 50_000_000,
            max_daily_amount: 50_000_000,
            max_daily_transactions: 10,
            velocity_window_secs: 3600,
            velocity_limit: 3,
            duplicate_window_secs: 300,
            failed_attempts_window_secs: 3600,
            max_failed_attempts: 3,
            shared_ip_window_secs: 86_400,
            shared_ip_threshold: 3,
            off_hours_start: 0,
            off_hours_end: 5,
            utc_offset_hours: 7,
            device_window_secs: 86_400,
            max_devices_per_customer: 3,
            low_threshold: 30,
            medium_threshold: 60,
            weights: RiskWeights::default(),
            blocking_checks: vec![
                RiskCheck::AmountLimit,
                RiskCheck::DailyLimit,
                RiskCheck::Duplicate,
            ],
        }
    }
}

impl RiskConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let d = Self::default();
        let w = RiskWeights::default();
        Ok(Self {
            max_transaction_amount: parse_var("RISK_MAX_TRANSACTION_AMOUNT", d.max_transaction_amount)?,
            max_daily_amount: parse_var("RISK_MAX_DAILY_AMOUNT", d.max_daily_amount)?,
            max_daily_transactions: parse_var("RISK_MAX_DAILY_TRANSACTIONS", d.max_daily_transactions)?,
            velocity_window_secs: parse_var("RISK_VELOCITY_WINDOW_SECONDS", d.velocity_window_secs)?,
            velocity_limit: parse_var("RISK_VELOCITY_LIMIT", d.velocity_limit)?,
            duplicate_window_secs: parse_var("RISK_DUPLICATE_WINDOW_SECONDS", d.duplicate_window_secs)?,
            failed_attempts_window_secs: parse_var(
                "RISK_FAILED_ATTEMPTS_WINDOW_SECONDS",
                d.failed_attempts_window_secs,
            )?,
            max_failed_attempts: parse_var("RISK_MAX_FAILED_ATTEMPTS", d.max_failed_attempts)?,
            shared_ip_window_secs: parse_var("RISK_SHARED_IP_WINDOW_SECONDS", d.shared_ip_window_secs)?,
            shared_ip_threshold: parse_var("RISK_SHARED_IP_THRESHOLD", d.shared_ip_threshold)?,
            off_hours_start: parse_var("RISK_OFF_HOURS_START", d.off_hours_start)?,
            off_hours_end: parse_var("RISK_OFF_HOURS_END", d.off_hours_end)?,
            utc_offset_hours: parse_var("RISK_UTC_OFFSET_HOURS", d.utc_offset_hours)?,
            device_window_secs: parse_var("RISK_DEVICE_WINDOW_SECONDS", d.device_window_secs)?,
            max_devices_per_customer: parse_var("RISK_MAX_DEVICES", d.max_devices_per_customer)?,
            low_threshold: parse_var("RISK_LOW_THRESHOLD", d.low_threshold)?,
            medium_threshold: parse_var("RISK_MEDIUM_THRESHOLD", d.medium_threshold)?,
            weights: RiskWeights {
                amount_limit: parse_var("RISK_WEIGHT_AMOUNT_LIMIT", w.amount_limit)?,
                daily_limit: parse_var("RISK_WEIGHT_DAILY_LIMIT", w.daily_limit)?,
                velocity: parse_var("RISK_WEIGHT_VELOCITY", w.velocity)?,
                duplicate: parse_var("RISK_WEIGHT_DUPLICATE", w.duplicate)?,
                failed_attempts: parse_var("RISK_WEIGHT_FAILED_ATTEMPTS", w.failed_attempts)?,
                suspicious_activity: parse_var(
                    "RISK_WEIGHT_SUSPICIOUS_ACTIVITY",
                    w.suspicious_activity,
                )?,
                device: parse_var("RISK_WEIGHT_DEVICE", w.device)?,
            },
            blocking_checks: d.blocking_checks,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_transaction_amount <= 0 || self.max_daily_amount <= 0 {
            return Err(ConfigError::ValidationFailed(
                "risk amount limits must be positive".to_string(),
            ));
        }
        if self.low_threshold > self.medium_threshold || self.medium_threshold > 100 {
            return Err(ConfigError::ValidationFailed(
                "RISK_LOW_THRESHOLD <= RISK_MEDIUM_THRESHOLD <= 100 must hold".to_string(),
            ));
        }
        if self.off_hours_start > 23 || self.off_hours_end > 24 {
            return Err(ConfigError::InvalidValue("RISK_OFF_HOURS_START/END".to_string()));
        }
        if !(-12..=14).contains(&self.utc_offset_hours) {
            return Err(ConfigError::InvalidValue("RISK_UTC_OFFSET_HOURS".to_string()));
        }
        if self.weights.total() == 0 {
            return Err(ConfigError::ValidationFailed(
                "at least one risk weight must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    fn local_offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.utc_offset_hours * 3600).unwrap_or_else(|| Utc.fix())
    }

    /// Midnight of the local calendar day containing `now`, as UTC.
    pub fn start_of_local_day(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let local = now.with_timezone(&self.local_offset());
        let elapsed = Duration::seconds(i64::from(local.num_seconds_from_midnight()))
            + Duration::nanoseconds(i64::from(local.nanosecond()));
        now - elapsed
    }

    pub fn is_off_hours(&self, now: DateTime<Utc>) -> bool {
        let hour = now.with_timezone(&self.local_offset()).hour();
        if self.off_hours_start <= self.off_hours_end {
            hour >= self.off_hours_start && hour < self.off_hours_end
        } else {
            hour >= self.off_hours_start || hour < self.off_hours_end
        }
    }

    /// `100 * failed weight / total weight`, rounded to the nearest integer.
    pub fn score(&self, failed: &[RiskCheck]) -> u8 {
        let total = self.weights.total();
        if total == 0 {
            return 0;
        }
        let failed_weight: u32 = failed.iter().map(|check| self.weights.weight(*check)).sum();
        ((100 * failed_weight + total / 2) / total).min(100) as u8
    }

    pub fn level_for(&self, score: u8) -> RiskLevel {
        if score <= self.low_threshold {
            RiskLevel::Low
        } else if score <= self.medium_threshold {
            RiskLevel::Medium
        } else {
            RiskLevel::High
        }
    }
}

// ============================================================================
// Engine
// ============================================================================

/// What is being paid, as seen by the risk checks.
#[derive(Debug, Clone)]
pub struct RiskInput {
    pub amount: i64,
    pub method: ProviderName,
    pub booking_id: Uuid,
    pub context: AttemptContext,
}

#[derive(Clone)]
pub struct RiskEngine {
    history: Arc<dyn RiskHistoryRepository>,
    config: RiskConfig,
}

impl RiskEngine {
    pub fn new(history: Arc<dyn RiskHistoryRepository>, config: RiskConfig) -> Self {
        Self { history, config }
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    pub async fn assess(&self, customer_id: Uuid, input: &RiskInput) -> AppResult<RiskAssessment> {
        self.assess_at(customer_id, input, Utc::now()).await
    }

    /// Same as [`RiskEngine::assess`] with an explicit clock.
    pub async fn assess_at(
        &self,
        customer_id: Uuid,
        input: &RiskInput,
        now: DateTime<Utc>,
    ) -> AppResult<RiskAssessment> {
        let cfg = &self.config;
        let history = self.history.as_ref();

        let day_start = cfg.start_of_local_day(now);
        let ip = input.context.client_ip.as_deref();

        let ((daily_sum, daily_count), attempts, failed, duplicate, ip_customers, devices) = tokio::try_join!(
            history.completed_totals_since(customer_id, day_start),
            history.attempts_since(customer_id, now - Duration::seconds(cfg.velocity_window_secs)),
            history.failed_attempts_since(
                customer_id,
                now - Duration::seconds(cfg.failed_attempts_window_secs)
            ),
            history.recent_duplicate(
                customer_id,
                input.booking_id,
                input.amount,
                now - Duration::seconds(cfg.duplicate_window_secs)
            ),
            async {
                match ip {
                    Some(ip) => {
                        history
                            .other_customers_on_ip(
                                ip,
                                customer_id,
                                now - Duration::seconds(cfg.shared_ip_window_secs),
                            )
                            .await
                    }
                    None => Ok(0),
                }
            },
            history.recent_devices(customer_id, now - Duration::seconds(cfg.device_window_secs)),
        )?;

        let mut checks = BTreeMap::new();

        checks.insert(
            RiskCheck::AmountLimit,
            verdict(
                input.amount <= cfg.max_transaction_amount,
                json!({
                    "amount": input.amount,
                    "max_transaction_amount": cfg.max_transaction_amount,
                }),
            ),
        );

        let projected = daily_sum.saturating_add(input.amount);
        checks.insert(
            RiskCheck::DailyLimit,
            verdict(
                projected <= cfg.max_daily_amount && daily_count < cfg.max_daily_transactions,
                json!({
                    "completed_today": daily_sum,
                    "completed_count_today": daily_count,
                    "projected_total": projected,
                    "max_daily_amount": cfg.max_daily_amount,
                    "max_daily_transactions": cfg.max_daily_transactions,
                }),
            ),
        );

        checks.insert(
            RiskCheck::Velocity,
            verdict(
                attempts < cfg.velocity_limit,
                json!({
                    "attempts_in_window": attempts,
                    "window_secs": cfg.velocity_window_secs,
                    "limit": cfg.velocity_limit,
                }),
            ),
        );

        checks.insert(
            RiskCheck::Duplicate,
            verdict(
                duplicate.is_none(),
                json!({
                    "existing_transaction_id": duplicate,
                    "window_secs": cfg.duplicate_window_secs,
                }),
            ),
        );

        checks.insert(
            RiskCheck::FailedAttempts,
            verdict(
                failed < cfg.max_failed_attempts,
                json!({
                    "failed_in_window": failed,
                    "max_failed_attempts": cfg.max_failed_attempts,
                }),
            ),
        );

        let shared_ip = ip_customers >= cfg.shared_ip_threshold;
        let off_hours = cfg.is_off_hours(now);
        checks.insert(
            RiskCheck::SuspiciousActivity,
            verdict(
                !(shared_ip && off_hours),
                json!({
                    "shared_ip": shared_ip,
                    "other_customers_on_ip": ip_customers,
                    "off_hours": off_hours,
                }),
            ),
        );

        let distinct_devices = match input.context.device_id.as_deref() {
            Some(device) if !devices.iter().any(|d| d == device) => devices.len() + 1,
            _ => devices.len(),
        };
        checks.insert(
            RiskCheck::Device,
            verdict(
                distinct_devices <= cfg.max_devices_per_customer,
                json!({
                    "distinct_devices": distinct_devices,
                    "max_devices": cfg.max_devices_per_customer,
                }),
            ),
        );

        let assessment = self.conclude(checks, now);

        if assessment.approved {
            info!(
                customer_id = %customer_id,
                booking_id = %input.booking_id,
                method = %input.method,
                amount = input.amount,
                risk_score = assessment.risk_score,
                risk_level = %assessment.risk_level,
                failed_checks = ?assessment.failed_checks(),
                "Risk assessment approved"
            );
        } else {
            warn!(
                customer_id = %customer_id,
                booking_id = %input.booking_id,
                method = %input.method,
                amount = input.amount,
                risk_score = assessment.risk_score,
                risk_level = %assessment.risk_level,
                failed_checks = ?assessment.failed_checks(),
                blocking_failures = ?assessment.blocking_failures,
                "Risk assessment blocked payment"
            );
        }

        Ok(assessment)
    }

    fn conclude(
        &self,
        checks: BTreeMap<RiskCheck, CheckResult>,
        now: DateTime<Utc>,
    ) -> RiskAssessment {
        let failed: Vec<RiskCheck> = checks
            .iter()
            .filter(|(_, result)| !result.passed)
            .map(|(check, _)| *check)
            .collect();
        let blocking_failures: Vec<RiskCheck> = failed
            .iter()
            .copied()
            .filter(|check| self.config.blocking_checks.contains(check))
            .collect();

        let risk_score = self.config.score(&failed);
        let risk_level = if blocking_failures.is_empty() {
            self.config.level_for(risk_score)
        } else {
            RiskLevel::High
        };

        RiskAssessment {
            checks,
            risk_score,
            risk_level,
            approved: risk_level != RiskLevel::High,
            blocking_failures,
            assessed_at: now,
        }
    }
}

fn verdict(passed: bool, details: serde_json::Value) -> CheckResult {
    if passed {
        CheckResult::pass(details)
    } else {
        CheckResult::fail(details)
    }
}
