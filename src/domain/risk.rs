use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum RiskCheck {
    AmountLimit,
    DailyLimit,
    Velocity,
    Duplicate,
    FailedAttempts,
    SuspiciousActivity,
    Device,
}

impl RiskCheck {
    pub const ALL: [RiskCheck; 7] = [
        RiskCheck::AmountLimit,
        RiskCheck::DailyLimit,
        RiskCheck::Velocity,
        RiskCheck::Duplicate,
        RiskCheck::FailedAttempts,
        RiskCheck::SuspiciousActivity,
        RiskCheck::Device,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskCheck::AmountLimit => "amount_limit",
            RiskCheck::DailyLimit => "daily_limit",
            RiskCheck::Velocity => "velocity",
            RiskCheck::Duplicate => "duplicate",
            RiskCheck::FailedAttempts => "failed_attempts",
            RiskCheck::SuspiciousActivity => "suspicious_activity",
            RiskCheck::Device => "device",
        }
    }
}

impl fmt::Display for RiskCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckResult {
    pub passed: bool,
    pub details: JsonValue,
}

impl CheckResult {
    pub fn pass(details: JsonValue) -> Self {
        Self {
            passed: true,
            details,
        }
    }

    pub fn fail(details: JsonValue) -> Self {
        Self {
            passed: false,
            details,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
        })
    }
}

/// Outcome of scoring one payment attempt. Not persisted on its own; it is
/// logged and attached to `PaymentBlocked` errors for audit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RiskAssessment {
    pub checks: BTreeMap<RiskCheck, CheckResult>,
    pub risk_score: u8,
    pub risk_level: RiskLevel,
    pub approved: bool,
    /// Hard-rule checks that failed and forced the level to high.
    pub blocking_failures: Vec<RiskCheck>,
    pub assessed_at: DateTime<Utc>,
}

impl RiskAssessment {
    pub fn failed_checks(&self) -> Vec<RiskCheck> {
        self.checks
            .iter()
            .filter(|(_, result)| !result.passed)
            .map(|(check, _)| *check)
            .collect()
    }

    pub fn check(&self, check: RiskCheck) -> Option<&CheckResult> {
        self.checks.get(&check)
    }
}
