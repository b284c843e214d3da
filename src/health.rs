//! Health check module
//! Provides health status for the application and its dependencies

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, error};

use crate::payments::factory::GatewayFactory;

/// Health status response
#[derive(Debug, Serialize, Clone)]
pub struct HealthStatus {
    pub status: HealthState,
    pub checks: HashMap<String, ComponentHealth>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Overall health state
#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Individual component health status
#[derive(Debug, Serialize, Clone)]
pub struct ComponentHealth {
    pub status: ComponentState,
    pub response_time_ms: Option<u128>,
    pub details: Option<String>,
}

/// Component state
#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub enum ComponentState {
    Up,
    Down,
    Warning,
}

impl HealthStatus {
    pub fn new() -> Self {
        Self {
            status: HealthState::Healthy,
            checks: HashMap::new(),
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self.status, HealthState::Healthy)
    }
}

impl ComponentHealth {
    pub fn up(response_time_ms: Option<u128>) -> Self {
        Self {
            status: ComponentState::Up,
            response_time_ms,
            details: None,
        }
    }

    pub fn down(details: Option<String>) -> Self {
        Self {
            status: ComponentState::Down,
            response_time_ms: None,
            details,
        }
    }

    pub fn warning(response_time_ms: Option<u128>, details: Option<String>) -> Self {
        Self {
            status: ComponentState::Warning,
            response_time_ms,
            details,
        }
    }
}


/// Health checker for the application
#[derive(Clone)]
pub struct HealthChecker {
    /// `None` when running on the in-memory store.
    db_pool: Option<sqlx::PgPool>,
    gateways: Arc<GatewayFactory>,
}

impl HealthChecker {
    pub fn new(db_pool: Option<sqlx::PgPool>, gateways: Arc<GatewayFactory>) -> Self {
        Self { db_pool, gateways }
    }

    /// Database reachability plus the list of gateways this instance can use.
    pub async fn check_health(&self) -> HealthStatus {
        let mut health_status = HealthStatus::new();
        let mut overall = HealthState::Healthy;

        match &self.db_pool {
            Some(pool) => {
                match timeout(Duration::from_secs(5), check_database_health(pool)).await {
                    Ok(Ok(response_time)) => {
                        health_status.checks.insert(
                            "database".to_string(),
                            ComponentHealth::up(Some(response_time)),
                        );
                        debug!("Database health check: OK ({}ms)", response_time);
                    }
                    Ok(Err(e)) => {
                        overall = HealthState::Unhealthy;
                        health_status.checks.insert(
                            "database".to_string(),
                            ComponentHealth::down(Some(e.to_string())),
                        );
                        error!("Database health check failed: {}", e);
                    }
                    Err(_) => {
                        overall = HealthState::Unhealthy;
                        health_status.checks.insert(
                            "database".to_string(),
                            ComponentHealth::down(Some("Timeout".to_string())),
                        );
                        error!("Database health check timed out");
                    }
                }
            }
            None => {
                health_status.checks.insert(
                    "database".to_string(),
                    ComponentHealth::warning(None, Some("in-memory store".to_string())),
                );
            }
        }

        let providers: Vec<String> = self
            .gateways
            .list_available()
            .iter()
            .map(|p| p.to_string())
            .collect();
        if providers.is_empty() {
            overall = HealthState::Unhealthy;
            health_status.checks.insert(
                "gateways".to_string(),
                ComponentHealth::down(Some("no payment gateway enabled".to_string())),
            );
        } else {
            health_status.checks.insert(
                "gateways".to_string(),
                ComponentHealth {
                    status: ComponentState::Up,
                    response_time_ms: None,
                    details: Some(providers.join(",")),
                },
            );
        }

        if matches!(overall, HealthState::Healthy)
            && health_status
                .checks
                .values()
                .any(|c| matches!(c.status, ComponentState::Warning))
        {
            overall = HealthState::Degraded;
        }
        health_status.status = overall;
        health_status
    }
}

pub async fn check_database_health(
    pool: &sqlx::PgPool,
) -> Result<u128, Box<dyn std::error::Error + Send + Sync>> {
    let start = Instant::now();
    crate::database::health_check(pool).await?;
    Ok(start.elapsed().as_millis())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_health_status_creation() {
        let health_status = HealthStatus::new();
        assert!(matches!(health_status.status, HealthState::Healthy));
        assert!(health_status.checks.is_empty());
        assert!(health_status.timestamp <= chrono::Utc::now());
    }

    #[test]
    fn test_component_health_states() {
        let up_health = ComponentHealth::up(Some(100));
        assert!(matches!(up_health.status, ComponentState::Up));
        assert_eq!(up_health.response_time_ms, Some(100));

        let down_health = ComponentHealth::down(Some("Test error".to_string()));
        assert!(matches!(down_health.status, ComponentState::Down));
        assert_eq!(down_health.details, Some("Test error".to_string()));

        let warning_health = ComponentHealth::warning(Some(500), Some("Slow response".to_string()));
        assert!(matches!(warning_health.status, ComponentState::Warning));
        assert_eq!(warning_health.response_time_ms, Some(500));
        assert_eq!(warning_health.details, Some("Slow response".to_string()));
    }

    #[tokio::test]
    async fn test_in_memory_instance_is_degraded() {
        let gateways = Arc::new(GatewayFactory::with_gateways(vec![Arc::new(
            crate::payments::providers::cash::CashGateway::new(),
        )]));
        let status = HealthChecker::new(None, gateways).check_health().await;
        assert_eq!(status.status, HealthState::Degraded);
        assert_eq!(status.checks["gateways"].details.as_deref(), Some("cash"));
    }

    #[tokio::test]
    async fn test_no_gateways_is_unhealthy() {
        let gateways = Arc::new(GatewayFactory::with_gateways(Vec::new()));
        let status = HealthChecker::new(None, gateways).check_health().await;
        assert!(!status.is_healthy());
        assert_eq!(status.status, HealthState::Unhealthy);
    }
}
