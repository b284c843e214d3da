//! Application configuration module
//! Handles environment variable loading, configuration validation, and application settings

use rust_decimal::Decimal;
use std::env;
use std::str::FromStr;

use crate::payments::factory::PaymentFactoryConfig;
use crate::payments::registry::{GatewayDefinition, GatewayRegistry};
use crate::payments::types::ProviderName;
use crate::services::payment_orchestrator::OrchestratorConfig;
use crate::services::risk_engine::RiskConfig;
use crate::workers::installment_sweep::InstallmentSweepConfig;
use crate::workers::reconciliation::ReconciliationWorkerConfig;

/// Main application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    /// `None` when running with `SKIP_EXTERNALS=true` on the in-memory store.
    pub database: Option<DatabaseConfig>,
    pub logging: LoggingConfig,
    pub gateways: GatewayConfig,
    pub risk: RiskConfig,
    pub orchestrator: OrchestratorConfig,
    pub workers: WorkerConfig,
    pub skip_externals: bool,
    pub run_migrations: bool,
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connection_timeout: u64,   // seconds
    pub idle_timeout: Option<u64>, // seconds
    pub max_lifetime: u64,         // seconds
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

/// Log format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Plain,
}

/// Enabled gateways, their credentials and the fee/limit catalog.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub providers: PaymentFactoryConfig,
    pub catalog: Vec<GatewayDefinition>,
}

/// Background job settings
#[derive(Debug, Clone, Default)]
pub struct WorkerConfig {
    pub reconciliation: ReconciliationWorkerConfig,
    pub installment_sweep: InstallmentSweepConfig,
}

/// Reads `key`, falling back to `default` when unset or blank.
pub(crate) fn parse_var<T: FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(key.to_string())),
        _ => Ok(default),
    }
}

/// A variable with no default; blank counts as missing.
pub(crate) fn required_var(key: &str) -> Result<String, ConfigError> {
    env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| ConfigError::MissingVariable(key.to_string()))
}

impl AppConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if it exists
        let _ = dotenv::dotenv().ok();

        let skip_externals = parse_var("SKIP_EXTERNALS", false)?;
        let database = if skip_externals {
            None
        } else {
            Some(DatabaseConfig::from_env()?)
        };

        Ok(AppConfig {
            server: ServerConfig::from_env()?,
            database,
            logging: LoggingConfig::from_env()?,
            gateways: GatewayConfig::from_env()?,
            risk: RiskConfig::from_env()?,
            orchestrator: OrchestratorConfig::from_env()?,
            workers: WorkerConfig::from_env()?,
            skip_externals,
            run_migrations: parse_var("RUN_MIGRATIONS", false)?,
        })
    }

    /// Validate the entire configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server.validate()?;
        if let Some(database) = &self.database {
            database.validate()?;
        }
        self.logging.validate()?;
        self.gateways.validate()?;
        self.risk.validate()?;
        self.orchestrator.validate()?;
        self.workers.validate()?;

        Ok(())
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(ServerConfig {
            host: env::var("SERVER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: parse_var("SERVER_PORT", 8000)?,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::InvalidValue(
                "SERVER_PORT cannot be 0".to_string(),
            ));
        }

        if self.host.is_empty() {
            return Err(ConfigError::InvalidValue(
                "SERVER_HOST cannot be empty".to_string(),
            ));
        }

        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl DatabaseConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(DatabaseConfig {
            url: env::var("DATABASE_URL")
                .map_err(|_| ConfigError::MissingVariable("DATABASE_URL".to_string()))?,
            max_connections: parse_var("DB_MAX_CONNECTIONS", 20)?,
            min_connections: parse_var("DB_MIN_CONNECTIONS", 5)?,
            connection_timeout: parse_var("DB_CONNECTION_TIMEOUT", 30)?,
            idle_timeout: env::var("DB_IDLE_TIMEOUT")
                .ok()
                .and_then(|val| val.parse().ok()),
            max_lifetime: parse_var("DB_MAX_LIFETIME", 1800)?,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.url.is_empty() {
            return Err(ConfigError::InvalidValue("DATABASE_URL".to_string()));
        }

        if self.max_connections == 0 {
            return Err(ConfigError::InvalidValue("DB_MAX_CONNECTIONS".to_string()));
        }

        if self.min_connections > self.max_connections {
            return Err(ConfigError::InvalidValue(
                "DB_MIN_CONNECTIONS must be <= DB_MAX_CONNECTIONS".to_string(),
            ));
        }

        Ok(())
    }
}

impl LoggingConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(LoggingConfig {
            level: env::var("LOG_LEVEL").unwrap_or_else(|_| "INFO".to_string()),
            format: match env::var("LOG_FORMAT")
                .unwrap_or_else(|_| "plain".to_string())
                .to_lowercase()
                .as_str()
            {
                "json" => LogFormat::Json,
                _ => LogFormat::Plain,
            },
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["TRACE", "DEBUG", "INFO", "WARN", "ERROR"];
        if !valid_levels.contains(&self.level.to_uppercase().as_str()) {
            return Err(ConfigError::InvalidValue("LOG_LEVEL".to_string()));
        }

        Ok(())
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "INFO".to_string(),
            format: LogFormat::Plain,
        }
    }
}

fn env_prefix(provider: ProviderName) -> &'static str {
    match provider {
        ProviderName::Momo => "MOMO",
        ProviderName::BankTransfer => "BANK_TRANSFER",
        ProviderName::Cash => "CASH",
    }
}

impl GatewayConfig {
    /// Starts from the built-in catalog; `{MOMO,BANK_TRANSFER,CASH}_FEE_PERCENT`,
    /// `_FIXED_FEE`, `_MIN_AMOUNT` and `_MAX_AMOUNT` override it. Gateways not
    /// listed in `ENABLED_PAYMENT_PROVIDERS` are marked inactive.
    pub fn from_env() -> Result<Self, ConfigError> {
        let providers = PaymentFactoryConfig::from_env()?;

        let mut catalog = Vec::new();
        for default in GatewayRegistry::default_catalog().active_gateways() {
            let prefix = env_prefix(default.provider);
            let mut definition = default.clone();
            definition.fee_schedule.percentage_rate = parse_var::<Decimal>(
                &format!("{}_FEE_PERCENT", prefix),
                definition.fee_schedule.percentage_rate,
            )?;
            definition.fee_schedule.fixed_fee = parse_var(
                &format!("{}_FIXED_FEE", prefix),
                definition.fee_schedule.fixed_fee,
            )?;
            definition.min_amount =
                parse_var(&format!("{}_MIN_AMOUNT", prefix), definition.min_amount)?;
            definition.max_amount =
                parse_var(&format!("{}_MAX_AMOUNT", prefix), definition.max_amount)?;
            definition.is_active = providers.enabled_providers.contains(&definition.provider);
            catalog.push(definition);
        }

        Ok(Self { providers, catalog })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.providers.enabled_providers.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "ENABLED_PAYMENT_PROVIDERS must name at least one provider".to_string(),
            ));
        }

        for definition in &self.catalog {
            let prefix = env_prefix(definition.provider);
            let rate = definition.fee_schedule.percentage_rate;
            if rate < Decimal::ZERO || rate > Decimal::ONE_HUNDRED {
                return Err(ConfigError::InvalidValue(format!("{}_FEE_PERCENT", prefix)));
            }
            if definition.fee_schedule.fixed_fee < 0 {
                return Err(ConfigError::InvalidValue(format!("{}_FIXED_FEE", prefix)));
            }
            if definition.min_amount <= 0 || definition.min_amount > definition.max_amount {
                return Err(ConfigError::ValidationFailed(format!(
                    "{}_MIN_AMOUNT must be positive and <= {}_MAX_AMOUNT",
                    prefix, prefix
                )));
            }
        }

        Ok(())
    }

    pub fn registry(&self) -> GatewayRegistry {
        GatewayRegistry::new(self.catalog.clone())
    }
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            reconciliation: ReconciliationWorkerConfig::from_env()?,
            installment_sweep: InstallmentSweepConfig::from_env()?,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.reconciliation.poll_interval.is_zero() {
            return Err(ConfigError::InvalidValue(
                "RECONCILIATION_INTERVAL_SECONDS".to_string(),
            ));
        }
        if self.reconciliation.min_age >= self.reconciliation.expire_after {
            return Err(ConfigError::ValidationFailed(
                "RECONCILIATION_MIN_AGE_SECONDS must be below RECONCILIATION_EXPIRE_AFTER_SECONDS"
                    .to_string(),
            ));
        }
        if self.installment_sweep.poll_interval.is_zero() {
            return Err(ConfigError::InvalidValue(
                "INSTALLMENT_SWEEP_INTERVAL_SECONDS".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVariable(String),

    #[error("Invalid value for configuration: {0}")]
    InvalidValue(String),

    #[error("Validation failed: {0}")]
    ValidationFailed(String),
}
