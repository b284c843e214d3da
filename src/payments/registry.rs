use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

use crate::error::{AppError, AppErrorKind, ValidationError};
use crate::payments::types::ProviderName;

/// `fee = amount * percentage_rate / 100 + fixed_fee`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FeeSchedule {
    pub percentage_rate: Decimal,
    pub fixed_fee: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GatewayDefinition {
    pub provider: ProviderName,
    pub display_name: String,
    pub fee_schedule: FeeSchedule,
    pub min_amount: i64,
    pub max_amount: i64,
    pub is_active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("payment gateway '{0}' is not registered")]
    NotFound(ProviderName),
    #[error("payment gateway '{0}' is not active")]
    Inactive(ProviderName),
    #[error("amount {amount} outside [{min}, {max}] for {provider}")]
    AmountOutOfRange {
        provider: ProviderName,
        amount: i64,
        min: i64,
        max: i64,
    },
    #[error("fee computation overflowed for amount {0}")]
    FeeOverflow(i64),
}

impl From<RegistryError> for AppError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound(provider) => AppError::not_found("payment gateway", provider),
            RegistryError::Inactive(provider) => AppError::invalid_field(
                "method",
                format!("{} is currently unavailable", provider),
            ),
            RegistryError::AmountOutOfRange { min, max, .. } => {
                AppError::new(AppErrorKind::Validation(ValidationError::OutOfRange {
                    field: "amount".to_string(),
                    min: Some(min.to_string()),
                    max: Some(max.to_string()),
                }))
            }
            RegistryError::FeeOverflow(amount) => {
                AppError::invalid_amount(amount, "amount is too large")
            }
        }
    }
}

/// Static catalog of the payment methods a property accepts.
#[derive(Debug, Clone)]
pub struct GatewayRegistry {
    gateways: HashMap<ProviderName, GatewayDefinition>,
}

impl GatewayRegistry {
    pub fn new(definitions: Vec<GatewayDefinition>) -> Self {
        Self {
            gateways: definitions
                .into_iter()
                .map(|definition| (definition.provider, definition))
                .collect(),
        }
    }

    /// MoMo wallet, VietQR bank transfer and pay-at-property cash.
    pub fn default_catalog() -> Self {
        Self::new(vec![
            GatewayDefinition {
                provider: ProviderName::Momo,
                display_name: "MoMo e-wallet".to_string(),
                fee_schedule: FeeSchedule {
                    percentage_rate: Decimal::new(20, 1),
                    fixed_fee: 0,
                },
                min_amount: 1_000,
                max_amount: 50_000_000,
                is_active: true,
            },
            GatewayDefinition {
                provider: ProviderName::BankTransfer,
                display_name: "Bank transfer (VietQR)".to_string(),
                fee_schedule: FeeSchedule {
                    percentage_rate: Decimal::ZERO,
                    fixed_fee: 3_300,
                },
                min_amount: 10_000,
                max_amount: 500_000_000,
                is_active: true,
            },
            GatewayDefinition {
                provider: ProviderName::Cash,
                display_name: "Cash at property".to_string(),
                fee_schedule: FeeSchedule {
                    percentage_rate: Decimal::ZERO,
                    fixed_fee: 0,
                },
                min_amount: 1_000,
                max_amount: 100_000_000,
                is_active: true,
            },
        ])
    }

    pub fn get_gateway(&self, provider: ProviderName) -> Result<&GatewayDefinition, RegistryError> {
        self.gateways
            .get(&provider)
            .ok_or(RegistryError::NotFound(provider))
    }

    pub fn validate_amount(&self, provider: ProviderName, amount: i64) -> Result<(), RegistryError> {
        let gateway = self.get_gateway(provider)?;
        if !gateway.is_active {
            return Err(RegistryError::Inactive(provider));
        }
        if amount < gateway.min_amount || amount > gateway.max_amount {
            return Err(RegistryError::AmountOutOfRange {
                provider,
                amount,
                min: gateway.min_amount,
                max: gateway.max_amount,
            });
        }
        Ok(())
    }

    pub fn active_gateways(&self) -> Vec<&GatewayDefinition> {
        let mut active: Vec<_> = self.gateways.values().filter(|g| g.is_active).collect();
        active.sort_by_key(|g| g.provider.as_str());
        active
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_gateway_is_not_found() {
        let registry = GatewayRegistry::new(vec![]);
        assert_eq!(
            registry.get_gateway(ProviderName::Momo).unwrap_err(),
            RegistryError::NotFound(ProviderName::Momo)
        );
    }

    #[test]
    fn amount_bounds_are_inclusive() {
        let registry = GatewayRegistry::default_catalog();
        assert!(registry.validate_amount(ProviderName::Momo, 1_000).is_ok());
        assert!(registry.validate_amount(ProviderName::Momo, 50_000_000).is_ok());
        assert!(matches!(
            registry.validate_amount(ProviderName::Momo, 999),
            Err(RegistryError::AmountOutOfRange { .. })
        ));
        assert!(matches!(
            registry.validate_amount(ProviderName::Momo, 50_000_001),
            Err(RegistryError::AmountOutOfRange { .. })
        ));
    }

    #[test]
    fn inactive_gateway_rejects_every_amount() {
        let mut catalog = GatewayRegistry::default_catalog();
        if let Some(cash) = catalog.gateways.get_mut(&ProviderName::Cash) {
            cash.is_active = false;
        }
        assert_eq!(
            catalog.validate_amount(ProviderName::Cash, 10_000),
            Err(RegistryError::Inactive(ProviderName::Cash))
        );
        assert_eq!(catalog.active_gateways().len(), 2);
    }

    #[test]
    fn out_of_range_maps_to_validation_error() {
        let err: AppError = RegistryError::AmountOutOfRange {
            provider: ProviderName::Momo,
            amount: 1,
            min: 1_000,
            max: 50_000_000,
        }
        .into();
        assert_eq!(err.status_code(), 400);
    }
}
