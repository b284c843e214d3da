use crate::config::ConfigError;
use crate::payments::error::{PaymentError, PaymentResult};
use crate::payments::provider::PaymentGateway;
use crate::payments::providers::{
    BankTransferConfig, BankTransferGateway, CashGateway, MomoConfig, MomoGateway,
};
use crate::payments::types::ProviderName;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct PaymentFactoryConfig {
    pub enabled_providers: Vec<ProviderName>,
    pub momo: Option<MomoConfig>,
    pub bank_transfer: Option<BankTransferConfig>,
}

impl PaymentFactoryConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let enabled_raw = std::env::var("ENABLED_PAYMENT_PROVIDERS")
            .unwrap_or_else(|_| "momo,bank_transfer,cash".to_string());
        let mut enabled_providers = Vec::new();
        for part in enabled_raw.split(',') {
            let value = part.trim();
            if value.is_empty() {
                continue;
            }
            let provider = ProviderName::from_str(value)
                .map_err(|_| ConfigError::InvalidValue("ENABLED_PAYMENT_PROVIDERS".to_string()))?;
            if !enabled_providers.contains(&provider) {
                enabled_providers.push(provider);
            }
        }

        let momo = if enabled_providers.contains(&ProviderName::Momo) {
            Some(MomoConfig::from_env()?)
        } else {
            None
        };
        let bank_transfer = if enabled_providers.contains(&ProviderName::BankTransfer) {
            Some(BankTransferConfig::from_env()?)
        } else {
            None
        };

        Ok(Self {
            enabled_providers,
            momo,
            bank_transfer,
        })
    }
}

/// One shared client per enabled provider.
#[derive(Clone, Default)]
pub struct GatewayFactory {
    gateways: HashMap<ProviderName, Arc<dyn PaymentGateway>>,
}

impl GatewayFactory {
    pub fn from_config(config: PaymentFactoryConfig) -> PaymentResult<Self> {
        let mut gateways: Vec<Arc<dyn PaymentGateway>> = Vec::new();
        for provider in &config.enabled_providers {
            let gateway: Arc<dyn PaymentGateway> = match provider {
                ProviderName::Momo => {
                    let momo = config.momo.clone().ok_or(missing_config(*provider))?;
                    Arc::new(MomoGateway::new(momo)?)
                }
                ProviderName::BankTransfer => {
                    let bank = config
                        .bank_transfer
                        .clone()
                        .ok_or(missing_config(*provider))?;
                    Arc::new(BankTransferGateway::new(bank))
                }
                ProviderName::Cash => Arc::new(CashGateway::new()),
            };
            gateways.push(gateway);
        }
        Ok(Self::with_gateways(gateways))
    }

    pub fn with_gateways(gateways: Vec<Arc<dyn PaymentGateway>>) -> Self {
        Self {
            gateways: gateways.into_iter().map(|g| (g.name(), g)).collect(),
        }
    }

    pub fn get(&self, provider: ProviderName) -> PaymentResult<Arc<dyn PaymentGateway>> {
        self.gateways
            .get(&provider)
            .cloned()
            .ok_or(PaymentError::ValidationError {
                message: format!("provider {} is disabled", provider),
                field: Some("method".to_string()),
            })
    }

    pub fn list_available(&self) -> Vec<ProviderName> {
        let mut providers: Vec<_> = self.gateways.keys().copied().collect();
        providers.sort_by_key(|p| p.as_str());
        providers
    }
}

fn missing_config(provider: ProviderName) -> PaymentError {
    PaymentError::ValidationError {
        message: format!("{} is enabled but not configured", provider),
        field: Some(provider.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_available_returns_enabled() {
        let factory = GatewayFactory::from_config(PaymentFactoryConfig {
            enabled_providers: vec![ProviderName::Cash, ProviderName::BankTransfer],
            momo: None,
            bank_transfer: Some(BankTransferConfig::default()),
        })
        .unwrap();
        assert_eq!(
            factory.list_available(),
            vec![ProviderName::BankTransfer, ProviderName::Cash]
        );
        assert!(factory.get(ProviderName::Momo).is_err());
        assert_eq!(factory.get(ProviderName::Cash).unwrap().name(), ProviderName::Cash);
    }

    #[test]
    fn enabled_provider_without_config_fails() {
        let result = GatewayFactory::from_config(PaymentFactoryConfig {
            enabled_providers: vec![ProviderName::Momo],
            momo: None,
            bank_transfer: None,
        });
        assert!(result.is_err());
    }
}
