use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use crate::payments::registry::{FeeSchedule, GatewayRegistry, RegistryError};
use crate::payments::types::ProviderName;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FeeBreakdown {
    pub provider: ProviderName,
    pub amount: i64,
    #[serde(with = "rust_decimal::serde::str")]
    pub percentage_rate: Decimal,
    pub percentage_fee: i64,
    pub fixed_fee: i64,
    pub total_fee: i64,
    pub net_amount: i64,
}

/// `amount * rate / 100 + fixed`, the percentage part rounded half away from
/// zero to whole minor units. `None` on overflow.
pub fn compute_fees(schedule: &FeeSchedule, amount: i64) -> Option<(i64, i64)> {
    let percentage_fee = Decimal::from(amount)
        .checked_mul(schedule.percentage_rate)?
        .checked_div(Decimal::ONE_HUNDRED)?
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()?;
    let total_fee = percentage_fee.checked_add(schedule.fixed_fee)?;
    Some((percentage_fee, total_fee))
}

#[derive(Clone)]
pub struct FeeCalculator {
    registry: Arc<GatewayRegistry>,
}

impl FeeCalculator {
    pub fn new(registry: Arc<GatewayRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &GatewayRegistry {
        &self.registry
    }

    /// Pure: the same provider and amount always produce the same breakdown.
    pub fn calculate_fees(
        &self,
        provider: ProviderName,
        amount: i64,
    ) -> Result<FeeBreakdown, RegistryError> {
        let gateway = self.registry.get_gateway(provider)?;
        let schedule = &gateway.fee_schedule;
        let (percentage_fee, total_fee) =
            compute_fees(schedule, amount).ok_or(RegistryError::FeeOverflow(amount))?;
        let net_amount = amount
            .checked_sub(total_fee)
            .ok_or(RegistryError::FeeOverflow(amount))?;

        debug!(
            provider = %provider,
            amount,
            total_fee,
            net_amount,
            "fees calculated"
        );

        Ok(FeeBreakdown {
            provider,
            amount,
            percentage_rate: schedule.percentage_rate,
            percentage_fee,
            fixed_fee: schedule.fixed_fee,
            total_fee,
            net_amount,
        })
    }

    /// Breakdown for every active gateway that accepts `amount`.
    pub fn quote_all(&self, amount: i64) -> Vec<FeeBreakdown> {
        self.registry
            .active_gateways()
            .into_iter()
            .filter(|g| self.registry.validate_amount(g.provider, amount).is_ok())
            .filter_map(|g| self.calculate_fees(g.provider, amount).ok())
            .collect()
    }
}
