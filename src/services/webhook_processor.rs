use serde::Serialize;
use serde_json::Value as JsonValue;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::database::repository::SettlementOutcome;
use crate::domain::transaction::TransactionStatus;
use crate::error::{AppError, ErrorCode};
use crate::payments::types::{CallbackAck, ProviderName};
use crate::payments::utils::mask_signature;
use crate::services::payment_orchestrator::{PaymentOrchestrator, PaymentResolution};

#[derive(Debug, Error)]
pub enum WebhookProcessorError {
    #[error("Invalid signature: {0}")]
    InvalidSignature(String),
    #[error("Unknown provider: {0}")]
    UnknownProvider(String),
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),
    #[error("Processing error: {0}")]
    Processing(#[from] AppError),
}

/// What a verified callback did to the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum WebhookDisposition {
    Settled {
        order_id: String,
        status: TransactionStatus,
    },
    /// Redelivery of a callback whose transaction is already terminal.
    Replayed {
        order_id: String,
        status: TransactionStatus,
    },
}

/// HTTP answer for the provider. The body is always the provider's ack shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookReceipt {
    pub status_code: u16,
    pub ack: CallbackAck,
    pub disposition: Option<WebhookDisposition>,
}

pub struct WebhookProcessor {
    orchestrator: Arc<PaymentOrchestrator>,
}

impl WebhookProcessor {
    pub fn new(orchestrator: Arc<PaymentOrchestrator>) -> Self {
        Self { orchestrator }
    }

    /// Entry point for the HTTP route. Only authentication failures are
    /// refused; every other problem is logged and acknowledged so the
    /// provider does not keep redelivering.
    pub async fn handle(
        &self,
        provider_name: &str,
        signature: Option<&str>,
        payload: &JsonValue,
    ) -> WebhookReceipt {
        match self.process_webhook(provider_name, signature, payload).await {
            Ok(disposition) => WebhookReceipt {
                status_code: 200,
                ack: CallbackAck::received(),
                disposition: Some(disposition),
            },
            Err(WebhookProcessorError::InvalidSignature(reason)) => WebhookReceipt {
                status_code: 400,
                ack: CallbackAck::rejected(reason),
                disposition: None,
            },
            Err(WebhookProcessorError::UnknownProvider(name)) => WebhookReceipt {
                status_code: 404,
                ack: CallbackAck::rejected(format!("unknown provider {}", name)),
                disposition: None,
            },
            Err(e) => {
                match &e {
                    WebhookProcessorError::Processing(app) if app.error_code() == ErrorCode::NotFound => {
                        warn!(provider = %provider_name, error = %e, "Webhook for unknown order")
                    }
                    _ => error!(provider = %provider_name, error = %e, "Webhook processing failed"),
                }
                WebhookReceipt {
                    status_code: 200,
                    ack: CallbackAck::received(),
                    disposition: None,
                }
            }
        }
    }

    pub async fn process_webhook(
        &self,
        provider_name: &str,
        signature: Option<&str>,
        payload: &JsonValue,
    ) -> Result<WebhookDisposition, WebhookProcessorError> {
        let provider = self.parse_provider(provider_name)?;
        let gateway = self
            .orchestrator
            .gateways()
            .get(provider)
            .map_err(|_| WebhookProcessorError::UnknownProvider(provider_name.to_string()))?;

        // Verify before reading anything out of the payload
        let verification = gateway.verify_callback(payload, signature);
        if !verification.valid {
            let reason = verification
                .reason
                .unwrap_or_else(|| "signature mismatch".to_string());
            warn!(
                provider = %provider,
                signature = %signature.map(mask_signature).unwrap_or_default(),
                reason = %reason,
                "Rejected webhook with invalid signature"
            );
            return Err(WebhookProcessorError::InvalidSignature(reason));
        }

        let event = gateway
            .parse_callback(payload)
            .map_err(|e| WebhookProcessorError::MalformedPayload(e.to_string()))?;

        let ledger = self.orchestrator.ledger();
        let payment = ledger.find_payment_by_order_id(&event.order_id).await?;
        if payment.method != provider {
            return Err(WebhookProcessorError::MalformedPayload(format!(
                "order {} was not placed with {}",
                event.order_id, provider
            )));
        }
        let transaction = ledger.payment_transaction(payment.id).await?;

        let resolution = if event.is_success() {
            match event.amount {
                Some(paid) if paid != payment.amount => PaymentResolution::Failed {
                    reason: format!("amount mismatch: expected {}, got {}", payment.amount, paid),
                },
                _ => PaymentResolution::Succeeded {
                    gateway_transaction_id: event.provider_transaction_id.clone(),
                },
            }
        } else {
            PaymentResolution::Failed {
                reason: format!("{} (code {})", event.message, event.result_code),
            }
        };

        let outcome = self
            .orchestrator
            .resolve_transaction(&transaction, resolution, Some(event.payload.clone()))
            .await?;

        let disposition = match outcome {
            SettlementOutcome::Applied { transaction, .. } => {
                info!(
                    provider = %provider,
                    order_id = %event.order_id,
                    transaction_id = %transaction.id,
                    result_code = event.result_code,
                    status = %transaction.status,
                    "Webhook settled transaction"
                );
                WebhookDisposition::Settled {
                    order_id: event.order_id,
                    status: transaction.status,
                }
            }
            SettlementOutcome::AlreadySettled { transaction } => {
                info!(
                    provider = %provider,
                    order_id = %event.order_id,
                    status = %transaction.status,
                    "Webhook replay ignored"
                );
                WebhookDisposition::Replayed {
                    order_id: event.order_id,
                    status: transaction.status,
                }
            }
        };
        Ok(disposition)
    }

    fn parse_provider(&self, provider: &str) -> Result<ProviderName, WebhookProcessorError> {
        ProviderName::from_str(provider)
            .map_err(|_| WebhookProcessorError::UnknownProvider(provider.to_string()))
    }
}
