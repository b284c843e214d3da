//! Payment Orchestrator Service
//!
//! Drives one payment attempt from request to gateway hand-off:
//! validate booking, check the remaining balance, score risk, open the ledger
//! entry, call the gateway and record what it said. Final confirmation arrives
//! later through a webhook, reconciliation or staff confirmation, all of which
//! funnel into [`PaymentOrchestrator::resolve_transaction`].

use chrono::{Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{parse_var, ConfigError};
use crate::database::repository::{
    BookingDirectory, GatewayCorrelation, InstallmentApplication, PaymentEffect, Settlement,
    SettlementOutcome,
};
use crate::domain::booking::BookingDetails;
use crate::domain::installment::ScheduleStatus;
use crate::domain::payment::{order_reference, NewPayment, Payment, PaymentStatus};
use crate::domain::risk::RiskAssessment;
use crate::domain::transaction::{
    AttemptContext, GatewayOutcome, PaymentTransaction, TransactionStatus, TransactionType,
};
use crate::error::{AppError, AppErrorKind, AppResult, DomainError, ExternalError};
use crate::payments::provider::PaymentGateway;
use crate::payments::types::{
    CallbackUrls, NormalizedGatewayResponse, PaymentRequest, ProviderName, RefundRequest,
};
use crate::payments::GatewayFactory;
use crate::services::fee_calculation::{FeeBreakdown, FeeCalculator};
use crate::services::installment_scheduler::InstallmentScheduler;
use crate::services::ledger::TransactionLedger;
use crate::services::notification::{NotificationKind, NotificationSink};
use crate::services::risk_engine::{RiskEngine, RiskInput};

// ============================================================================
// Configuration Types
// ============================================================================

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Upper bound on one synchronous gateway call
    pub gateway_timeout_secs: u64,
    pub notification_timeout_secs: u64,
    /// Equivalent attempts opened within this window are refused as duplicates
    pub duplicate_window_secs: i64,
    pub currency: String,
    /// Where the customer's browser lands after paying
    pub redirect_url: String,
    /// Public base of the webhook routes; the provider name is appended
    pub ipn_base_url: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            gateway_timeout_secs: 10,
            notification_timeout_secs: 5,
            duplicate_window_secs: 300,
            currency: "VND".to_string(),
            redirect_url: "http://localhost:3000/payments/result".to_string(),
            ipn_base_url: "http://localhost:8000/webhooks".to_string(),
        }
    }
}

impl OrchestratorConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let d = Self::default();
        Ok(Self {
            gateway_timeout_secs: parse_var("GATEWAY_TIMEOUT_SECONDS", d.gateway_timeout_secs)?,
            notification_timeout_secs: parse_var(
                "NOTIFICATION_TIMEOUT_SECONDS",
                d.notification_timeout_secs,
            )?,
            duplicate_window_secs: parse_var(
                "PAYMENT_DUPLICATE_WINDOW_SECONDS",
                d.duplicate_window_secs,
            )?,
            currency: parse_var("PAYMENT_CURRENCY", d.currency)?,
            redirect_url: parse_var("PAYMENT_REDIRECT_URL", d.redirect_url)?,
            ipn_base_url: parse_var("PAYMENT_IPN_BASE_URL", d.ipn_base_url)?,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.gateway_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue("GATEWAY_TIMEOUT_SECONDS".to_string()));
        }
        if self.notification_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "NOTIFICATION_TIMEOUT_SECONDS".to_string(),
            ));
        }
        if self.duplicate_window_secs <= 0 {
            return Err(ConfigError::InvalidValue(
                "PAYMENT_DUPLICATE_WINDOW_SECONDS".to_string(),
            ));
        }
        if self.currency.trim().is_empty() {
            return Err(ConfigError::MissingVariable("PAYMENT_CURRENCY".to_string()));
        }
        for (key, url) in [
            ("PAYMENT_REDIRECT_URL", &self.redirect_url),
            ("PAYMENT_IPN_BASE_URL", &self.ipn_base_url),
        ] {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(ConfigError::InvalidValue(key.to_string()));
            }
        }
        Ok(())
    }

    pub fn callback_urls(&self, provider: ProviderName) -> CallbackUrls {
        CallbackUrls {
            redirect_url: self.redirect_url.clone(),
            ipn_url: format!("{}/{}", self.ipn_base_url.trim_end_matches('/'), provider),
        }
    }
}

// ============================================================================
// Attempt State Machine
// ============================================================================

/// Where a payment attempt currently is. Only used to label log lines; the
/// persisted truth is the ledger.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OrchestrationStage {
    Received,
    RiskChecked,
    LedgerCreated,
    GatewayCalled,
    Recorded,
    Notified,
    Failed,
}

impl OrchestrationStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrchestrationStage::Received => "received",
            OrchestrationStage::RiskChecked => "risk_checked",
            OrchestrationStage::LedgerCreated => "ledger_created",
            OrchestrationStage::GatewayCalled => "gateway_called",
            OrchestrationStage::Recorded => "recorded",
            OrchestrationStage::Notified => "notified",
            OrchestrationStage::Failed => "failed",
        }
    }
}

impl std::fmt::Display for OrchestrationStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Request / Response Types
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatePaymentRequest {
    pub booking_id: Uuid,
    pub amount: i64,
    pub method: ProviderName,
    #[serde(default)]
    pub order_info: Option<String>,
    #[serde(skip)]
    pub context: AttemptContext,
}

/// What the customer needs to finish paying.
#[derive(Debug, Clone, Serialize)]
pub struct PaymentInitiation {
    pub payment: Payment,
    pub transaction: PaymentTransaction,
    pub fees: FeeBreakdown,
    pub pay_url: Option<String>,
    pub qr_code_url: Option<String>,
    pub deeplink: Option<String>,
    pub gateway_message: Option<String>,
    pub risk: RiskAssessment,
}

#[derive(Debug, Clone, Serialize)]
pub struct PaymentDetails {
    pub payment: Payment,
    pub transactions: Vec<PaymentTransaction>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RefundResult {
    pub refund: PaymentTransaction,
    pub payment: Payment,
}

/// Final word on a pending payment transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum PaymentResolution {
    Succeeded { gateway_transaction_id: Option<String> },
    Failed { reason: String },
}

/// Wiring for [`PaymentOrchestrator::new`].
#[derive(Clone)]
pub struct OrchestratorComponents {
    pub ledger: TransactionLedger,
    pub risk: RiskEngine,
    pub fees: FeeCalculator,
    pub gateways: GatewayFactory,
    pub bookings: Arc<dyn BookingDirectory>,
    pub scheduler: InstallmentScheduler,
    pub notifier: Arc<dyn NotificationSink>,
}

// ============================================================================
// Main Payment Orchestrator
// ============================================================================

#[derive(Clone)]
pub struct PaymentOrchestrator {
    ledger: TransactionLedger,
    risk: RiskEngine,
    fees: FeeCalculator,
    gateways: GatewayFactory,
    bookings: Arc<dyn BookingDirectory>,
    scheduler: InstallmentScheduler,
    notifier: Arc<dyn NotificationSink>,
    config: OrchestratorConfig,
}

impl PaymentOrchestrator {
    pub fn new(components: OrchestratorComponents, config: OrchestratorConfig) -> Self {
        Self {
            ledger: components.ledger,
            risk: components.risk,
            fees: components.fees,
            gateways: components.gateways,
            bookings: components.bookings,
            scheduler: components.scheduler,
            notifier: components.notifier,
            config,
        }
    }

    pub fn ledger(&self) -> &TransactionLedger {
        &self.ledger
    }

    pub fn fees(&self) -> &FeeCalculator {
        &self.fees
    }

    pub fn gateways(&self) -> &GatewayFactory {
        &self.gateways
    }

    pub fn scheduler(&self) -> &InstallmentScheduler {
        &self.scheduler
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    // =========================================================================
    // Payment Initiation
    // =========================================================================

    pub async fn create_payment(
        &self,
        customer_id: Uuid,
        request: CreatePaymentRequest,
    ) -> AppResult<PaymentInitiation> {
        self.initiate(customer_id, request, None).await
    }

    /// Charges the next installment of a plan through the normal payment
    /// path. The plan advances when that payment settles successfully.
    pub async fn initiate_installment_payment(
        &self,
        customer_id: Uuid,
        schedule_id: Uuid,
        method: ProviderName,
        context: AttemptContext,
    ) -> AppResult<PaymentInitiation> {
        let schedule = self.scheduler.get(schedule_id, customer_id).await?;
        if schedule.status != ScheduleStatus::Active {
            return Err(AppError::invalid_transition(
                "installment schedule",
                schedule.id,
                schedule.status,
                "charged",
            ));
        }
        if schedule.remaining_amount <= 0 {
            return Err(AppError::invalid_amount(0, "schedule has no remaining balance"));
        }

        let request = CreatePaymentRequest {
            booking_id: schedule.booking_id,
            amount: schedule.next_charge_amount(),
            method,
            order_info: Some(format!(
                "Installment {}/{}",
                schedule.completed_installments + 1,
                schedule.installment_count
            )),
            context,
        };
        self.initiate(customer_id, request, Some(schedule.id)).await
    }

    async fn initiate(
        &self,
        customer_id: Uuid,
        request: CreatePaymentRequest,
        installment_schedule_id: Option<Uuid>,
    ) -> AppResult<PaymentInitiation> {
        let method = request.method;
        let amount = request.amount;
        debug!(
            stage = OrchestrationStage::Received.as_str(),
            customer_id = %customer_id,
            booking_id = %request.booking_id,
            provider = %method,
            amount,
            "Payment request received"
        );

        if amount <= 0 {
            return Err(AppError::invalid_amount(amount, "amount must be greater than zero"));
        }
        let booking = self.payable_booking(customer_id, request.booking_id).await?;
        self.fees.registry().validate_amount(method, amount)?;
        let fees = self.fees.calculate_fees(method, amount)?;
        let gateway = self.gateways.get(method)?;

        // Early answer; the ledger repeats this check atomically when it opens the attempt
        let already_paid = self.ledger.committed_total_for_booking(booking.id).await?;
        if already_paid.saturating_add(amount) > booking.total_amount {
            return Err(AppError::new(AppErrorKind::Domain(
                DomainError::InsufficientRemainingBalance {
                    booking_total: booking.total_amount,
                    already_paid,
                    requested: amount,
                },
            )));
        }

        let assessment = self
            .risk
            .assess(
                customer_id,
                &RiskInput {
                    amount,
                    method,
                    booking_id: booking.id,
                    context: request.context.clone(),
                },
            )
            .await?;
        if !assessment.approved {
            warn!(
                stage = OrchestrationStage::Failed.as_str(),
                customer_id = %customer_id,
                booking_id = %booking.id,
                risk_score = assessment.risk_score,
                risk_level = %assessment.risk_level,
                "Payment blocked by risk engine"
            );
            return Err(AppError::new(AppErrorKind::Domain(DomainError::PaymentBlocked {
                assessment: Box::new(assessment),
            })));
        }
        debug!(
            stage = OrchestrationStage::RiskChecked.as_str(),
            risk_score = assessment.risk_score,
            "Risk check passed"
        );

        let now = Utc::now();
        let payment = self.ledger.create_payment(NewPayment {
            booking_id: booking.id,
            customer_id,
            amount,
            currency: self.config.currency.clone(),
            method,
            installment_schedule_id,
        })?;
        let transaction =
            PaymentTransaction::for_payment(&payment, fees.total_fee, &request.context, now);
        self.ledger
            .open_attempt(
                &payment,
                &transaction,
                now - ChronoDuration::seconds(self.config.duplicate_window_secs),
                booking.total_amount,
            )
            .await?;
        debug!(
            stage = OrchestrationStage::LedgerCreated.as_str(),
            payment_id = %payment.id,
            transaction_id = %transaction.id,
            "Ledger entry created"
        );

        let gateway_request = PaymentRequest {
            order_id: payment.order_id.clone(),
            request_id: payment.request_id.clone(),
            amount,
            order_info: request
                .order_info
                .clone()
                .unwrap_or_else(|| format!("Homestay booking {}", booking.id.simple())),
            callback_urls: self.config.callback_urls(method),
            extra_data: Some(json!({
                "payment_id": payment.id,
                "booking_id": booking.id,
            })),
        };
        let response = self.call_gateway(gateway.as_ref(), gateway_request).await;
        info!(
            stage = OrchestrationStage::GatewayCalled.as_str(),
            payment_id = %payment.id,
            order_id = %payment.order_id,
            provider = %method,
            outcome = response.outcome.as_str(),
            "Gateway answered"
        );

        match response.outcome {
            GatewayOutcome::Accepted => {
                self.ledger
                    .record_gateway_response(GatewayCorrelation {
                        payment_id: payment.id,
                        transaction_id: transaction.id,
                        outcome: GatewayOutcome::Accepted,
                        external_transaction_id: response.provider_transaction_id.clone(),
                        pay_url: response.pay_url.clone(),
                        gateway_response: response.raw_response.clone(),
                        failure_reason: None,
                        recorded_at: Utc::now(),
                    })
                    .await?;
            }
            GatewayOutcome::Rejected => {
                let reason = response.failure_reason();
                self.ledger
                    .settle(Settlement {
                        transaction_id: transaction.id,
                        status: TransactionStatus::Failed,
                        gateway_transaction_id: response.provider_transaction_id.clone(),
                        gateway_response: Some(response.raw_response.clone()),
                        gateway_outcome: Some(GatewayOutcome::Rejected),
                        failure_reason: Some(reason.clone()),
                        payment_effect: PaymentEffect::MarkFailed,
                        confirm_booking: false,
                        settled_at: Utc::now(),
                    })
                    .await?;
                self.notify(
                    customer_id,
                    NotificationKind::PaymentFailed,
                    json!({
                        "payment_id": payment.id,
                        "booking_id": booking.id,
                        "amount": amount,
                        "reason": reason,
                    }),
                )
                .await;
                warn!(
                    stage = OrchestrationStage::Failed.as_str(),
                    payment_id = %payment.id,
                    provider = %method,
                    reason = %reason,
                    "Gateway rejected payment"
                );
                return Err(AppError::new(AppErrorKind::External(
                    ExternalError::GatewayRejected {
                        provider: method.to_string(),
                        message: reason,
                        provider_code: response.result_code.map(|code| code.to_string()),
                    },
                )));
            }
            GatewayOutcome::Unknown => {
                let reason = response.failure_reason();
                self.ledger
                    .record_gateway_response(GatewayCorrelation {
                        payment_id: payment.id,
                        transaction_id: transaction.id,
                        outcome: GatewayOutcome::Unknown,
                        external_transaction_id: None,
                        pay_url: None,
                        gateway_response: response.raw_response.clone(),
                        failure_reason: Some(reason.clone()),
                        recorded_at: Utc::now(),
                    })
                    .await?;
                warn!(
                    stage = OrchestrationStage::Failed.as_str(),
                    payment_id = %payment.id,
                    provider = %method,
                    reason = %reason,
                    "Gateway outcome unknown, left pending for reconciliation"
                );
                return Err(AppError::new(AppErrorKind::External(
                    ExternalError::GatewayUnavailable {
                        provider: method.to_string(),
                        reason,
                        outcome_unknown: true,
                    },
                )));
            }
        }

        let payment = self.ledger.find_payment(payment.id).await?;
        let transaction = self.ledger.find_transaction(transaction.id).await?;
        debug!(
            stage = OrchestrationStage::Recorded.as_str(),
            payment_id = %payment.id,
            "Gateway response recorded"
        );

        self.notify(
            customer_id,
            NotificationKind::PaymentInitiated,
            json!({
                "payment_id": payment.id,
                "booking_id": payment.booking_id,
                "amount": payment.amount,
                "method": method,
                "pay_url": response.pay_url,
            }),
        )
        .await;
        info!(
            stage = OrchestrationStage::Notified.as_str(),
            payment_id = %payment.id,
            order_id = %payment.order_id,
            customer_id = %customer_id,
            amount,
            fee = fees.total_fee,
            "Payment initiated"
        );

        Ok(PaymentInitiation {
            payment,
            transaction,
            fees,
            pay_url: response.pay_url,
            qr_code_url: response.qr_code_url,
            deeplink: response.deeplink,
            gateway_message: response.message,
            risk: assessment,
        })
    }

    async fn payable_booking(&self, customer_id: Uuid, booking_id: Uuid) -> AppResult<BookingDetails> {
        let booking = self
            .bookings
            .find_booking_with_details(booking_id)
            .await?
            .ok_or_else(|| AppError::not_found("booking", booking_id))?;
        if booking.owner_id != customer_id {
            return Err(AppError::forbidden("booking"));
        }
        if !booking.status.is_payable() {
            return Err(AppError::new(AppErrorKind::Domain(
                DomainError::BookingNotPayable {
                    booking_id: booking.id.to_string(),
                    status: booking.status.to_string(),
                },
            )));
        }
        Ok(booking)
    }

    /// Bounded by `gateway_timeout_secs`; a timeout is an unknown outcome.
    async fn call_gateway(
        &self,
        gateway: &dyn PaymentGateway,
        request: PaymentRequest,
    ) -> NormalizedGatewayResponse {
        let started = Instant::now();
        let timeout = Duration::from_secs(self.config.gateway_timeout_secs);
        let response = match tokio::time::timeout(timeout, gateway.create_payment_request(request)).await {
            Ok(response) => response,
            Err(_) => NormalizedGatewayResponse::timed_out(self.config.gateway_timeout_secs),
        };
        debug!(
            provider = %gateway.name(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            outcome = response.outcome.as_str(),
            "Gateway create request finished"
        );
        response
    }

    // =========================================================================
    // Settlement
    // =========================================================================

    /// Settles a pending payment transaction. Success completes the payment,
    /// confirms a pending booking and advances a linked installment plan in
    /// one unit of work. Replays find the transaction already terminal and
    /// change nothing, so notifications go out once.
    pub async fn resolve_transaction(
        &self,
        transaction: &PaymentTransaction,
        resolution: PaymentResolution,
        gateway_response: Option<JsonValue>,
    ) -> AppResult<SettlementOutcome> {
        if transaction.transaction_type != TransactionType::Payment {
            return Err(AppError::invalid_field(
                "transaction_id",
                "only payment transactions are resolved here",
            ));
        }

        let settlement = match &resolution {
            PaymentResolution::Succeeded {
                gateway_transaction_id,
            } => Settlement {
                transaction_id: transaction.id,
                status: TransactionStatus::Completed,
                gateway_transaction_id: gateway_transaction_id.clone(),
                gateway_response,
                gateway_outcome: Some(GatewayOutcome::Accepted),
                failure_reason: None,
                payment_effect: PaymentEffect::MarkCompleted,
                confirm_booking: true,
                settled_at: Utc::now(),
            },
            PaymentResolution::Failed { reason } => Settlement {
                transaction_id: transaction.id,
                status: TransactionStatus::Failed,
                gateway_transaction_id: None,
                gateway_response,
                gateway_outcome: None,
                failure_reason: Some(reason.clone()),
                payment_effect: PaymentEffect::MarkFailed,
                confirm_booking: false,
                settled_at: Utc::now(),
            },
        };

        let outcome = self.ledger.settle(settlement).await?;
        if let SettlementOutcome::Applied {
            transaction: settled,
            payment,
            booking_confirmed,
            installment,
        } = &outcome
        {
            match &resolution {
                PaymentResolution::Succeeded { .. } => {
                    if let Some(InstallmentApplication::Skipped { schedule_id, reason }) = installment {
                        warn!(
                            schedule_id = %schedule_id,
                            payment_id = %payment.id,
                            reason = %reason,
                            "Payment settled but installment plan was not advanced"
                        );
                    }
                    self.notify(
                        payment.customer_id,
                        NotificationKind::PaymentSucceeded,
                        json!({
                            "payment_id": payment.id,
                            "booking_id": payment.booking_id,
                            "amount": payment.amount,
                            "net_amount": settled.net_amount,
                            "booking_confirmed": booking_confirmed,
                            "installment": installment,
                        }),
                    )
                    .await;
                }
                PaymentResolution::Failed { reason } => {
                    self.notify(
                        payment.customer_id,
                        NotificationKind::PaymentFailed,
                        json!({
                            "payment_id": payment.id,
                            "booking_id": payment.booking_id,
                            "amount": payment.amount,
                            "reason": reason,
                        }),
                    )
                    .await;
                }
            }
        }
        Ok(outcome)
    }

    pub async fn handle_payment_success(
        &self,
        order_id: &str,
        gateway_transaction_id: Option<String>,
        gateway_response: Option<JsonValue>,
    ) -> AppResult<SettlementOutcome> {
        let payment = self.ledger.find_payment_by_order_id(order_id).await?;
        let transaction = self.ledger.payment_transaction(payment.id).await?;
        let outcome = self
            .resolve_transaction(
                &transaction,
                PaymentResolution::Succeeded {
                    gateway_transaction_id,
                },
                gateway_response,
            )
            .await?;
        info!(order_id = %order_id, payment_id = %payment.id, "Payment success processed");
        Ok(outcome)
    }

    pub async fn handle_payment_failure(
        &self,
        order_id: &str,
        reason: &str,
        gateway_response: Option<JsonValue>,
    ) -> AppResult<SettlementOutcome> {
        let payment = self.ledger.find_payment_by_order_id(order_id).await?;
        let transaction = self.ledger.payment_transaction(payment.id).await?;
        let outcome = self
            .resolve_transaction(
                &transaction,
                PaymentResolution::Failed {
                    reason: reason.to_string(),
                },
                gateway_response,
            )
            .await?;
        info!(order_id = %order_id, reason = %reason, "Payment failure processed");
        Ok(outcome)
    }

    /// Staff confirmation for money received outside any gateway callback:
    /// cash at the property, or a bank transfer seen on the statement.
    pub async fn confirm_offline_payment(
        &self,
        payment_id: Uuid,
        reference: Option<String>,
    ) -> AppResult<PaymentDetails> {
        let payment = self.ledger.find_payment(payment_id).await?;
        if !matches!(payment.method, ProviderName::Cash | ProviderName::BankTransfer) {
            return Err(AppError::invalid_field(
                "method",
                format!("{} payments are confirmed by the provider", payment.method),
            ));
        }
        let transaction = self.ledger.payment_transaction(payment.id).await?;
        if transaction.status != TransactionStatus::Pending {
            return Err(AppError::invalid_transition(
                "transaction",
                transaction.id,
                transaction.status,
                TransactionStatus::Completed,
            ));
        }

        self.resolve_transaction(
            &transaction,
            PaymentResolution::Succeeded {
                gateway_transaction_id: reference.clone(),
            },
            Some(json!({ "confirmed_by": "staff", "reference": reference })),
        )
        .await?;
        info!(payment_id = %payment_id, method = %payment.method, "Offline payment confirmed");
        self.payment_details(payment_id).await
    }

    // =========================================================================
    // Refunds
    // =========================================================================

    /// Records a refund, asks the provider to move the money and settles the
    /// refund row with the answer. An unknown answer leaves it pending.
    pub async fn refund_payment(
        &self,
        customer_id: Uuid,
        payment_id: Uuid,
        amount: i64,
        reason: Option<String>,
    ) -> AppResult<RefundResult> {
        let payment = self.ledger.find_payment(payment_id).await?;
        if payment.customer_id != customer_id {
            return Err(AppError::forbidden("payment"));
        }
        if payment.status != PaymentStatus::Completed {
            return Err(AppError::invalid_transition(
                "payment",
                payment.id,
                payment.status,
                PaymentStatus::Refunded,
            ));
        }
        let original = self.ledger.payment_transaction(payment.id).await?;
        let gateway = self.gateways.get(original.provider)?;

        let refund = self
            .ledger
            .create_refund(original.id, amount, reason.clone())
            .await?;

        let request = RefundRequest {
            order_id: order_reference(refund.id),
            request_id: Uuid::new_v4().to_string(),
            amount,
            provider_transaction_id: original
                .gateway_transaction_id
                .clone()
                .or_else(|| payment.external_transaction_id.clone()),
            description: reason.unwrap_or_else(|| format!("Refund for {}", payment.order_id)),
        };
        let timeout = Duration::from_secs(self.config.gateway_timeout_secs);
        let response = match tokio::time::timeout(timeout, gateway.refund(request)).await {
            Ok(response) => response,
            Err(_) => NormalizedGatewayResponse::timed_out(self.config.gateway_timeout_secs),
        };

        match response.outcome {
            GatewayOutcome::Accepted => {
                self.ledger
                    .settle(Settlement {
                        transaction_id: refund.id,
                        status: TransactionStatus::Completed,
                        gateway_transaction_id: response.provider_transaction_id.clone(),
                        gateway_response: Some(response.raw_response.clone()),
                        gateway_outcome: Some(GatewayOutcome::Accepted),
                        failure_reason: None,
                        payment_effect: PaymentEffect::MarkRefundedIfFullyRefunded,
                        confirm_booking: false,
                        settled_at: Utc::now(),
                    })
                    .await?;
                self.notify(
                    payment.customer_id,
                    NotificationKind::RefundProcessed,
                    json!({
                        "payment_id": payment.id,
                        "refund_id": refund.id,
                        "amount": amount,
                    }),
                )
                .await;
            }
            GatewayOutcome::Rejected => {
                let message = response.failure_reason();
                self.ledger
                    .settle(Settlement {
                        transaction_id: refund.id,
                        status: TransactionStatus::Failed,
                        gateway_transaction_id: None,
                        gateway_response: Some(response.raw_response.clone()),
                        gateway_outcome: Some(GatewayOutcome::Rejected),
                        failure_reason: Some(message.clone()),
                        payment_effect: PaymentEffect::Unchanged,
                        confirm_booking: false,
                        settled_at: Utc::now(),
                    })
                    .await?;
                return Err(AppError::new(AppErrorKind::External(
                    ExternalError::GatewayRejected {
                        provider: original.provider.to_string(),
                        message,
                        provider_code: response.result_code.map(|code| code.to_string()),
                    },
                )));
            }
            GatewayOutcome::Unknown => {
                let reason = response.failure_reason();
                self.ledger
                    .record_gateway_response(GatewayCorrelation {
                        payment_id: payment.id,
                        transaction_id: refund.id,
                        outcome: GatewayOutcome::Unknown,
                        external_transaction_id: None,
                        pay_url: None,
                        gateway_response: response.raw_response.clone(),
                        failure_reason: Some(reason.clone()),
                        recorded_at: Utc::now(),
                    })
                    .await?;
                warn!(refund_id = %refund.id, reason = %reason, "Refund outcome unknown");
                return Err(AppError::new(AppErrorKind::External(
                    ExternalError::GatewayUnavailable {
                        provider: original.provider.to_string(),
                        reason,
                        outcome_unknown: true,
                    },
                )));
            }
        }

        info!(
            payment_id = %payment.id,
            refund_id = %refund.id,
            amount,
            "Refund processed"
        );
        Ok(RefundResult {
            refund: self.ledger.find_transaction(refund.id).await?,
            payment: self.ledger.find_payment(payment.id).await?,
        })
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub async fn payment_details(&self, payment_id: Uuid) -> AppResult<PaymentDetails> {
        let payment = self.ledger.find_payment(payment_id).await?;
        let transactions = self.ledger.list_transactions(payment_id).await?;
        Ok(PaymentDetails {
            payment,
            transactions,
        })
    }

    pub async fn get_payment(&self, payment_id: Uuid, customer_id: Uuid) -> AppResult<PaymentDetails> {
        let details = self.payment_details(payment_id).await?;
        if details.payment.customer_id != customer_id {
            return Err(AppError::forbidden("payment"));
        }
        Ok(details)
    }

    // =========================================================================
    // Notifications
    // =========================================================================

    /// Best effort. Failures and timeouts are logged and dropped.
    async fn notify(&self, customer_id: Uuid, kind: NotificationKind, payload: JsonValue) {
        let timeout = Duration::from_secs(self.config.notification_timeout_secs);
        match tokio::time::timeout(timeout, self.notifier.notify(customer_id, kind, payload)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(
                customer_id = %customer_id,
                kind = kind.as_str(),
                error = %e,
                "notification failed"
            ),
            Err(_) => warn!(
                customer_id = %customer_id,
                kind = kind.as_str(),
                timeout_secs = self.config.notification_timeout_secs,
                "notification timed out"
            ),
        }
    }
}
