//! Services module for business logic and integrations

pub mod fee_calculation;
pub mod installment_scheduler;
pub mod ledger;
pub mod notification;
pub mod payment_orchestrator;
pub mod reconciliation;
pub mod risk_engine;
pub mod webhook_processor;

pub use fee_calculation::{FeeBreakdown, FeeCalculator};
pub use installment_scheduler::InstallmentScheduler;
pub use ledger::TransactionLedger;
pub use notification::{LogNotificationSink, NotificationKind, NotificationSink};
pub use payment_orchestrator::{
    OrchestratorComponents, OrchestratorConfig, PaymentOrchestrator, PaymentResolution,
};
pub use reconciliation::{ReconciliationReport, ReconciliationService};
pub use risk_engine::{RiskConfig, RiskEngine};
pub use webhook_processor::WebhookProcessor;
