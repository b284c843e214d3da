//! Shared fixtures: an in-memory engine and a gateway double whose answers
//! are set per test.
#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

use homestay_payments::database::InMemoryStore;
use homestay_payments::domain::booking::{BookingDetails, BookingStatus};
use homestay_payments::domain::transaction::AttemptContext;
use homestay_payments::payments::error::{PaymentError, PaymentResult};
use homestay_payments::payments::factory::GatewayFactory;
use homestay_payments::payments::provider::PaymentGateway;
use homestay_payments::payments::registry::GatewayRegistry;
use homestay_payments::payments::types::{
    CallbackEvent, CallbackVerification, GatewayPaymentState, NormalizedGatewayResponse,
    PaymentRequest, ProviderName, RefundRequest, StatusQuery, StatusResponse,
};
use homestay_payments::services::notification::{NotificationError, NotificationKind};
use homestay_payments::services::payment_orchestrator::CreatePaymentRequest;
use homestay_payments::services::{
    FeeCalculator, InstallmentScheduler, NotificationSink, OrchestratorComponents,
    OrchestratorConfig, PaymentOrchestrator, RiskConfig, RiskEngine, TransactionLedger,
};

pub const VALID_SIGNATURE: &str = "valid-signature";

/// Gateway double. Answers whatever the test scripted; callbacks are
/// accepted when `signature` equals [`VALID_SIGNATURE`].
pub struct ScriptedGateway {
    provider: ProviderName,
    create: Mutex<NormalizedGatewayResponse>,
    status: Mutex<Option<GatewayPaymentState>>,
    refund: Mutex<NormalizedGatewayResponse>,
    delay: Mutex<Option<Duration>>,
    pub create_calls: AtomicUsize,
    pub refund_calls: AtomicUsize,
}

impl ScriptedGateway {
    pub fn accepting(provider: ProviderName) -> Arc<Self> {
        let mut create = NormalizedGatewayResponse::accepted(json!({ "resultCode": 0 }));
        create.pay_url = Some("https://pay.example.com/checkout".to_string());
        create.provider_transaction_id = Some("GW-CREATE-1".to_string());
        Arc::new(Self {
            provider,
            create: Mutex::new(create),
            status: Mutex::new(None),
            refund: Mutex::new(NormalizedGatewayResponse::accepted(json!({ "resultCode": 0 }))),
            delay: Mutex::new(None),
            create_calls: AtomicUsize::new(0),
            refund_calls: AtomicUsize::new(0),
        })
    }

    pub fn answer_create(&self, response: NormalizedGatewayResponse) {
        *self.create.lock().unwrap() = response;
    }

    pub fn answer_refund(&self, response: NormalizedGatewayResponse) {
        *self.refund.lock().unwrap() = response;
    }

    /// `None` makes status queries fail.
    pub fn answer_status(&self, state: Option<GatewayPaymentState>) {
        *self.status.lock().unwrap() = state;
    }

    pub fn delay_create(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn callback(order_id: &str, amount: i64, result_code: i64) -> JsonValue {
        json!({
            "orderId": order_id,
            "amount": amount,
            "resultCode": result_code,
            "message": if result_code == 0 { "Successful." } else { "Declined by issuer" },
            "transId": "GW-TXN-777",
            "signature": VALID_SIGNATURE,
        })
    }
}

#[async_trait]
impl PaymentGateway for ScriptedGateway {
    fn name(&self) -> ProviderName {
        self.provider
    }

    async fn create_payment_request(&self, _request: PaymentRequest) -> NormalizedGatewayResponse {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.create.lock().unwrap().clone()
    }

    async fn query_status(&self, _query: StatusQuery) -> PaymentResult<StatusResponse> {
        let state = *self.status.lock().unwrap();
        match state {
            Some(state) => Ok(StatusResponse {
                state,
                provider_transaction_id: Some("GW-QUERY-1".to_string()),
                result_code: Some(if state == GatewayPaymentState::Succeeded { 0 } else { 1006 }),
                message: Some(format!("{:?}", state)),
                raw_response: json!({ "state": format!("{:?}", state) }),
            }),
            None => Err(PaymentError::NetworkError {
                message: "connection reset".to_string(),
            }),
        }
    }

    async fn refund(&self, _request: RefundRequest) -> NormalizedGatewayResponse {
        self.refund_calls.fetch_add(1, Ordering::SeqCst);
        self.refund.lock().unwrap().clone()
    }

    fn verify_callback(
        &self,
        payload: &JsonValue,
        _header_signature: Option<&str>,
    ) -> CallbackVerification {
        if payload["signature"].as_str() == Some(VALID_SIGNATURE) {
            CallbackVerification::valid()
        } else {
            CallbackVerification::invalid("signature mismatch")
        }
    }

    fn parse_callback(&self, payload: &JsonValue) -> PaymentResult<CallbackEvent> {
        let order_id = payload["orderId"]
            .as_str()
            .ok_or_else(|| PaymentError::ValidationError {
                message: "orderId missing".to_string(),
                field: Some("orderId".to_string()),
            })?;
        Ok(CallbackEvent {
            provider: self.provider,
            order_id: order_id.to_string(),
            provider_transaction_id: payload["transId"].as_str().map(str::to_string),
            amount: payload["amount"].as_i64(),
            result_code: payload["resultCode"].as_i64().unwrap_or(-1),
            message: payload["message"].as_str().unwrap_or_default().to_string(),
            payload: payload.clone(),
            received_at: chrono::Utc::now().to_rfc3339(),
        })
    }
}

/// Keeps every notification so tests can count them.
#[derive(Default)]
pub struct RecordingNotifier {
    pub sent: Mutex<Vec<(Uuid, NotificationKind, JsonValue)>>,
}

impl RecordingNotifier {
    pub fn count(&self, kind: NotificationKind) -> usize {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, k, _)| *k == kind)
            .count()
    }
}

#[async_trait]
impl NotificationSink for RecordingNotifier {
    async fn notify(
        &self,
        customer_id: Uuid,
        kind: NotificationKind,
        payload: JsonValue,
    ) -> Result<(), NotificationError> {
        self.sent.lock().unwrap().push((customer_id, kind, payload));
        Ok(())
    }
}

pub struct Harness {
    pub store: InMemoryStore,
    pub notifier: Arc<RecordingNotifier>,
    pub orchestrator: Arc<PaymentOrchestrator>,
}

impl Harness {
    pub fn new(gateways: Vec<Arc<dyn PaymentGateway>>) -> Self {
        Self::with_config(gateways, RiskConfig::default(), OrchestratorConfig::default())
    }

    pub fn with_config(
        gateways: Vec<Arc<dyn PaymentGateway>>,
        risk: RiskConfig,
        config: OrchestratorConfig,
    ) -> Self {
        let store = InMemoryStore::new();
        let shared = Arc::new(store.clone());
        let notifier = Arc::new(RecordingNotifier::default());
        let sink: Arc<dyn NotificationSink> = notifier.clone();

        let orchestrator = PaymentOrchestrator::new(
            OrchestratorComponents {
                ledger: TransactionLedger::new(shared.clone()),
                risk: RiskEngine::new(shared.clone(), risk),
                fees: FeeCalculator::new(Arc::new(GatewayRegistry::default_catalog())),
                gateways: GatewayFactory::with_gateways(gateways),
                bookings: shared.clone(),
                scheduler: InstallmentScheduler::new(shared.clone(), shared, sink.clone()),
                notifier: sink,
            },
            config,
        );

        Self {
            store,
            notifier,
            orchestrator: Arc::new(orchestrator),
        }
    }

    /// Seeds a pending booking and returns `(customer_id, booking_id)`.
    pub async fn booking(&self, total: i64) -> (Uuid, Uuid) {
        self.booking_for(Uuid::new_v4(), total).await
    }

    pub async fn booking_for(&self, customer_id: Uuid, total: i64) -> (Uuid, Uuid) {
        let booking_id = Uuid::new_v4();
        self.store
            .seed_booking(BookingDetails {
                id: booking_id,
                total_amount: total,
                status: BookingStatus::Pending,
                owner_id: customer_id,
            })
            .await;
        (customer_id, booking_id)
    }
}

pub fn payment_request(booking_id: Uuid, amount: i64, method: ProviderName) -> CreatePaymentRequest {
    CreatePaymentRequest {
        booking_id,
        amount,
        method,
        order_info: None,
        context: AttemptContext::default(),
    }
}
