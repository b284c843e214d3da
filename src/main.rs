use std::sync::Arc;

use homestay_payments::api::{self, AppState};
use homestay_payments::config::AppConfig;
use homestay_payments::database::repository::{
    BookingDirectory, InstallmentRepository, LedgerRepository, RiskHistoryRepository,
};
use homestay_payments::database::{
    init_pool_from_config, run_migrations, InMemoryStore, PgBookingDirectory,
    PgInstallmentRepository, PgLedgerRepository,
};
use homestay_payments::health::HealthChecker;
use homestay_payments::logging::init_tracing;
use homestay_payments::middleware::logging::{request_logging_middleware, UuidRequestId};
use homestay_payments::payments::factory::GatewayFactory;
use homestay_payments::services::{
    FeeCalculator, InstallmentScheduler, LogNotificationSink, NotificationSink,
    OrchestratorComponents, PaymentOrchestrator, ReconciliationService, RiskEngine,
    TransactionLedger, WebhookProcessor,
};
use homestay_payments::workers::installment_sweep::InstallmentSweepWorker;
use homestay_payments::workers::reconciliation::ReconciliationWorker;
use sqlx::PgPool;
use tokio::signal;
use tokio::sync::watch;
use tower::ServiceBuilder;
use tower_http::request_id::{PropagateRequestIdLayer, SetRequestIdLayer};
use tracing::{error, info};

/// Storage adapters behind the repository traits.
struct Stores {
    ledger: Arc<dyn LedgerRepository>,
    risk_history: Arc<dyn RiskHistoryRepository>,
    schedules: Arc<dyn InstallmentRepository>,
    bookings: Arc<dyn BookingDirectory>,
}

impl Stores {
    fn postgres(pool: PgPool) -> Self {
        let ledger = Arc::new(PgLedgerRepository::new(pool.clone()));
        Self {
            ledger: ledger.clone(),
            risk_history: ledger,
            schedules: Arc::new(PgInstallmentRepository::new(pool.clone())),
            bookings: Arc::new(PgBookingDirectory::new(pool)),
        }
    }

    fn in_memory() -> Self {
        let store = Arc::new(InMemoryStore::new());
        Self {
            ledger: store.clone(),
            risk_history: store.clone(),
            schedules: store.clone(),
            bookings: store,
        }
    }
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, starting graceful shutdown");
}

async fn shutdown_signal_with_notify(shutdown_tx: watch::Sender<bool>) {
    shutdown_signal().await;
    let _ = shutdown_tx.send(true);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env()?;
    init_tracing(&config.logging)?;
    config.validate().map_err(|e| {
        error!(error = %e, "Invalid configuration");
        e
    })?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        bind_address = %config.server.bind_address(),
        "🚀 Starting homestay payment service"
    );

    let (db_pool, stores) = match &config.database {
        Some(database) if !config.skip_externals => {
            info!("📊 Initializing database connection pool...");
            let pool = init_pool_from_config(database).await.map_err(|e| {
                error!("Failed to initialize database pool: {}", e);
                e
            })?;
            info!(
                max_connections = pool.options().get_max_connections(),
                "✅ Database connection pool initialized"
            );
            if config.run_migrations {
                run_migrations(&pool).await?;
            }
            (Some(pool.clone()), Stores::postgres(pool))
        }
        _ => {
            info!("⏭️  Using in-memory store (SKIP_EXTERNALS=true)");
            (None, Stores::in_memory())
        }
    };

    let gateways = GatewayFactory::from_config(config.gateways.providers.clone())?;
    info!(
        providers = ?gateways.list_available(),
        "✅ Payment gateways initialized"
    );

    let notifier: Arc<dyn NotificationSink> = Arc::new(LogNotificationSink::new());
    let scheduler =
        InstallmentScheduler::new(stores.schedules, stores.bookings.clone(), notifier.clone());
    let orchestrator = Arc::new(PaymentOrchestrator::new(
        OrchestratorComponents {
            ledger: TransactionLedger::new(stores.ledger),
            risk: RiskEngine::new(stores.risk_history, config.risk.clone()),
            fees: FeeCalculator::new(Arc::new(config.gateways.registry())),
            gateways: gateways.clone(),
            bookings: stores.bookings,
            scheduler: scheduler.clone(),
            notifier,
        },
        config.orchestrator.clone(),
    ));

    // Background workers share one shutdown channel with the HTTP server
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let reconciliation_config = config.workers.reconciliation.clone();
    let reconciliation = Arc::new(ReconciliationService::new(
        orchestrator.clone(),
        reconciliation_config.policy(),
    ));
    let reconciliation_handle = tokio::spawn(
        ReconciliationWorker::new(reconciliation, reconciliation_config).run(shutdown_rx.clone()),
    );
    let sweep_handle = tokio::spawn(
        InstallmentSweepWorker::new(scheduler, config.workers.installment_sweep.clone())
            .run(shutdown_rx),
    );

    let state = AppState {
        orchestrator: orchestrator.clone(),
        webhooks: Arc::new(WebhookProcessor::new(orchestrator)),
        health: HealthChecker::new(db_pool, Arc::new(gateways)),
    };

    let app = api::router(state).layer(
        ServiceBuilder::new()
            .layer(SetRequestIdLayer::x_request_id(UuidRequestId))
            .layer(PropagateRequestIdLayer::x_request_id())
            .layer(axum::middleware::from_fn(request_logging_middleware)),
    );

    let listener = tokio::net::TcpListener::bind(config.server.bind_address()).await?;
    info!(address = %config.server.bind_address(), "🛣️  Listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal_with_notify(shutdown_tx))
        .await?;

    for handle in [reconciliation_handle, sweep_handle] {
        if let Err(e) = handle.await {
            error!(error = %e, "worker task ended abnormally");
        }
    }
    info!("Server shut down");
    Ok(())
}
