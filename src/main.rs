use marketplace_settlement::api::{self, health::HealthChecker};
use marketplace_settlement::config::{AppConfig, Environment};
use marketplace_settlement::database::{
    self,
    balance_repository::{BalanceStore, PgBalanceRepository},
    contract_repository::{ContractDirectory, PgContractRepository},
    failed_balance_repository::{FailedBalanceStore, PgFailedBalanceRepository},
    ledger_repository::{LedgerStore, PgLedgerRepository},
    memory::{
        InMemoryBalanceStore, InMemoryContractDirectory, InMemoryFailedBalanceStore,
        InMemoryLedgerStore, InMemoryPaymentStore, InMemoryWebhookEventStore,
    },
    payment_repository::{PaymentStore, PgPaymentRepository},
    settlement::{BestEffortSettlement, PgSettlementStore, SettlementStore},
    webhook_repository::{PgWebhookEventRepository, WebhookEventStore},
};
use marketplace_settlement::logging::init_tracing;
use marketplace_settlement::payments::{
    HttpGateway, HttpGatewayConfig, InMemoryGateway, PaymentGateway, WebhookVerifier,
};
use marketplace_settlement::services::{
    BalanceUpdater, LedgerService, LogNotifier, Notifier, PaymentService, PaymentServiceConfig,
    PaymentServiceDeps, WebhookProcessor,
};
use marketplace_settlement::workers::ReconciliationWorker;
use sqlx::PgPool;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Storage and gateway adapters, Postgres-backed or in-memory
struct Backends {
    pool: Option<PgPool>,
    payments: Arc<dyn PaymentStore>,
    ledger: Arc<dyn LedgerStore>,
    events: Arc<dyn WebhookEventStore>,
    failed_updates: Arc<dyn FailedBalanceStore>,
    balances: Arc<dyn BalanceStore>,
    contracts: Arc<dyn ContractDirectory>,
    gateway: Arc<dyn PaymentGateway>,
}

async fn connect_backends(config: &AppConfig) -> anyhow::Result<Backends> {
    let Some(db_config) = &config.database else {
        info!("⏭️  Using in-memory stores and gateway (SKIP_EXTERNALS=true)");
        return Ok(Backends {
            pool: None,
            payments: Arc::new(InMemoryPaymentStore::new()),
            ledger: Arc::new(InMemoryLedgerStore::new()),
            events: Arc::new(InMemoryWebhookEventStore::new()),
            failed_updates: Arc::new(InMemoryFailedBalanceStore::new()),
            balances: Arc::new(InMemoryBalanceStore::new()),
            contracts: Arc::new(InMemoryContractDirectory::new()),
            gateway: Arc::new(InMemoryGateway::new()),
        });
    };

    info!("📊 Initializing database connection pool...");
    let pool = database::init_pool_from_config(db_config)
        .await
        .map_err(|e| {
            error!(error = %e, "Failed to initialize database pool");
            e
        })?;
    database::run_migrations(&pool).await?;
    info!(
        max_connections = pool.options().get_max_connections(),
        "✅ Database connection pool initialized"
    );

    let gateway = HttpGateway::new(HttpGatewayConfig {
        base_url: config.gateway.base_url.clone(),
        secret_key: config.gateway.secret_key.clone(),
        timeout: config.gateway.timeout(),
        max_retries: config.gateway.max_retries,
    })?;

    Ok(Backends {
        payments: Arc::new(PgPaymentRepository::new(pool.clone())),
        ledger: Arc::new(PgLedgerRepository::new(pool.clone())),
        events: Arc::new(PgWebhookEventRepository::new(pool.clone())),
        failed_updates: Arc::new(PgFailedBalanceRepository::new(pool.clone())),
        balances: Arc::new(PgBalanceRepository::new(pool.clone())),
        contracts: Arc::new(PgContractRepository::new(pool.clone())),
        gateway: Arc::new(gateway),
        pool: Some(pool),
    })
}

fn webhook_verifier(config: &AppConfig) -> anyhow::Result<WebhookVerifier> {
    let verifier = WebhookVerifier::new(
        config.gateway.webhook_secret.clone(),
        config.gateway.webhook_tolerance(),
    )?;
    if !verifier.is_enforcing() && config.runtime.environment == Environment::Production {
        anyhow::bail!("webhook signature verification cannot be disabled in production");
    }
    Ok(verifier)
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
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
                error!(error = %e, "Failed to install SIGTERM handler");
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
    dotenv::dotenv().ok();

    let config = AppConfig::from_env()?;
    init_tracing(&config.logging);
    config.validate()?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        environment = ?config.runtime.environment,
        "🚀 Starting settlement service"
    );

    let backends = connect_backends(&config).await?;
    let verifier = webhook_verifier(&config)?;

    let notifier: Arc<dyn Notifier> = Arc::new(LogNotifier::new());
    let balance_updater =
        BalanceUpdater::new(backends.balances.clone(), backends.failed_updates.clone());

    let best_effort = BestEffortSettlement::new(
        backends.payments.clone(),
        backends.ledger.clone(),
        backends.contracts.clone(),
        balance_updater.clone(),
    );
    let settlement: Arc<dyn SettlementStore> = match &backends.pool {
        Some(pool) => Arc::new(PgSettlementStore::new(
            pool.clone(),
            config.settlement.use_transactions,
            best_effort,
        )),
        None => {
            warn!("Settlement writes are sequential without a database transaction");
            Arc::new(best_effort)
        }
    };

    let payment_service = PaymentService::new(
        PaymentServiceDeps {
            payments: backends.payments.clone(),
            ledger: backends.ledger.clone(),
            contracts: backends.contracts.clone(),
            gateway: backends.gateway.clone(),
            settlement,
            balances: balance_updater.clone(),
            notifier: notifier.clone(),
        },
        PaymentServiceConfig {
            gateway_timeout: config.gateway.timeout(),
            default_currency: config.settlement.default_currency.clone(),
        },
    );

    let processor = Arc::new(WebhookProcessor::new(
        verifier,
        backends.events.clone(),
        payment_service.clone(),
        LedgerService::new(backends.ledger.clone()),
        notifier.clone(),
    ));

    let (worker_shutdown_tx, worker_shutdown_rx) = watch::channel(false);
    let worker = ReconciliationWorker::new(
        backends.payments.clone(),
        backends.failed_updates.clone(),
        payment_service,
        balance_updater,
        notifier,
        config.scheduler.clone(),
    );
    let worker_handle = tokio::spawn(worker.run(worker_shutdown_rx));

    let health_checker = HealthChecker::new(
        backends.pool.clone(),
        backends.failed_updates.clone(),
        config.scheduler.failed_updates_alert_threshold,
    );
    let app = api::router(processor, health_checker);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        error!("❌ Failed to bind to address {}: {}", addr, e);
        e
    })?;

    info!(address = %addr, "🚀 Server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal_with_notify(worker_shutdown_tx.clone()))
        .await?;

    let _ = worker_shutdown_tx.send(true);
    if tokio::time::timeout(Duration::from_secs(5), worker_handle)
        .await
        .is_err()
    {
        error!("Timed out waiting for reconciliation worker shutdown");
    }

    info!("👋 Server shutdown complete");

    Ok(())
}
