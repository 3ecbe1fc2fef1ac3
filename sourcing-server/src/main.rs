use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{error, info, Level};

use sourcing_core::{
    ACCOUNTING_PROCESSING_QUEUE, ACCOUNTING_WITHDRAWN_QUEUE, DATA_SOURCING_SET_TO_NON_SOURCEABLE,
    NON_SOURCEABLE_NOTIFICATION_QUEUE,
};
use sourcing_server::admin::operator_router;
use sourcing_server::config::Config;
use sourcing_server::messaging::{Consumer, InMemoryBroker};
use sourcing_server::notifier::NonSourceableNotifier;
use sourcing_server::reconciler::BillingReconciler;
use sourcing_server::repository::SqliteRepository;
use sourcing_server::roles::HttpRoleResolver;
use sourcing_server::{AppState, CreditsLedger, SourcingEngine};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    info!("Starting sourcing server {}", sourcing_server::version());

    let config = Config::from_env().context("Failed to load configuration from environment")?;

    let db_path = config.database_path();
    info!("Using state database: {}", db_path.display());
    let repo = Arc::new(
        SqliteRepository::new(&db_path).context("Failed to initialize SQLite database")?,
    );

    let broker = Arc::new(InMemoryBroker::new());
    let engine = Arc::new(SourcingEngine::new(repo.clone(), broker.clone()));

    // Messages no consumer settled before the last shutdown. Relayed before
    // the consumer starts so they keep their place ahead of new traffic.
    match engine.relay_pending_outbox().await {
        Ok(0) => {}
        Ok(relayed) => info!("Relayed {} pending outbox messages", relayed),
        Err(e) => error!("Failed to relay pending outbox messages: {}", e),
    }

    let resolver = Arc::new(
        HttpRoleResolver::new(config.role_service_url.clone())
            .context("Failed to build role service client")?,
    );
    let reconciler = Arc::new(BillingReconciler::new(
        resolver,
        repo.clone(),
        config.billing_excluded_frameworks.clone(),
    ));
    let dispatcher = reconciler.dispatcher().bind(
        DATA_SOURCING_SET_TO_NON_SOURCEABLE,
        Arc::new(NonSourceableNotifier),
    );
    let consumer = Arc::new(Consumer::new(
        broker.clone(),
        dispatcher,
        repo.clone(),
        repo.clone(),
        config.max_deliveries,
    ));
    // One consumer for every queue, so messages are handled in publish order.
    let queues = [
        ACCOUNTING_PROCESSING_QUEUE,
        ACCOUNTING_WITHDRAWN_QUEUE,
        NON_SOURCEABLE_NOTIFICATION_QUEUE,
    ]
    .map(str::to_string)
    .to_vec();
    tokio::spawn(consumer.run(queues));

    if config.status_auth_token.is_none() {
        info!("STATUS_AUTH_TOKEN not set, operator API is disabled");
    }

    let app_state = Arc::new(AppState {
        engine,
        ledger: Arc::new(CreditsLedger::new(repo.clone(), config.data_sourcing_cost)),
        dead_letters: repo,
        status_auth_token: config.status_auth_token.clone(),
    });

    let app = operator_router()
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(app_state);

    let listener = TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;
    info!("Server listening on port {}", config.port);

    axum::serve(listener, app).await?;

    Ok(())
}
