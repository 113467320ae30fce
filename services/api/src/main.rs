use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{compression::CompressionLayer, cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use bithedge_api::{
    cache::RedisCache,
    chain::{events::EventProcessor, signer::Signer, tx::TransactionEngine, ChainClient},
    config::Config,
    db::Database,
    handlers,
    metrics::Metrics,
    oracle::{
        aggregator::Aggregator, ingestor::PriceIngestor, submitter::OracleSubmitter,
        volatility::VolatilityEngine,
    },
    policies::{
        expiration::ExpirationScheduler, premium::PremiumDistributor, OrchestratorEventHandler,
        PolicyOrchestrator,
    },
    pool::Allocator,
    quotes::QuoteEngine,
    AppState,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    let metrics = Metrics::new()?;
    let cache = RedisCache::new(&config.redis_url).await?;
    let db = Database::new(&config.database_url, cache.clone(), metrics.clone()).await?;
    let chain = ChainClient::new(&config, cache.clone(), metrics.clone())?;

    let signer = Arc::new(Signer::from_hex(
        &config.signer_private_key,
        config.network,
    )?);
    tracing::info!(
        network = config.network.name(),
        sender = signer.address(),
        "backend signer loaded"
    );

    let engine = TransactionEngine::new(
        chain.clone(),
        db.clone(),
        signer,
        metrics.clone(),
        config.network,
    );

    let allocator = Allocator::new(db.clone());
    let quotes = QuoteEngine::new(db.clone(), config.risk_params, config.risk_free_rate);
    let distributor = PremiumDistributor::new(
        db.clone(),
        engine.clone(),
        config.liquidity_pool_contract.clone(),
    );
    let orchestrator = Arc::new(PolicyOrchestrator::new(
        db.clone(),
        chain.clone(),
        engine.clone(),
        allocator.clone(),
        quotes.clone(),
        distributor,
        metrics.clone(),
        &config,
    ));

    // Background subsystems. Each owns its interval; all die with the
    // process and resume from persistent state on restart.
    let ingestor = PriceIngestor::new(
        db.clone(),
        metrics.clone(),
        config.price_feeds.clone(),
        config.http_timeout,
    )?;
    tokio::spawn(ingestor.run(config.ingest_interval));

    let aggregator = Aggregator::new(db.clone(), metrics.clone(), config.aggregation_deadline);
    tokio::spawn(aggregator.run(config.aggregate_interval));

    let volatility = VolatilityEngine::new(db.clone(), metrics.clone());
    tokio::spawn(volatility.run(config.volatility_interval));

    let submitter = OracleSubmitter::new(
        db.clone(),
        chain.clone(),
        engine.clone(),
        metrics.clone(),
        config.thresholds,
        config.oracle_contract.clone(),
    );
    tokio::spawn(submitter.run(config.submitter_interval));

    let expiration = ExpirationScheduler::new(
        db.clone(),
        chain.clone(),
        engine.clone(),
        config.policy_registry_contract.clone(),
        config.liquidity_pool_contract.clone(),
        config.expiration_batch_size,
    );
    tokio::spawn(expiration.run(config.expiration_interval));

    let mut processor = EventProcessor::new(
        db.clone(),
        chain.clone(),
        metrics.clone(),
        vec![
            config.policy_registry_contract.clone(),
            config.liquidity_pool_contract.clone(),
        ],
        config.event_page_limit,
        config.event_lag_slo,
    );
    let handler = Arc::new(OrchestratorEventHandler(orchestrator.clone()));
    for topic in [
        "policy-created",
        "policy-status-updated",
        "premium-distributed",
        "funds-deposited",
        "collateral-locked",
    ] {
        processor.register(topic, handler.clone());
    }
    tokio::spawn(processor.run(config.event_poll_interval));

    tokio::spawn(engine.clone().run_status_poller(config.tx_poll_interval));

    let bind_addr = config.bind_addr;
    let state = Arc::new(AppState {
        config,
        db,
        metrics,
        quotes,
        engine,
        orchestrator,
    });

    if let Err(err) = handlers::warm_critical_caches(state.clone()).await {
        tracing::warn!("cache warming skipped: {err}");
    }

    let app = Router::new()
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics))
        .route("/api/v1/quotes/buyer", post(handlers::buyer_premium_quote))
        .route(
            "/api/v1/quotes/provider",
            post(handlers::provider_yield_quote),
        )
        .route("/api/v1/policies", post(handlers::create_policy))
        .route("/api/v1/policies/:policy_id", get(handlers::get_policy))
        .route("/api/v1/pool/commit", post(handlers::commit_capital))
        .route("/api/v1/pool/withdraw", post(handlers::withdraw_capital))
        .route(
            "/api/v1/pool/providers/:address/balances",
            get(handlers::list_provider_balances),
        )
        .route(
            "/api/v1/transactions/:convex_id",
            get(handlers::transaction_status),
        )
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive())
                .layer(CompressionLayer::new()),
        )
        .with_state(state);

    let listener = TcpListener::bind(bind_addr).await?;
    tracing::info!("API listening on {bind_addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await?;

    Ok(())
}
