//! remitflow - Cross-border settlement and wallet ledger core
//!
//! Settles provider payment events exactly once against multi-currency
//! wallets, with an append-only ledger and settlement-time rate stamping.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use sqlx::postgres::PgPoolOptions;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use remitflow::api::{self, AppState};
use remitflow::idempotency::IdempotencyLedger;
use remitflow::rates::{ExchangeRateCache, StaticRateProvider};
use remitflow::store::{PgStore, SettlementStore};
use remitflow::wallet::BalanceStore;
use remitflow::{Config, CurrencyCode, SettlementPolicy, SettlementReconciler};

const MAINTENANCE_PERIOD: Duration = Duration::from_secs(60);

/// Initialize tracing/logging
fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "remitflow=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Wire the settlement components onto a store and build the router.
fn build_app(store: Arc<dyn SettlementStore>, config: &Config) -> Result<Router, anyhow::Error> {
    let mut table = Vec::new();
    for (base, quote, rate) in &config.rates {
        let base = CurrencyCode::new(base)?;
        let quote = CurrencyCode::new(quote)?;
        table.push((base, quote, *rate));
    }
    let provider = Arc::new(StaticRateProvider::with_rates("pinned", table));

    let rates = Arc::new(ExchangeRateCache::new(
        provider,
        store.clone(),
        chrono::Duration::seconds(config.rate_validity_secs),
        chrono::Duration::seconds(config.rate_stale_tolerance_secs),
    ));

    let balances = BalanceStore::new(store.clone());
    let idempotency = IdempotencyLedger::new(store.clone());
    let policy = SettlementPolicy {
        max_balance_retries: config.settlement_max_retries,
        reject_stale_rates: config.reject_stale_rates,
        idempotency_ttl: chrono::Duration::hours(config.idempotency_ttl_hours),
        ..SettlementPolicy::default()
    };
    let reconciler = Arc::new(SettlementReconciler::new(
        balances.clone(),
        idempotency,
        rates,
        policy,
    ));

    let state = AppState {
        store,
        balances,
        reconciler,
    };

    Ok(Router::new()
        .route("/health", axum::routing::get(health_check))
        .nest("/api/v1", api::create_router())
        .layer(TraceLayer::new_for_http())
        .with_state(state))
}

/// Health check endpoint
async fn health_check() -> &'static str {
    "OK"
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize tracing
    init_tracing();

    // Load configuration
    let config = Config::from_env()?;
    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;

    tracing::info!("Starting remitflow server");
    tracing::info!("Connecting to database...");

    // Create database pool
    let pool = PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .connect(&config.database_url)
        .await?;

    // Verify database connectivity and schema
    remitflow::db::verify_connection(&pool).await?;
    if !remitflow::db::check_schema(&pool).await? {
        tracing::error!("Database schema is not complete. Please run migrations.");
        return Err(anyhow::anyhow!("Database schema incomplete"));
    }

    tracing::info!("Database connected successfully");
    tracing::info!("Listening on http://{}", addr);

    let store: Arc<dyn SettlementStore> = Arc::new(PgStore::new(pool.clone()));

    // Background maintenance: re-arm crashed settlements, prune expired data
    let maintenance = remitflow::jobs::spawn_maintenance(store.clone(), MAINTENANCE_PERIOD);

    // Build router and start server
    let app = build_app(store, &config)?;

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Cleanup
    tracing::info!("Server shutting down...");
    maintenance.abort();
    pool.close().await;
    tracing::info!("Database connections closed. Goodbye!");

    Ok(())
}

/// Shutdown signal handler for graceful shutdown
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => tracing::error!(error = %e, "Failed to install signal handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown...");
        },
    }
}
