//! API server entry point.

use std::sync::Arc;

use api::AppState;
use api::config::Config;
use saga::create_order::OrderServices;
use saga_store::{InMemorySagaStore, PostgresSagaStore, SagaStore};
use sqlx::postgres::PgPoolOptions;
use tokio::signal;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

/// Stock and users for trying the built-in saga by hand.
fn seed_demo_data(services: &OrderServices) {
    for user in ["user-1", "user-2"] {
        services.users.register(user);
    }
    for sku in ["SKU-001", "SKU-002", "SKU-003"] {
        services.inventory.add_stock(sku, 100);
    }
}

/// Serves the API until a shutdown signal, then stops the sweeper.
async fn serve<S: SagaStore + 'static>(
    config: &Config,
    state: Arc<AppState<S>>,
    services: &OrderServices,
) {
    seed_demo_data(services);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = state
        .orchestrator
        .clone()
        .spawn_sweeper(config.sweep_interval, shutdown_rx);

    let app = api::create_app(state);
    let addr = config.addr();
    tracing::info!(%addr, "starting API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind address");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    let _ = shutdown_tx.send(true);
    if let Err(e) = sweeper.await {
        tracing::warn!(error = %e, "sweeper task ended abnormally");
    }
    tracing::info!("server shut down gracefully");
}

#[tokio::main]
async fn main() {
    let config = Config::from_env();

    // 1. Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // 2. Install Prometheus metrics recorder
    let prometheus_builder = metrics_exporter_prometheus::PrometheusBuilder::new();
    let metrics_handle = prometheus_builder
        .install_recorder()
        .expect("failed to install Prometheus recorder");

    // 3. Pick the saga store and build the orchestrator
    match &config.database_url {
        Some(url) => {
            let pool = PgPoolOptions::new()
                .max_connections(10)
                .connect(url)
                .await
                .expect("failed to connect to Postgres");
            let store = PostgresSagaStore::new(pool);
            store
                .run_migrations()
                .await
                .expect("failed to run migrations");
            tracing::info!("using Postgres saga store");

            let (state, services) = api::create_default_state(store, &config, metrics_handle)
                .expect("invalid saga registry");
            serve(&config, state, &services).await;
        }
        None => {
            tracing::info!("using in-memory saga store");
            let (state, services) =
                api::create_default_state(InMemorySagaStore::new(), &config, metrics_handle)
                    .expect("invalid saga registry");
            serve(&config, state, &services).await;
        }
    }
}
