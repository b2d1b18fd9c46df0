//! HTTP API for the saga orchestrator.
//!
//! Exposes saga start, status, cancel, retry and journal endpoints, with
//! structured logging (tracing) and Prometheus metrics.

pub mod config;
pub mod error;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use common::SystemClock;
use metrics_exporter_prometheus::PrometheusHandle;
use saga::create_order::{self, OrderFaults, OrderServices};
use saga::{Orchestrator, OrchestratorConfig, Registry};
use saga_store::SagaStore;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use config::Config;

/// Shared application state accessible from all handlers.
pub struct AppState<S> {
    pub orchestrator: Arc<Orchestrator<S>>,
    pub metrics: PrometheusHandle,
}

/// Creates the Axum application router with all routes and shared state.
pub fn create_app<S: SagaStore + 'static>(state: Arc<AppState<S>>) -> Router {
    Router::new()
        .route("/health", get(routes::health::check::<S>))
        .route("/metrics", get(routes::metrics::get::<S>))
        .route(
            "/sagas",
            post(routes::sagas::start::<S>).get(routes::sagas::list::<S>),
        )
        .route("/sagas/{id}", get(routes::sagas::get::<S>))
        .route("/sagas/{id}/cancel", post(routes::sagas::cancel::<S>))
        .route("/sagas/{id}/retry", post(routes::sagas::retry::<S>))
        .route("/sagas/{id}/events", get(routes::sagas::events::<S>))
        .with_state(state)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

/// Builds application state around an orchestrator using the system clock.
pub fn create_state<S: SagaStore + 'static>(
    store: S,
    registry: Registry,
    config: OrchestratorConfig,
    metrics: PrometheusHandle,
) -> Arc<AppState<S>> {
    let orchestrator = Orchestrator::new(store, Arc::new(registry), Arc::new(SystemClock), config);
    Arc::new(AppState {
        orchestrator: Arc::new(orchestrator),
        metrics,
    })
}

/// Loads the registry file named in the configuration, or the built-in
/// `create_order` saga when none is set. File entries resolve their action
/// names against the demo service catalog.
pub fn load_registry(
    config: &Config,
    services: &OrderServices,
    faults: &OrderFaults,
) -> saga::Result<Registry> {
    match &config.registry_path {
        Some(path) => {
            let catalog = create_order::catalog(services, faults);
            tracing::info!(path = %path.display(), "loading saga registry");
            Registry::load(path, &catalog)
        }
        None => create_order::registry(services, faults),
    }
}

/// Creates the default application state with the demo services.
pub fn create_default_state<S: SagaStore + 'static>(
    store: S,
    config: &Config,
    metrics: PrometheusHandle,
) -> saga::Result<(Arc<AppState<S>>, OrderServices)> {
    let services = OrderServices::new();
    let registry = load_registry(config, &services, &OrderFaults::default())?;
    let state = create_state(store, registry, config.orchestrator(), metrics);
    Ok((state, services))
}
