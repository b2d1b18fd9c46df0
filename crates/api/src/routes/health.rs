//! Health check endpoint.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use saga_store::{SagaQuery, SagaStore};
use serde::Serialize;

use crate::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub saga_types: Vec<String>,
}

/// GET /health: reports whether the saga store answers queries.
pub async fn check<S: SagaStore + 'static>(
    State(state): State<Arc<AppState<S>>>,
) -> (StatusCode, Json<HealthResponse>) {
    let saga_types = state
        .orchestrator
        .registry()
        .saga_types()
        .into_iter()
        .map(str::to_string)
        .collect();

    match state.orchestrator.list(SagaQuery::new().limit(1)).await {
        Ok(_) => (
            StatusCode::OK,
            Json(HealthResponse {
                status: "ok",
                saga_types,
            }),
        ),
        Err(e) => {
            tracing::warn!(error = %e, "health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(HealthResponse {
                    status: "degraded",
                    saga_types,
                }),
            )
        }
    }
}
