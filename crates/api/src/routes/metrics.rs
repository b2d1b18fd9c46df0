//! Prometheus metrics endpoint.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use domain::SagaStatus;
use saga_store::{SagaQuery, SagaStore};

use crate::AppState;

/// GET /metrics: returns Prometheus-formatted metrics.
///
/// Refreshes the `saga_active` gauge from the store before rendering.
pub async fn get<S: SagaStore + 'static>(
    State(state): State<Arc<AppState<S>>>,
) -> impl IntoResponse {
    for status in [SagaStatus::Started, SagaStatus::Compensating] {
        match state
            .orchestrator
            .list(SagaQuery::new().status(status))
            .await
        {
            Ok(sagas) => metrics::gauge!("saga_active", "status" => status.as_str())
                .set(sagas.len() as f64),
            Err(e) => tracing::warn!(error = %e, "could not count active sagas"),
        }
    }

    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.metrics.render(),
    )
}
