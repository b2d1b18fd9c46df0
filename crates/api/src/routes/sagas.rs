//! Saga trigger, query and operator endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use common::SagaId;
use domain::{Aggregate, SagaStatus};
use saga::{CancelOptions, SagaDetail};
use saga_store::{EventEnvelope, SagaQuery, SagaStore};
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::error::ApiError;

// -- Request types --

#[derive(Debug, Deserialize)]
pub struct StartSagaRequest {
    pub saga_type: String,
    #[serde(default)]
    pub data: serde_json::Value,
    /// Drive the saga to a terminal status before responding.
    #[serde(default)]
    pub wait: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListParams {
    /// Comma-separated status names.
    pub status: Option<String>,
    pub saga_type: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CancelParams {
    #[serde(default)]
    pub compensate: bool,
}

// -- Response types --

#[derive(Debug, Serialize)]
pub struct SagaStartedResponse {
    pub saga_id: SagaId,
    pub status: SagaStatus,
}

fn parse_id(id: &str) -> Result<SagaId, ApiError> {
    SagaId::parse(id).map_err(|e| ApiError::BadRequest(format!("Invalid saga id: {e}")))
}

fn parse_statuses(raw: &str) -> Result<Vec<SagaStatus>, ApiError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            SagaStatus::parse(s).ok_or_else(|| ApiError::BadRequest(format!("Unknown status: {s}")))
        })
        .collect()
}

// -- Handlers --

/// POST /sagas: start a saga of a registered type.
///
/// Responds `202 Accepted` once the saga is stored, or `200 OK` with the
/// terminal status when `wait` is set.
#[tracing::instrument(skip(state, req), fields(saga_type = %req.saga_type))]
pub async fn start<S: SagaStore + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Json(req): Json<StartSagaRequest>,
) -> Result<(StatusCode, Json<SagaStartedResponse>), ApiError> {
    let (code, saga) = if req.wait {
        let saga = state
            .orchestrator
            .execute_saga(&req.saga_type, req.data)
            .await?;
        (StatusCode::OK, saga)
    } else {
        let saga = state
            .orchestrator
            .start_saga(&req.saga_type, req.data)
            .await?;
        (StatusCode::ACCEPTED, saga)
    };

    Ok((
        code,
        Json(SagaStartedResponse {
            saga_id: saga.id(),
            status: saga.status(),
        }),
    ))
}

/// GET /sagas: list sagas, optionally filtered.
pub async fn list<S: SagaStore + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<SagaDetail>>, ApiError> {
    let mut query = SagaQuery::new();
    if let Some(raw) = &params.status {
        query = query.statuses(parse_statuses(raw)?);
    }
    if let Some(saga_type) = params.saga_type {
        query = query.saga_type(saga_type);
    }
    if let Some(limit) = params.limit {
        query = query.limit(limit);
    }
    if let Some(offset) = params.offset {
        query = query.offset(offset);
    }

    let sagas = state.orchestrator.list(query).await?;
    Ok(Json(sagas.iter().map(SagaDetail::from).collect()))
}

/// GET /sagas/{id}: status with per-step detail.
pub async fn get<S: SagaStore + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
) -> Result<Json<SagaDetail>, ApiError> {
    let saga_id = parse_id(&id)?;
    Ok(Json(state.orchestrator.get_status(saga_id).await?))
}

/// POST /sagas/{id}/cancel: cancel a started saga; `?compensate=true`
/// also rolls back completed steps.
#[tracing::instrument(skip(state))]
pub async fn cancel<S: SagaStore + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
    Query(params): Query<CancelParams>,
) -> Result<Json<SagaDetail>, ApiError> {
    let saga_id = parse_id(&id)?;
    let options = CancelOptions {
        compensate: params.compensate,
    };
    let saga = state.orchestrator.cancel(saga_id, options).await?;
    Ok(Json(SagaDetail::from(&saga)))
}

/// POST /sagas/{id}/retry: restart a failed or compensated saga.
#[tracing::instrument(skip(state))]
pub async fn retry<S: SagaStore + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
) -> Result<Json<SagaDetail>, ApiError> {
    let saga_id = parse_id(&id)?;
    let saga = state.orchestrator.retry(saga_id).await?;
    Ok(Json(SagaDetail::from(&saga)))
}

/// GET /sagas/{id}/events: the saga's journal.
pub async fn events<S: SagaStore + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
) -> Result<Json<Vec<EventEnvelope>>, ApiError> {
    let saga_id = parse_id(&id)?;
    Ok(Json(state.orchestrator.events(saga_id).await?))
}
