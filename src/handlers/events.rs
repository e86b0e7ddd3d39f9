use axum::{Json, extract::State, http::StatusCode};
use chrono::Utc;

use crate::{
    error::ApiError,
    extractors::{ValidJson, ValidPath},
    ingest::ingest_event,
    state::AppState,
    store::ProjectRepository,
    types::{IngestEventRequest, IngestEventResponse},
};

pub async fn ingest_event_handler(
    State(state): State<AppState>,
    ValidPath(project_id): ValidPath<String>,
    ValidJson(req): ValidJson<IngestEventRequest>,
) -> Result<(StatusCode, Json<IngestEventResponse>), ApiError> {
    if req.event_type.trim().is_empty() {
        return Err(ApiError::BadRequest("event_type is required".to_string()));
    }
    // fails with 404 before anything is written for an unknown project
    state.store.circuit_breaker_config(&project_id).await?;

    let response = ingest_event(
        &state.store,
        &state.store,
        &state.store,
        &project_id,
        req,
        Utc::now(),
    )
    .await?;

    Ok((StatusCode::ACCEPTED, Json(response)))
}
