use axum::{Json, extract::State};

use crate::{
    error::ApiError,
    extractors::ValidJson,
    state::AppState,
    types::{LeaseRequest, LeaseResponse, ReportRequest, ReportResponse},
};

pub async fn lease_handler(
    State(state): State<AppState>,
    ValidJson(req): ValidJson<LeaseRequest>,
) -> Result<Json<LeaseResponse>, ApiError> {
    validate_request(&req)?;

    let response = state.dispatcher.lease(&req).await?;

    Ok(Json(response))
}

pub async fn report_handler(
    State(state): State<AppState>,
    ValidJson(req): ValidJson<ReportRequest>,
) -> Result<Json<ReportResponse>, ApiError> {
    validate_report_request(&req)?;

    let response = state.dispatcher.report(&req).await?;

    Ok(Json(response))
}

fn validate_request(req: &LeaseRequest) -> Result<(), ApiError> {
    if req.limit <= 0 {
        return Err(ApiError::BadRequest("limit must be > 0".to_string()));
    }
    if req.lease_ms <= 0 {
        return Err(ApiError::BadRequest("lease_ms must be > 0".to_string()));
    }
    if req.worker_id.trim().is_empty() {
        return Err(ApiError::BadRequest("worker_id is required".to_string()));
    }

    Ok(())
}

fn validate_report_request(req: &ReportRequest) -> Result<(), ApiError> {
    if req.worker_id.trim().is_empty() {
        return Err(ApiError::BadRequest("worker_id is required".to_string()));
    }
    if req.attempt.finished_at < req.attempt.started_at {
        return Err(ApiError::BadRequest(
            "attempt finished_at must be >= started_at".to_string(),
        ));
    }
    if req.success && req.attempt.error.is_some() {
        return Err(ApiError::BadRequest(
            "a successful attempt cannot carry an error".to_string(),
        ));
    }
    Ok(())
}
