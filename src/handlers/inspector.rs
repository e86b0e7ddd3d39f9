use axum::{Json, extract::State};
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    error::ApiError,
    extractors::{ValidPath, ValidQuery},
    inspector::{DeliveryCursor, ListDeliveriesParams},
    state::AppState,
    store::EventDeliveryRepository,
    types::{DeliveryStatus, ListAttemptsResponse, ListDeliveriesResponse},
};

#[derive(Debug, Deserialize)]
pub struct ListDeliveriesQuery {
    limit: Option<i64>,
    before: Option<String>,
    status: Option<String>,
    project_id: Option<String>,
    endpoint_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CursorPayload {
    created_at: DateTime<Utc>,
    id: Uuid,
}

pub async fn list_deliveries_handler(
    State(state): State<AppState>,
    ValidQuery(query): ValidQuery<ListDeliveriesQuery>,
) -> Result<Json<ListDeliveriesResponse>, ApiError> {
    let limit = parse_limit(query.limit)?;
    let before = query.before.as_deref().map(decode_cursor).transpose()?;
    let status = query
        .status
        .as_deref()
        .map(|raw| {
            raw.parse::<DeliveryStatus>()
                .map_err(|_| ApiError::BadRequest("status is invalid".to_string()))
        })
        .transpose()?;

    let params = ListDeliveriesParams {
        limit,
        before,
        status,
        project_id: non_empty("project_id", query.project_id)?,
        endpoint_id: non_empty("endpoint_id", query.endpoint_id)?,
    };

    let page = state.store.list(&params).await?;
    let next_before = page.next_before.as_ref().map(encode_cursor).transpose()?;

    Ok(Json(ListDeliveriesResponse {
        deliveries: page.deliveries,
        next_before,
    }))
}

pub async fn list_attempts_handler(
    State(state): State<AppState>,
    ValidPath(delivery_id): ValidPath<String>,
) -> Result<Json<ListAttemptsResponse>, ApiError> {
    let delivery_id = Uuid::parse_str(&delivery_id)
        .map_err(|_| ApiError::BadRequest("delivery_id must be a UUID".to_string()))?;
    let attempts = state.store.list_attempts(delivery_id).await?;
    Ok(Json(ListAttemptsResponse { attempts }))
}

fn parse_limit(limit: Option<i64>) -> Result<i64, ApiError> {
    let limit = limit.unwrap_or(50);
    if !(1..=200).contains(&limit) {
        return Err(ApiError::BadRequest(
            "limit must be between 1 and 200".to_string(),
        ));
    }
    Ok(limit)
}

fn non_empty(field: &str, value: Option<String>) -> Result<Option<String>, ApiError> {
    match value {
        Some(raw) => {
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                return Err(ApiError::BadRequest(format!("{field} must be non-empty")));
            }
            Ok(Some(trimmed.to_string()))
        }
        None => Ok(None),
    }
}

fn decode_cursor(raw: &str) -> Result<DeliveryCursor, ApiError> {
    let invalid = || ApiError::BadRequest("before must be a valid cursor".to_string());
    let decoded = URL_SAFE_NO_PAD.decode(raw).map_err(|_| invalid())?;
    let payload: CursorPayload = serde_json::from_slice(&decoded).map_err(|_| invalid())?;
    Ok(DeliveryCursor {
        created_at: payload.created_at,
        id: payload.id,
    })
}

fn encode_cursor(cursor: &DeliveryCursor) -> Result<String, ApiError> {
    let payload = CursorPayload {
        created_at: cursor.created_at,
        id: cursor.id,
    };
    let encoded = serde_json::to_vec(&payload)
        .map_err(|_| ApiError::Internal("failed to encode cursor".to_string()))?;
    Ok(URL_SAFE_NO_PAD.encode(encoded))
}
