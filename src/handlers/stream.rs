use std::sync::Arc;

use axum::{
    Json,
    extract::{
        State,
        ws::{WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use chrono::Utc;
use futures_util::StreamExt;
use serde::Deserialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    error::ApiError,
    extractors::{ValidJson, ValidQuery},
    state::AppState,
    store::{DeviceRepository, ProjectRepository},
    stream::Client,
    types::{Device, DeviceStatus, LoginRequest},
};

#[derive(Debug, Deserialize)]
pub struct ListenQuery {
    device_id: Uuid,
    /// Comma-separated event-type patterns; omitted means all.
    event_types: Option<String>,
}

/// Returns the device registered under `host_name`, creating it on first login.
pub async fn login_handler(
    State(state): State<AppState>,
    ValidJson(req): ValidJson<LoginRequest>,
) -> Result<Json<Device>, ApiError> {
    let host_name = req.host_name.trim();
    if req.project_id.trim().is_empty() {
        return Err(ApiError::BadRequest("project_id is required".to_string()));
    }
    if host_name.is_empty() {
        return Err(ApiError::BadRequest("host_name is required".to_string()));
    }
    state.store.circuit_breaker_config(&req.project_id).await?;

    if let Some(device) = state
        .store
        .fetch_by_host_name(&req.project_id, host_name)
        .await?
    {
        return Ok(Json(device));
    }

    let now = Utc::now();
    let device = Device {
        uid: Uuid::new_v4(),
        project_id: req.project_id.clone(),
        endpoint_id: req.endpoint_id.clone(),
        host_name: host_name.to_string(),
        status: DeviceStatus::Offline,
        last_seen_at: now,
        created_at: now,
        updated_at: now,
    };
    DeviceRepository::create(&state.store, &device).await?;
    info!(device_id = %device.uid, project_id = %device.project_id, host_name, "device created");

    Ok(Json(device))
}

pub async fn listen_handler(
    State(state): State<AppState>,
    ValidQuery(query): ValidQuery<ListenQuery>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let device = state.store.fetch_by_id(query.device_id).await?;
    let event_types = parse_event_types(query.event_types.as_deref());

    Ok(ws.on_upgrade(move |socket| serve_device(state, device, event_types, socket)))
}

async fn serve_device(state: AppState, device: Device, event_types: Vec<String>, socket: WebSocket) {
    let device_id = device.uid;
    let (sink, stream) = socket.split();
    let store = Arc::new(state.store.clone());
    let client = Client::new(
        device,
        Box::new(sink),
        event_types,
        store.clone(),
        store,
        state.hub.clone(),
        state.config.device_max_last_seen(),
    );

    if let Err(err) = client.touch(Utc::now()).await {
        warn!(%device_id, error = %err, "failed to mark device online");
    }
    if let Err(err) = state.hub.register(Arc::clone(&client)) {
        warn!(%device_id, error = %err, "hub unavailable, closing device connection");
        client.close().await;
        return;
    }

    client.read_pump(stream).await;
}

fn parse_event_types(raw: Option<&str>) -> Vec<String> {
    raw.map(|value| {
        value
            .split(',')
            .map(str::trim)
            .filter(|pattern| !pattern.is_empty())
            .map(str::to_string)
            .collect()
    })
    .unwrap_or_default()
}
