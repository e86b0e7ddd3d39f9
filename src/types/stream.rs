use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::EventDelivery;

/// Frame pushed to a CLI device for one delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CliEvent {
    pub uid: Uuid,
    pub data: String,
    pub headers: BTreeMap<String, String>,
    pub event_type: String,
    pub device_id: Uuid,
    /// Endpoint the device is scoped to, if any.
    pub app_id: Option<String>,
    pub project_id: String,
}

impl CliEvent {
    /// Builds the frame for a CLI-routed delivery; None for API deliveries.
    pub fn from_delivery(delivery: &EventDelivery) -> Option<Self> {
        let cli = delivery.cli_metadata.as_ref()?;
        Some(Self {
            uid: delivery.uid,
            data: delivery.metadata.data.clone(),
            headers: delivery.headers.clone(),
            event_type: cli.event_type.clone(),
            device_id: cli.device_id,
            app_id: delivery.endpoint_id.clone(),
            project_id: delivery.project_id.clone(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckMessage {
    pub uid: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub project_id: String,
    pub host_name: String,
    pub endpoint_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestEventRequest {
    pub event_type: String,
    pub data: serde_json::Value,
    pub endpoint_id: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestEventResponse {
    pub event_id: Uuid,
    pub deliveries: Vec<Uuid>,
}
