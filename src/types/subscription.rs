use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::RetryConfiguration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub id: String,
    pub project_id: String,
    pub kind: SubscriptionKind,
    pub endpoint_id: Option<String>,
    pub device_id: Option<Uuid>,
    pub event_types: Vec<String>,
    pub retry_config: RetryConfiguration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionKind {
    Api,
    Cli,
}

/// An inbound event before fan-out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub project_id: String,
    pub event_type: String,
    pub endpoint_id: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub data: String,
    pub created_at: DateTime<Utc>,
}
