use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::RetryConfiguration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventDelivery {
    pub uid: Uuid,
    pub project_id: String,
    pub event_id: Uuid,
    pub subscription_id: String,
    /// Target endpoint. For CLI deliveries, the endpoint the device listens
    /// on behalf of, if any.
    pub endpoint_id: Option<String>,
    pub event_type: String,
    pub status: DeliveryStatus,
    pub headers: BTreeMap<String, String>,
    pub metadata: DeliveryMetadata,
    pub cli_metadata: Option<CliMetadata>,
    pub attempts: Vec<DeliveryAttempt>,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EventDelivery {
    pub fn is_cli(&self) -> bool {
        self.cli_metadata.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryMetadata {
    /// Raw event payload, forwarded verbatim.
    pub data: String,
    pub retry: RetryConfiguration,
    pub num_trials: u32,
    pub next_send_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CliMetadata {
    pub event_type: String,
    pub device_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    pub id: Uuid,
    pub attempt_no: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status_code: Option<u16>,
    pub latency_ms: u64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Scheduled,
    Processing,
    Success,
    Failed,
    Retry,
    Discarded,
}

impl DeliveryStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DeliveryStatus::Scheduled => "scheduled",
            DeliveryStatus::Processing => "processing",
            DeliveryStatus::Success => "success",
            DeliveryStatus::Failed => "failed",
            DeliveryStatus::Retry => "retry",
            DeliveryStatus::Discarded => "discarded",
        }
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownStatus(pub String);

impl fmt::Display for UnknownStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown delivery status: {}", self.0)
    }
}

impl std::error::Error for UnknownStatus {}

impl FromStr for DeliveryStatus {
    type Err = UnknownStatus;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "scheduled" => Ok(DeliveryStatus::Scheduled),
            "processing" => Ok(DeliveryStatus::Processing),
            "success" => Ok(DeliveryStatus::Success),
            "failed" => Ok(DeliveryStatus::Failed),
            "retry" => Ok(DeliveryStatus::Retry),
            "discarded" => Ok(DeliveryStatus::Discarded),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}
