use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{DeliveryStatus, EventDelivery};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseRequest {
    pub limit: i64,
    pub lease_ms: i64,
    pub worker_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeasedDelivery {
    pub delivery: EventDelivery,
    pub target_url: String,
    pub lease_expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseResponse {
    pub deliveries: Vec<LeasedDelivery>,
    /// Deliveries claimed but held back because their endpoint's breaker is open.
    pub deferred: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportRequest {
    pub worker_id: String,
    pub delivery_id: Uuid,
    pub success: bool,
    #[serde(default = "default_retryable")]
    pub retryable: bool,
    pub attempt: ReportAttempt,
}

fn default_retryable() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportAttempt {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status_code: Option<u16>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportResponse {
    pub status: DeliveryStatus,
    pub num_trials: u32,
    pub next_send_time: Option<DateTime<Utc>>,
}
