use serde::{Deserialize, Serialize};

use super::{DeliveryAttempt, EventDelivery};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListDeliveriesResponse {
    pub deliveries: Vec<EventDelivery>,
    pub next_before: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListAttemptsResponse {
    pub attempts: Vec<DeliveryAttempt>,
}
