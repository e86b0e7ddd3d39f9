//! Repository interfaces and their SQLite implementation.
//!
//! The delivery subsystem only talks to the traits; `SqliteStore` implements
//! all of them over one pool so the server, the admin CLI and the tests share
//! the same persistence code.

mod deliveries;
mod devices;
mod feed;
mod projects;

use async_trait::async_trait;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::inspector::{DeliveryPage, ListDeliveriesParams};
use crate::interval::TimeRange;
use crate::types::{
    CircuitBreakerConfig, DeliveryAttempt, DeliveryStatus, Device, DeviceStatus, Event,
    EventDelivery, LeasedDelivery, Subscription,
};

pub use deliveries::{AttemptUpdate, DELIVERY_COLUMNS, DeliveryRow};
pub use feed::DeliveryFeed;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("{0}")]
    NotFound(String),
    #[error("corrupt record: {0}")]
    Parse(String),
}

#[async_trait]
pub trait EventDeliveryRepository: Send + Sync {
    /// Persists a new delivery and publishes it on the change feed.
    async fn create(&self, delivery: &EventDelivery) -> Result<(), StoreError>;

    /// Loads a delivery together with its attempt history.
    async fn find(&self, id: Uuid) -> Result<EventDelivery, StoreError>;

    async fn update_status(&self, id: Uuid, status: DeliveryStatus) -> Result<(), StoreError>;

    async fn update_with_attempt(&self, update: &AttemptUpdate<'_>) -> Result<(), StoreError>;

    /// Discarded deliveries routed to `device_id` created at or after `since`,
    /// oldest first. Attempts are not loaded.
    async fn find_discarded_since(
        &self,
        project_id: &str,
        device_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Vec<EventDelivery>, StoreError>;

    async fn find_due_retries(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Uuid>, StoreError>;

    /// Moves a delivery to `Scheduled`, due at `now`, if its current status is
    /// one of `from`. CLI deliveries are never rescheduled. Returns whether
    /// the row changed.
    async fn mark_scheduled(
        &self,
        id: Uuid,
        from: &[DeliveryStatus],
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// API deliveries in any of `statuses` created inside `range`.
    /// `Processing` is never selected.
    async fn find_for_requeue(
        &self,
        statuses: &[DeliveryStatus],
        range: &TimeRange,
    ) -> Result<Vec<Uuid>, StoreError>;

    /// Leases up to `limit` due `Scheduled` deliveries to `worker_id`, moving
    /// them to `Processing`. Expired leases are recovered first.
    async fn claim_due(
        &self,
        limit: i64,
        worker_id: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<LeasedDelivery>, StoreError>;

    /// Releases a leased delivery without recording an attempt.
    async fn defer(
        &self,
        id: Uuid,
        worker_id: &str,
        status: DeliveryStatus,
        next_send_time: DateTime<Utc>,
        description: Option<&str>,
    ) -> Result<(), StoreError>;

    async fn list(&self, params: &ListDeliveriesParams) -> Result<DeliveryPage, StoreError>;

    async fn list_attempts(&self, id: Uuid) -> Result<Vec<DeliveryAttempt>, StoreError>;
}

#[async_trait]
pub trait DeviceRepository: Send + Sync {
    async fn create(&self, device: &Device) -> Result<(), StoreError>;

    async fn update_last_seen(
        &self,
        id: Uuid,
        status: DeviceStatus,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn fetch_by_id(&self, id: Uuid) -> Result<Device, StoreError>;

    async fn fetch_by_host_name(
        &self,
        project_id: &str,
        host_name: &str,
    ) -> Result<Option<Device>, StoreError>;
}

#[async_trait]
pub trait ProjectRepository: Send + Sync {
    /// Breaker settings for a project, defaults applied to missing fields.
    async fn circuit_breaker_config(
        &self,
        project_id: &str,
    ) -> Result<CircuitBreakerConfig, StoreError>;

    async fn update_circuit_breaker_config(
        &self,
        project_id: &str,
        config: &CircuitBreakerConfig,
    ) -> Result<(), StoreError>;
}

#[async_trait]
pub trait SubscriptionRepository: Send + Sync {
    /// Subscriptions of a project whose event-type filter accepts
    /// `event_type`. API subscriptions scoped to another endpoint than
    /// `endpoint_id` are left out.
    async fn find_for_event(
        &self,
        project_id: &str,
        event_type: &str,
        endpoint_id: Option<&str>,
    ) -> Result<Vec<Subscription>, StoreError>;
}

#[async_trait]
pub trait EventRepository: Send + Sync {
    async fn create(&self, event: &Event) -> Result<(), StoreError>;
}

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    feed: DeliveryFeed,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool, feed: DeliveryFeed) -> Self {
        Self { pool, feed }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn feed(&self) -> &DeliveryFeed {
        &self.feed
    }
}

/// Fixed-width UTC timestamps so that lexical order matches time order in SQL.
pub fn format_utc(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_utc(field: &str, value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| StoreError::Parse(format!("invalid {field}: {err}")))
}

pub(crate) fn parse_uuid(field: &str, value: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(value).map_err(|err| StoreError::Parse(format!("invalid {field}: {err}")))
}

pub(crate) fn parse_attempt_row(row: AttemptRow) -> Result<DeliveryAttempt, StoreError> {
    Ok(DeliveryAttempt {
        id: parse_uuid("attempt id", &row.id)?,
        attempt_no: row.attempt_no as u32,
        started_at: parse_utc("started_at", &row.started_at)?,
        finished_at: parse_utc("finished_at", &row.finished_at)?,
        status_code: row.status_code.map(|code| code as u16),
        latency_ms: row.latency_ms as u64,
        error: row.error,
    })
}

#[derive(sqlx::FromRow)]
pub(crate) struct AttemptRow {
    pub id: String,
    pub attempt_no: i64,
    pub started_at: String,
    pub finished_at: String,
    pub status_code: Option<i64>,
    pub latency_ms: i64,
    pub error: Option<String>,
}
