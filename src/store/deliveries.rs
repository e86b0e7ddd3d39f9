use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::QueryBuilder;
use uuid::Uuid;

use super::{
    AttemptRow, EventDeliveryRepository, SqliteStore, StoreError, format_utc, parse_attempt_row,
    parse_utc, parse_uuid,
};
use crate::dispatcher;
use crate::inspector::{self, DeliveryPage, ListDeliveriesParams};
use crate::interval::TimeRange;
use crate::types::{
    CliMetadata, DeliveryAttempt, DeliveryMetadata, DeliveryStatus, EventDelivery,
    LeasedDelivery, RetryConfiguration,
};

pub const DELIVERY_COLUMNS: &str = "\
    d.id, \
    d.project_id, \
    d.event_id, \
    d.subscription_id, \
    d.endpoint_id, \
    d.event_type, \
    d.status, \
    d.headers, \
    d.data, \
    d.retry_config, \
    d.num_trials, \
    d.next_send_time, \
    d.cli_event_type, \
    d.cli_device_id, \
    d.description, \
    d.created_at, \
    d.updated_at";

/// Result of one delivery attempt, written atomically with the new status.
#[derive(Debug, Clone)]
pub struct AttemptUpdate<'a> {
    pub delivery_id: Uuid,
    /// When set, the write only applies while this worker holds the lease.
    pub worker_id: Option<&'a str>,
    pub status: DeliveryStatus,
    pub num_trials: u32,
    pub next_send_time: DateTime<Utc>,
    pub attempt: &'a DeliveryAttempt,
    pub description: Option<&'a str>,
}

#[async_trait]
impl EventDeliveryRepository for SqliteStore {
    async fn create(&self, delivery: &EventDelivery) -> Result<(), StoreError> {
        let headers = serde_json::to_string(&delivery.headers)
            .map_err(|err| StoreError::Parse(format!("invalid headers JSON: {err}")))?;
        let retry_config = serde_json::to_string(&delivery.metadata.retry)
            .map_err(|err| StoreError::Parse(format!("invalid retry config JSON: {err}")))?;
        let (cli_event_type, cli_device_id) = match &delivery.cli_metadata {
            Some(cli) => (Some(cli.event_type.as_str()), Some(cli.device_id.to_string())),
            None => (None, None),
        };

        sqlx::query(
            r"
            INSERT INTO event_deliveries (
                id,
                project_id,
                event_id,
                subscription_id,
                endpoint_id,
                event_type,
                status,
                headers,
                data,
                retry_config,
                num_trials,
                next_send_time,
                cli_event_type,
                cli_device_id,
                lease_expires_at,
                leased_by,
                description,
                created_at,
                updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, NULL, NULL, ?, ?, ?)
            ",
        )
        .bind(delivery.uid.to_string())
        .bind(&delivery.project_id)
        .bind(delivery.event_id.to_string())
        .bind(&delivery.subscription_id)
        .bind(delivery.endpoint_id.as_deref())
        .bind(&delivery.event_type)
        .bind(delivery.status.as_str())
        .bind(headers)
        .bind(&delivery.metadata.data)
        .bind(retry_config)
        .bind(i64::from(delivery.metadata.num_trials))
        .bind(format_utc(delivery.metadata.next_send_time))
        .bind(cli_event_type)
        .bind(cli_device_id)
        .bind(delivery.description.as_deref())
        .bind(format_utc(delivery.created_at))
        .bind(format_utc(delivery.updated_at))
        .execute(&self.pool)
        .await?;

        self.feed.publish(delivery.clone());

        Ok(())
    }

    async fn find(&self, id: Uuid) -> Result<EventDelivery, StoreError> {
        let row = sqlx::query_as::<_, DeliveryRow>(&format!(
            "SELECT {DELIVERY_COLUMNS} FROM event_deliveries d WHERE d.id = ?"
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::NotFound("event delivery not found".to_string()))?;

        let attempts = sqlx::query_as::<_, AttemptRow>(
            r"
            SELECT id, attempt_no, started_at, finished_at, status_code, latency_ms, error
            FROM delivery_attempts
            WHERE delivery_id = ?
            ORDER BY attempt_no ASC
            ",
        )
        .bind(id.to_string())
        .fetch_all(&self.pool)
        .await?;

        let mut delivery = EventDelivery::try_from(row)?;
        delivery.attempts = attempts
            .into_iter()
            .map(parse_attempt_row)
            .collect::<Result<_, _>>()?;
        Ok(delivery)
    }

    async fn update_status(&self, id: Uuid, status: DeliveryStatus) -> Result<(), StoreError> {
        let result = sqlx::query(
            r"
            UPDATE event_deliveries
            SET status = ?,
                updated_at = ?
            WHERE id = ?
            ",
        )
        .bind(status.as_str())
        .bind(format_utc(Utc::now()))
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound("event delivery not found".to_string()));
        }
        Ok(())
    }

    async fn update_with_attempt(&self, update: &AttemptUpdate<'_>) -> Result<(), StoreError> {
        let now = format_utc(Utc::now());
        let delivery_id = update.delivery_id.to_string();
        let mut tx = self.pool.begin().await?;

        let mut query = QueryBuilder::new("UPDATE event_deliveries SET status = ");
        query.push_bind(update.status.as_str());
        query.push(", num_trials = ");
        query.push_bind(i64::from(update.num_trials));
        query.push(", next_send_time = ");
        query.push_bind(format_utc(update.next_send_time));
        query.push(", description = ");
        query.push_bind(update.description);
        query.push(", lease_expires_at = NULL, leased_by = NULL, updated_at = ");
        query.push_bind(&now);
        query.push(" WHERE id = ");
        query.push_bind(&delivery_id);
        if let Some(worker_id) = update.worker_id {
            query.push(" AND status = 'processing' AND leased_by = ");
            query.push_bind(worker_id);
        }

        let result = query.build().execute(&mut *tx).await?;
        if result.rows_affected() == 0 {
            return Err(match update.worker_id {
                Some(_) => StoreError::Conflict("lease_not_owned".to_string()),
                None => StoreError::NotFound("event delivery not found".to_string()),
            });
        }

        let attempt = update.attempt;
        sqlx::query(
            r"
            INSERT INTO delivery_attempts (
                id,
                delivery_id,
                attempt_no,
                started_at,
                finished_at,
                status_code,
                latency_ms,
                error
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(attempt.id.to_string())
        .bind(&delivery_id)
        .bind(i64::from(attempt.attempt_no))
        .bind(format_utc(attempt.started_at))
        .bind(format_utc(attempt.finished_at))
        .bind(attempt.status_code.map(i64::from))
        .bind(attempt.latency_ms as i64)
        .bind(attempt.error.as_deref())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn find_discarded_since(
        &self,
        project_id: &str,
        device_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Vec<EventDelivery>, StoreError> {
        let rows = sqlx::query_as::<_, DeliveryRow>(&format!(
            "SELECT {DELIVERY_COLUMNS} \
             FROM event_deliveries d \
             WHERE d.status = 'discarded' \
               AND d.project_id = ? \
               AND d.cli_device_id = ? \
               AND d.created_at >= ? \
             ORDER BY d.created_at ASC, d.id ASC"
        ))
        .bind(project_id)
        .bind(device_id.to_string())
        .bind(format_utc(since))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(EventDelivery::try_from).collect()
    }

    async fn find_due_retries(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Uuid>, StoreError> {
        let ids: Vec<String> = sqlx::query_scalar(
            r"
            SELECT id
            FROM event_deliveries
            WHERE status = 'retry'
              AND next_send_time <= ?
            ORDER BY next_send_time ASC
            LIMIT ?
            ",
        )
        .bind(format_utc(now))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        ids.iter().map(|id| parse_uuid("delivery id", id)).collect()
    }

    async fn mark_scheduled(
        &self,
        id: Uuid,
        from: &[DeliveryStatus],
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        if from.is_empty() {
            return Ok(false);
        }
        let now = format_utc(now);

        let mut query = QueryBuilder::new(
            "UPDATE event_deliveries \
             SET status = 'scheduled', lease_expires_at = NULL, leased_by = NULL, next_send_time = ",
        );
        query.push_bind(&now);
        query.push(", updated_at = ");
        query.push_bind(&now);
        query.push(" WHERE id = ");
        query.push_bind(id.to_string());
        query.push(" AND status IN (");
        let mut statuses = query.separated(", ");
        for status in from {
            statuses.push_bind(status.as_str());
        }
        statuses.push_unseparated(")");
        // CLI deliveries settle through device acks, never the dispatcher
        query.push(" AND cli_device_id IS NULL");

        let result = query.build().execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }

    async fn find_for_requeue(
        &self,
        statuses: &[DeliveryStatus],
        range: &TimeRange,
    ) -> Result<Vec<Uuid>, StoreError> {
        let statuses: Vec<DeliveryStatus> = statuses
            .iter()
            .copied()
            .filter(|status| *status != DeliveryStatus::Processing)
            .collect();
        if statuses.is_empty() {
            return Ok(Vec::new());
        }

        let mut query = QueryBuilder::new("SELECT id FROM event_deliveries WHERE status IN (");
        let mut list = query.separated(", ");
        for status in &statuses {
            list.push_bind(status.as_str());
        }
        list.push_unseparated(")");
        query.push(" AND cli_device_id IS NULL AND created_at >= ");
        query.push_bind(format_utc(range.start));
        query.push(" AND created_at <= ");
        query.push_bind(format_utc(range.end));
        query.push(" ORDER BY created_at ASC, id ASC");

        let ids: Vec<String> = query.build_query_scalar().fetch_all(&self.pool).await?;
        ids.iter().map(|id| parse_uuid("delivery id", id)).collect()
    }

    async fn claim_due(
        &self,
        limit: i64,
        worker_id: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<LeasedDelivery>, StoreError> {
        dispatcher::claim_due(&self.pool, limit, worker_id, lease, now).await
    }

    async fn defer(
        &self,
        id: Uuid,
        worker_id: &str,
        status: DeliveryStatus,
        next_send_time: DateTime<Utc>,
        description: Option<&str>,
    ) -> Result<(), StoreError> {
        dispatcher::defer(&self.pool, id, worker_id, status, next_send_time, description).await
    }

    async fn list(&self, params: &ListDeliveriesParams) -> Result<DeliveryPage, StoreError> {
        inspector::list_deliveries(&self.pool, params).await
    }

    async fn list_attempts(&self, id: Uuid) -> Result<Vec<DeliveryAttempt>, StoreError> {
        inspector::list_attempts(&self.pool, id).await
    }
}

#[derive(sqlx::FromRow)]
pub struct DeliveryRow {
    id: String,
    project_id: String,
    event_id: String,
    subscription_id: String,
    endpoint_id: Option<String>,
    event_type: String,
    status: String,
    headers: String,
    data: String,
    retry_config: String,
    num_trials: i64,
    next_send_time: String,
    cli_event_type: Option<String>,
    cli_device_id: Option<String>,
    description: Option<String>,
    created_at: String,
    updated_at: String,
}

impl TryFrom<DeliveryRow> for EventDelivery {
    type Error = StoreError;

    fn try_from(row: DeliveryRow) -> Result<Self, Self::Error> {
        let status: DeliveryStatus = row
            .status
            .parse()
            .map_err(|err| StoreError::Parse(format!("{err}")))?;
        let headers: BTreeMap<String, String> = serde_json::from_str(&row.headers)
            .map_err(|err| StoreError::Parse(format!("invalid headers JSON: {err}")))?;
        let retry: RetryConfiguration = serde_json::from_str(&row.retry_config)
            .map_err(|err| StoreError::Parse(format!("invalid retry config JSON: {err}")))?;
        let cli_metadata = match (row.cli_event_type, row.cli_device_id) {
            (Some(event_type), Some(device_id)) => Some(CliMetadata {
                event_type,
                device_id: parse_uuid("cli device id", &device_id)?,
            }),
            _ => None,
        };

        Ok(EventDelivery {
            uid: parse_uuid("delivery id", &row.id)?,
            project_id: row.project_id,
            event_id: parse_uuid("event id", &row.event_id)?,
            subscription_id: row.subscription_id,
            endpoint_id: row.endpoint_id,
            event_type: row.event_type,
            status,
            headers,
            metadata: DeliveryMetadata {
                data: row.data,
                retry,
                num_trials: row.num_trials.max(0) as u32,
                next_send_time: parse_utc("next_send_time", &row.next_send_time)?,
            },
            cli_metadata,
            attempts: Vec::new(),
            description: row.description,
            created_at: parse_utc("created_at", &row.created_at)?,
            updated_at: parse_utc("updated_at", &row.updated_at)?,
        })
    }
}
