use chrono::{DateTime, Duration, Utc};
use sqlx::{QueryBuilder, SqlitePool};
use tracing::info;
use uuid::Uuid;

use crate::store::{DELIVERY_COLUMNS, DeliveryRow, StoreError, format_utc, parse_utc};
use crate::types::{DeliveryStatus, EventDelivery, LeasedDelivery};

pub async fn claim_due(
    pool: &SqlitePool,
    limit: i64,
    worker_id: &str,
    lease: Duration,
    now: DateTime<Utc>,
) -> Result<Vec<LeasedDelivery>, StoreError> {
    let now_str = format_utc(now);
    let lease_expires_at = format_utc(now + lease);

    let mut tx = pool.begin().await?;

    let recovered = sqlx::query(
        r#"
        UPDATE event_deliveries
        SET status = 'scheduled',
            lease_expires_at = NULL,
            leased_by = NULL,
            updated_at = ?
        WHERE status = 'processing'
            AND lease_expires_at IS NOT NULL
            AND lease_expires_at <= ?
        "#,
    )
    .bind(&now_str)
    .bind(&now_str)
    .execute(&mut *tx)
    .await?;
    if recovered.rows_affected() > 0 {
        info!(
            recovered = recovered.rows_affected(),
            "expired delivery leases returned to scheduled"
        );
    }

    let leased_ids: Vec<String> = sqlx::query_scalar(
        r#"
        WITH eligible AS (
            SELECT d.id
            FROM event_deliveries d
            JOIN endpoints ep ON ep.id = d.endpoint_id
            WHERE d.status = 'scheduled'
                AND d.next_send_time <= ?
                AND d.cli_device_id IS NULL
            ORDER BY d.next_send_time ASC, d.created_at ASC
            LIMIT ?
        )
        UPDATE event_deliveries
        SET status = 'processing',
            lease_expires_at = ?,
            leased_by = ?,
            updated_at = ?
        WHERE id IN (SELECT id FROM eligible)
            AND status = 'scheduled'
        RETURNING id
        "#,
    )
    .bind(&now_str)
    .bind(limit)
    .bind(&lease_expires_at)
    .bind(worker_id)
    .bind(&now_str)
    .fetch_all(&mut *tx)
    .await?;

    if leased_ids.is_empty() {
        tx.commit().await?;
        return Ok(Vec::new());
    }

    let mut fetch = QueryBuilder::new(format!(
        "SELECT {DELIVERY_COLUMNS}, ep.target_url, d.lease_expires_at \
         FROM event_deliveries d \
         JOIN endpoints ep ON ep.id = d.endpoint_id \
         WHERE d.id IN ("
    ));
    let mut fetch_list = fetch.separated(", ");
    for id in &leased_ids {
        fetch_list.push_bind(id);
    }
    fetch_list.push_unseparated(")");
    fetch.push(" ORDER BY d.next_send_time ASC, d.created_at ASC");

    let rows: Vec<LeaseRow> = fetch.build_query_as().fetch_all(&mut *tx).await?;

    tx.commit().await?;

    rows.into_iter().map(LeasedDelivery::try_from).collect()
}

pub async fn defer(
    pool: &SqlitePool,
    id: Uuid,
    worker_id: &str,
    status: DeliveryStatus,
    next_send_time: DateTime<Utc>,
    description: Option<&str>,
) -> Result<(), StoreError> {
    let result = sqlx::query(
        r#"
        UPDATE event_deliveries
        SET status = ?,
            next_send_time = ?,
            description = ?,
            lease_expires_at = NULL,
            leased_by = NULL,
            updated_at = ?
        WHERE id = ?
          AND status = 'processing'
          AND leased_by = ?
        "#,
    )
    .bind(status.as_str())
    .bind(format_utc(next_send_time))
    .bind(description)
    .bind(format_utc(Utc::now()))
    .bind(id.to_string())
    .bind(worker_id)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(StoreError::Conflict("lease_not_owned".to_string()));
    }
    Ok(())
}

#[derive(sqlx::FromRow)]
struct LeaseRow {
    #[sqlx(flatten)]
    delivery: DeliveryRow,
    target_url: String,
    lease_expires_at: Option<String>,
}

impl TryFrom<LeaseRow> for LeasedDelivery {
    type Error = StoreError;

    fn try_from(row: LeaseRow) -> Result<Self, Self::Error> {
        let lease_expires_at = row
            .lease_expires_at
            .ok_or_else(|| StoreError::Parse("missing lease_expires_at".to_string()))?;

        Ok(LeasedDelivery {
            delivery: EventDelivery::try_from(row.delivery)?,
            target_url: row.target_url,
            lease_expires_at: parse_utc("lease_expires_at", &lease_expires_at)?,
        })
    }
}
