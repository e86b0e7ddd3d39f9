use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, SqlitePool};
use uuid::Uuid;

use crate::store::{
    AttemptRow, DELIVERY_COLUMNS, DeliveryRow, StoreError, format_utc, parse_attempt_row,
};
use crate::types::{DeliveryAttempt, DeliveryStatus, EventDelivery};

/// Position after the last row of a page, newest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryCursor {
    pub created_at: DateTime<Utc>,
    pub id: Uuid,
}

#[derive(Debug, Clone)]
pub struct ListDeliveriesParams {
    pub limit: i64,
    pub before: Option<DeliveryCursor>,
    pub status: Option<DeliveryStatus>,
    pub project_id: Option<String>,
    pub endpoint_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DeliveryPage {
    pub deliveries: Vec<EventDelivery>,
    pub next_before: Option<DeliveryCursor>,
}

pub async fn list_deliveries(
    pool: &SqlitePool,
    params: &ListDeliveriesParams,
) -> Result<DeliveryPage, StoreError> {
    let mut query = QueryBuilder::new(format!(
        "SELECT {DELIVERY_COLUMNS} FROM event_deliveries d WHERE 1 = 1"
    ));

    if let Some(status) = params.status {
        query.push(" AND d.status = ");
        query.push_bind(status.as_str());
    }

    if let Some(project_id) = params.project_id.as_deref() {
        query.push(" AND d.project_id = ");
        query.push_bind(project_id);
    }

    if let Some(endpoint_id) = params.endpoint_id.as_deref() {
        query.push(" AND d.endpoint_id = ");
        query.push_bind(endpoint_id);
    }

    if let Some(cursor) = &params.before {
        let created_at = format_utc(cursor.created_at);
        query.push(" AND (d.created_at < ");
        query.push_bind(created_at.clone());
        query.push(" OR (d.created_at = ");
        query.push_bind(created_at);
        query.push(" AND d.id < ");
        query.push_bind(cursor.id.to_string());
        query.push("))");
    }

    query.push(" ORDER BY d.created_at DESC, d.id DESC LIMIT ");
    query.push_bind(params.limit + 1);

    let rows: Vec<DeliveryRow> = query.build_query_as().fetch_all(pool).await?;

    let has_more = rows.len() > params.limit as usize;
    let deliveries = rows
        .into_iter()
        .take(params.limit as usize)
        .map(EventDelivery::try_from)
        .collect::<Result<Vec<_>, _>>()?;

    let next_before = if has_more {
        deliveries.last().map(|last| DeliveryCursor {
            created_at: last.created_at,
            id: last.uid,
        })
    } else {
        None
    };

    Ok(DeliveryPage {
        deliveries,
        next_before,
    })
}

pub async fn list_attempts(
    pool: &SqlitePool,
    delivery_id: Uuid,
) -> Result<Vec<DeliveryAttempt>, StoreError> {
    let exists: Option<i64> = sqlx::query_scalar("SELECT 1 FROM event_deliveries WHERE id = ?")
        .bind(delivery_id.to_string())
        .fetch_optional(pool)
        .await?;
    if exists.is_none() {
        return Err(StoreError::NotFound("event delivery not found".to_string()));
    }

    let rows = sqlx::query_as::<_, AttemptRow>(
        r"
        SELECT a.id, a.attempt_no, a.started_at, a.finished_at, a.status_code, a.latency_ms, a.error
        FROM delivery_attempts a
        WHERE a.delivery_id = ?
        ORDER BY a.started_at ASC, a.attempt_no ASC
        ",
    )
    .bind(delivery_id.to_string())
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(parse_attempt_row).collect()
}
