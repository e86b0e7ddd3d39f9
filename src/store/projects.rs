use async_trait::async_trait;

use super::{
    EventRepository, ProjectRepository, SqliteStore, StoreError, SubscriptionRepository,
    format_utc, parse_uuid,
};
use crate::stream::{event_type_filters, matches_event_type};
use crate::types::{CircuitBreakerConfig, Event, Subscription, SubscriptionKind};

#[async_trait]
impl ProjectRepository for SqliteStore {
    async fn circuit_breaker_config(
        &self,
        project_id: &str,
    ) -> Result<CircuitBreakerConfig, StoreError> {
        let raw: Option<Option<String>> =
            sqlx::query_scalar("SELECT circuit_breaker_config FROM projects WHERE id = ?")
                .bind(project_id)
                .fetch_optional(&self.pool)
                .await?;

        match raw {
            None => Err(StoreError::NotFound("project not found".to_string())),
            Some(None) => Ok(CircuitBreakerConfig::default()),
            Some(Some(json)) => serde_json::from_str(&json).map_err(|err| {
                StoreError::Parse(format!("invalid circuit breaker config JSON: {err}"))
            }),
        }
    }

    async fn update_circuit_breaker_config(
        &self,
        project_id: &str,
        config: &CircuitBreakerConfig,
    ) -> Result<(), StoreError> {
        let json = serde_json::to_string(config)
            .map_err(|err| StoreError::Parse(format!("invalid circuit breaker config: {err}")))?;

        let result = sqlx::query("UPDATE projects SET circuit_breaker_config = ? WHERE id = ?")
            .bind(json)
            .bind(project_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound("project not found".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl SubscriptionRepository for SqliteStore {
    async fn find_for_event(
        &self,
        project_id: &str,
        event_type: &str,
        endpoint_id: Option<&str>,
    ) -> Result<Vec<Subscription>, StoreError> {
        let rows = sqlx::query_as::<_, SubscriptionRow>(
            r"
            SELECT id, project_id, kind, endpoint_id, device_id, event_types, retry_config
            FROM subscriptions
            WHERE project_id = ?
            ORDER BY id ASC
            ",
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;

        let subscriptions = rows
            .into_iter()
            .map(Subscription::try_from)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(subscriptions
            .into_iter()
            .filter(|sub| matches_event_type(&sub.event_types, event_type))
            .filter(|sub| match (sub.kind, endpoint_id) {
                (SubscriptionKind::Api, Some(target)) => sub.endpoint_id.as_deref() == Some(target),
                _ => true,
            })
            .collect())
    }
}

#[async_trait]
impl EventRepository for SqliteStore {
    async fn create(&self, event: &Event) -> Result<(), StoreError> {
        let headers = serde_json::to_string(&event.headers)
            .map_err(|err| StoreError::Parse(format!("invalid headers JSON: {err}")))?;

        sqlx::query(
            r"
            INSERT INTO events (id, project_id, event_type, endpoint_id, headers, data, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(event.id.to_string())
        .bind(&event.project_id)
        .bind(&event.event_type)
        .bind(event.endpoint_id.as_deref())
        .bind(headers)
        .bind(&event.data)
        .bind(format_utc(event.created_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct SubscriptionRow {
    id: String,
    project_id: String,
    kind: String,
    endpoint_id: Option<String>,
    device_id: Option<String>,
    event_types: String,
    retry_config: String,
}

impl TryFrom<SubscriptionRow> for Subscription {
    type Error = StoreError;

    fn try_from(row: SubscriptionRow) -> Result<Self, Self::Error> {
        let kind = match row.kind.as_str() {
            "api" => SubscriptionKind::Api,
            "cli" => SubscriptionKind::Cli,
            other => {
                return Err(StoreError::Parse(format!(
                    "unknown subscription kind: {other}"
                )));
            }
        };
        let device_id = row
            .device_id
            .as_deref()
            .map(|id| parse_uuid("device id", id))
            .transpose()?;

        Ok(Subscription {
            id: row.id,
            project_id: row.project_id,
            kind,
            endpoint_id: row.endpoint_id,
            device_id,
            event_types: event_type_filters(serde_json::from_str(&row.event_types).map_err(
                |err| StoreError::Parse(format!("invalid event types JSON: {err}")),
            )?),
            retry_config: serde_json::from_str(&row.retry_config)
                .map_err(|err| StoreError::Parse(format!("invalid retry config JSON: {err}")))?,
        })
    }
}
