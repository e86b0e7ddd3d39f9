use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{DeviceRepository, SqliteStore, StoreError, format_utc, parse_utc, parse_uuid};
use crate::types::{Device, DeviceStatus};

#[async_trait]
impl DeviceRepository for SqliteStore {
    async fn create(&self, device: &Device) -> Result<(), StoreError> {
        sqlx::query(
            r"
            INSERT INTO devices (
                id,
                project_id,
                endpoint_id,
                host_name,
                status,
                last_seen_at,
                created_at,
                updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(device.uid.to_string())
        .bind(&device.project_id)
        .bind(device.endpoint_id.as_deref())
        .bind(&device.host_name)
        .bind(device.status.as_str())
        .bind(format_utc(device.last_seen_at))
        .bind(format_utc(device.created_at))
        .bind(format_utc(device.updated_at))
        .execute(&self.pool)
        .await
        .map_err(|err| match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                StoreError::Conflict("device host name already registered".to_string())
            }
            _ => StoreError::Db(err),
        })?;

        Ok(())
    }

    async fn update_last_seen(
        &self,
        id: Uuid,
        status: DeviceStatus,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let at = format_utc(at);
        let result = sqlx::query(
            r"
            UPDATE devices
            SET status = ?,
                last_seen_at = ?,
                updated_at = ?
            WHERE id = ?
            ",
        )
        .bind(status.as_str())
        .bind(&at)
        .bind(&at)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound("device not found".to_string()));
        }
        Ok(())
    }

    async fn fetch_by_id(&self, id: Uuid) -> Result<Device, StoreError> {
        let row = sqlx::query_as::<_, DeviceRow>(
            r"
            SELECT id, project_id, endpoint_id, host_name, status, last_seen_at, created_at, updated_at
            FROM devices
            WHERE id = ?
            ",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::NotFound("device not found".to_string()))?;

        row.try_into()
    }

    async fn fetch_by_host_name(
        &self,
        project_id: &str,
        host_name: &str,
    ) -> Result<Option<Device>, StoreError> {
        let row = sqlx::query_as::<_, DeviceRow>(
            r"
            SELECT id, project_id, endpoint_id, host_name, status, last_seen_at, created_at, updated_at
            FROM devices
            WHERE project_id = ?
              AND host_name = ?
            ",
        )
        .bind(project_id)
        .bind(host_name)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Device::try_from).transpose()
    }
}

#[derive(sqlx::FromRow)]
struct DeviceRow {
    id: String,
    project_id: String,
    endpoint_id: Option<String>,
    host_name: String,
    status: String,
    last_seen_at: String,
    created_at: String,
    updated_at: String,
}

impl TryFrom<DeviceRow> for Device {
    type Error = StoreError;

    fn try_from(row: DeviceRow) -> Result<Self, Self::Error> {
        let status = match row.status.as_str() {
            "online" => DeviceStatus::Online,
            "offline" => DeviceStatus::Offline,
            other => return Err(StoreError::Parse(format!("unknown device status: {other}"))),
        };

        Ok(Device {
            uid: parse_uuid("device id", &row.id)?,
            project_id: row.project_id,
            endpoint_id: row.endpoint_id,
            host_name: row.host_name,
            status,
            last_seen_at: parse_utc("last_seen_at", &row.last_seen_at)?,
            created_at: parse_utc("created_at", &row.created_at)?,
            updated_at: parse_utc("updated_at", &row.updated_at)?,
        })
    }
}
