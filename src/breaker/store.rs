use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::SqlitePool;
use tokio::sync::RwLock;

use super::BreakerError;
use crate::store::{format_utc, parse_utc};
use crate::types::CircuitBreaker;

/// TTL-backed key/value store of breaker snapshots.
///
/// Expired entries read as absent. Writes are last-writer-wins.
#[async_trait]
pub trait BreakerStore: Send + Sync {
    async fn get(
        &self,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<CircuitBreaker>, BreakerError>;

    async fn set(
        &self,
        breaker: &CircuitBreaker,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<(), BreakerError>;

    async fn delete(&self, key: &str) -> Result<bool, BreakerError>;

    /// Deletes every breaker belonging to a project. Returns how many went.
    async fn delete_by_project(&self, project_id: &str) -> Result<u64, BreakerError>;
}

pub struct SqliteBreakerStore {
    pool: SqlitePool,
}

impl SqliteBreakerStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct BreakerRow {
    snapshot: String,
    expires_at: String,
}

#[async_trait]
impl BreakerStore for SqliteBreakerStore {
    async fn get(
        &self,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<CircuitBreaker>, BreakerError> {
        let row = sqlx::query_as::<_, BreakerRow>(
            "SELECT snapshot, expires_at FROM circuit_breakers WHERE key = ?",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let expires_at = parse_utc("expires_at", &row.expires_at)
            .map_err(|err| BreakerError::Corrupt(err.to_string()))?;
        if expires_at <= now {
            sqlx::query("DELETE FROM circuit_breakers WHERE key = ? AND expires_at <= ?")
                .bind(key)
                .bind(format_utc(now))
                .execute(&self.pool)
                .await?;
            return Ok(None);
        }

        serde_json::from_str(&row.snapshot)
            .map(Some)
            .map_err(|err| BreakerError::Corrupt(err.to_string()))
    }

    async fn set(
        &self,
        breaker: &CircuitBreaker,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<(), BreakerError> {
        let snapshot =
            serde_json::to_string(breaker).map_err(|err| BreakerError::Corrupt(err.to_string()))?;

        sqlx::query(
            r"
            INSERT INTO circuit_breakers (key, tenant_id, project_id, snapshot, expires_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                tenant_id = excluded.tenant_id,
                project_id = excluded.project_id,
                snapshot = excluded.snapshot,
                expires_at = excluded.expires_at
            ",
        )
        .bind(&breaker.key)
        .bind(&breaker.tenant_id)
        .bind(&breaker.project_id)
        .bind(snapshot)
        .bind(format_utc(now + ttl))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, BreakerError> {
        let result = sqlx::query("DELETE FROM circuit_breakers WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_by_project(&self, project_id: &str) -> Result<u64, BreakerError> {
        let result = sqlx::query("DELETE FROM circuit_breakers WHERE project_id = ?")
            .bind(project_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

/// In-process store for single-node deployments and tests.
#[derive(Default)]
pub struct MemoryBreakerStore {
    entries: RwLock<HashMap<String, (CircuitBreaker, DateTime<Utc>)>>,
}

impl MemoryBreakerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BreakerStore for MemoryBreakerStore {
    async fn get(
        &self,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<CircuitBreaker>, BreakerError> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(key)
            .filter(|(_, expires_at)| *expires_at > now)
            .map(|(breaker, _)| breaker.clone()))
    }

    async fn set(
        &self,
        breaker: &CircuitBreaker,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<(), BreakerError> {
        let mut entries = self.entries.write().await;
        entries.retain(|_, (_, expires_at)| *expires_at > now);
        entries.insert(breaker.key.clone(), (breaker.clone(), now + ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, BreakerError> {
        Ok(self.entries.write().await.remove(key).is_some())
    }

    async fn delete_by_project(&self, project_id: &str) -> Result<u64, BreakerError> {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, (breaker, _)| breaker.project_id != project_id);
        Ok((before - entries.len()) as u64)
    }
}
