#![allow(dead_code, clippy::expect_used, clippy::unwrap_used)]

use std::fs;

use chrono::Utc;
use courier::{
    store::{DeliveryFeed, DeviceRepository, SqliteStore, format_utc},
    types::{CircuitBreakerConfig, Device, DeviceStatus, RetryConfiguration},
};
use sqlx::{
    Connection, SqliteConnection, SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};
use tempfile::NamedTempFile;
use uuid::Uuid;

pub struct TestDb {
    pub pool: SqlitePool,
    _db_file: NamedTempFile,
}

pub async fn setup_db_shared(max_connections: u32) -> TestDb {
    let db_file = NamedTempFile::new().expect("create temp sqlite file");
    let options = SqliteConnectOptions::new()
        .filename(db_file.path())
        .create_if_missing(true)
        .foreign_keys(true)
        .busy_timeout(std::time::Duration::from_millis(500));

    let mut conn = SqliteConnection::connect_with(&options)
        .await
        .expect("connect sqlite for migrations");
    run_migrations_on_conn(&mut conn)
        .await
        .expect("run migrations");

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await
        .expect("connect sqlite file");

    TestDb {
        pool,
        _db_file: db_file,
    }
}

async fn run_migrations_on_conn(conn: &mut SqliteConnection) -> Result<(), sqlx::Error> {
    let mut entries: Vec<_> = fs::read_dir("migrations")
        .map_err(sqlx::Error::Io)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().extension().and_then(|ext| ext.to_str()) == Some("sql"))
        .collect();

    entries.sort_by_key(|entry| entry.file_name());

    for entry in entries {
        let contents = fs::read_to_string(entry.path()).map_err(sqlx::Error::Io)?;
        for statement in contents.split(';') {
            let statement = statement.trim();
            if statement.is_empty() {
                continue;
            }
            sqlx::query(statement).execute(&mut *conn).await?;
        }
    }

    Ok(())
}

pub fn store(pool: &SqlitePool) -> SqliteStore {
    SqliteStore::new(pool.clone(), DeliveryFeed::new(64))
}

pub async fn seed_project(pool: &SqlitePool, config: Option<&CircuitBreakerConfig>) -> String {
    let id = format!("proj-{}", Uuid::new_v4());
    let config = config.map(|config| serde_json::to_string(config).expect("serialize config"));
    sqlx::query("INSERT INTO projects (id, name, circuit_breaker_config, created_at) VALUES (?, ?, ?, ?)")
        .bind(&id)
        .bind("test project")
        .bind(config)
        .bind(format_utc(Utc::now()))
        .execute(pool)
        .await
        .expect("insert project");
    id
}

pub async fn seed_endpoint(pool: &SqlitePool, project_id: &str, target_url: &str) -> String {
    let id = format!("ep-{}", Uuid::new_v4());
    sqlx::query("INSERT INTO endpoints (id, project_id, target_url) VALUES (?, ?, ?)")
        .bind(&id)
        .bind(project_id)
        .bind(target_url)
        .execute(pool)
        .await
        .expect("insert endpoint");
    id
}

pub async fn seed_api_subscription(
    pool: &SqlitePool,
    project_id: &str,
    endpoint_id: &str,
    event_types: &[&str],
    retry: &RetryConfiguration,
) -> String {
    seed_subscription(pool, project_id, "api", Some(endpoint_id), None, event_types, retry).await
}

pub async fn seed_cli_subscription(
    pool: &SqlitePool,
    project_id: &str,
    device_id: Uuid,
    event_types: &[&str],
) -> String {
    seed_subscription(
        pool,
        project_id,
        "cli",
        None,
        Some(device_id),
        event_types,
        &RetryConfiguration::default(),
    )
    .await
}

async fn seed_subscription(
    pool: &SqlitePool,
    project_id: &str,
    kind: &str,
    endpoint_id: Option<&str>,
    device_id: Option<Uuid>,
    event_types: &[&str],
    retry: &RetryConfiguration,
) -> String {
    let id = format!("sub-{}", Uuid::new_v4());
    sqlx::query(
        r#"
        INSERT INTO subscriptions (id, project_id, kind, endpoint_id, device_id, event_types, retry_config)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&id)
    .bind(project_id)
    .bind(kind)
    .bind(endpoint_id)
    .bind(device_id.map(|id| id.to_string()))
    .bind(serde_json::to_string(event_types).expect("serialize event types"))
    .bind(serde_json::to_string(retry).expect("serialize retry config"))
    .execute(pool)
    .await
    .expect("insert subscription");
    id
}

pub async fn seed_device(store: &SqliteStore, project_id: &str, host_name: &str) -> Device {
    let now = Utc::now();
    let device = Device {
        uid: Uuid::new_v4(),
        project_id: project_id.to_string(),
        endpoint_id: None,
        host_name: host_name.to_string(),
        status: DeviceStatus::Offline,
        last_seen_at: now,
        created_at: now,
        updated_at: now,
    };
    DeviceRepository::create(store, &device)
        .await
        .expect("insert device");
    device
}
