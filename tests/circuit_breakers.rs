#![allow(clippy::expect_used, clippy::unwrap_used)]

mod common;

use chrono::{Duration, Utc};
use common::{seed_endpoint, seed_project, setup_db_shared, store};
use courier::{
    admin::{self, AdminError, BreakerConfigUpdate},
    breaker::{BreakerStore, SqliteBreakerStore, Transition, breaker_key},
    config::GatewayConfig,
    state::breaker_manager,
    store::ProjectRepository,
    types::{BreakerState, CircuitBreaker, CircuitBreakerConfig},
};

fn snapshot(tenant_id: &str, project_id: &str) -> CircuitBreaker {
    CircuitBreaker {
        key: breaker_key(tenant_id),
        tenant_id: tenant_id.to_string(),
        project_id: project_id.to_string(),
        state: BreakerState::Closed,
        requests: 3,
        total_failures: 1,
        total_successes: 2,
        consecutive_failures: 0,
        failure_rate: 100.0 / 3.0,
        success_rate: 200.0 / 3.0,
        notifications_sent: 0,
        will_reset_at: None,
        probes_issued: 0,
        probe_deadline: None,
        window: Vec::new(),
        updated_at: Utc::now(),
    }
}

#[tokio::test]
async fn sqlite_store_expires_entries_after_ttl() {
    let db = setup_db_shared(1).await;
    let breakers = SqliteBreakerStore::new(db.pool.clone());
    let now = Utc::now();
    let breaker = snapshot("ep-1", "proj-1");

    breakers
        .set(&breaker, Duration::minutes(10), now)
        .await
        .expect("set");

    let fresh = breakers
        .get(&breaker.key, now + Duration::minutes(9))
        .await
        .expect("get fresh");
    assert_eq!(fresh.map(|b| b.requests), Some(3));

    let expired = breakers
        .get(&breaker.key, now + Duration::minutes(10))
        .await
        .expect("get expired");
    assert!(expired.is_none());

    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM circuit_breakers")
        .fetch_one(&db.pool)
        .await
        .expect("count");
    assert_eq!(count, 0, "expired row purged on read");
}

#[tokio::test]
async fn sqlite_store_deletes_by_project_only() {
    let db = setup_db_shared(1).await;
    let breakers = SqliteBreakerStore::new(db.pool.clone());
    let now = Utc::now();

    for (tenant, project) in [("ep-1", "proj-a"), ("ep-2", "proj-a"), ("ep-3", "proj-b")] {
        breakers
            .set(&snapshot(tenant, project), Duration::hours(1), now)
            .await
            .expect("set");
    }

    let removed = breakers.delete_by_project("proj-a").await.expect("delete");
    assert_eq!(removed, 2);
    assert!(breakers.get(&breaker_key("ep-1"), now).await.expect("get").is_none());
    assert!(breakers.get(&breaker_key("ep-3"), now).await.expect("get").is_some());

    assert!(breakers.delete(&breaker_key("ep-3")).await.expect("delete one"));
    assert!(!breakers.delete(&breaker_key("ep-3")).await.expect("delete again"));
}

#[tokio::test]
async fn get_unknown_breaker_reports_not_found() {
    let db = setup_db_shared(1).await;
    let store = store(&db.pool);
    let breakers = breaker_manager(&store, &GatewayConfig::default());

    let err = admin::get_breaker(&breakers, "ep-missing")
        .await
        .expect_err("no breaker");

    assert_eq!(err.to_string(), "circuit breaker not found");
}

#[tokio::test]
async fn update_persists_config_and_resets_project_breakers() {
    let db = setup_db_shared(1).await;
    let store = store(&db.pool);
    let initial = CircuitBreakerConfig {
        failure_threshold: 100,
        minimum_request_count: 2,
        consecutive_failure_threshold: 0,
        ..CircuitBreakerConfig::default()
    };
    let project_id = seed_project(&db.pool, Some(&initial)).await;
    let endpoint_id = seed_endpoint(&db.pool, &project_id, "https://a.example.com").await;
    let breakers = breaker_manager(&store, &GatewayConfig::default());

    // one success and one failure: 50% stays under the 100% threshold
    let now = Utc::now();
    breakers
        .record_result_at(&project_id, &endpoint_id, true, true, now)
        .await
        .expect("record success");
    let transition = breakers
        .record_result_at(&project_id, &endpoint_id, false, true, now)
        .await
        .expect("record failure");
    assert_eq!(transition, None);

    let summary = admin::get_breaker(&breakers, &endpoint_id)
        .await
        .expect("get breaker");
    assert_eq!(summary.state, BreakerState::Closed);
    assert_eq!(summary.requests, 2);
    assert_eq!(summary.key, format!("breaker:{endpoint_id}"));

    let update = BreakerConfigUpdate {
        failure_threshold: Some(70),
        ..BreakerConfigUpdate::default()
    };
    let outcome = admin::update_breaker_config(&store, &breakers, &project_id, &update)
        .await
        .expect("update");
    assert_eq!(outcome.breakers_reset, 1);
    assert_eq!(outcome.config.failure_threshold, 70);
    assert_eq!(outcome.config.minimum_request_count, 2);

    let stored = store
        .circuit_breaker_config(&project_id)
        .await
        .expect("stored config");
    assert_eq!(stored, outcome.config);
    assert!(admin::get_breaker(&breakers, &endpoint_id).await.is_err());

    // the new threshold applies on the next breach evaluation
    breakers
        .record_result_at(&project_id, &endpoint_id, false, true, now)
        .await
        .expect("record failure");
    let transition = breakers
        .record_result_at(&project_id, &endpoint_id, false, true, now)
        .await
        .expect("record failure");
    assert_eq!(transition, Some(Transition::Opened));
    let summary = admin::get_breaker(&breakers, &endpoint_id)
        .await
        .expect("get breaker");
    assert_eq!(summary.state, BreakerState::Open);
    assert_eq!(summary.notifications_sent, 1);
}

#[tokio::test]
async fn update_rejects_out_of_range_values_without_writing() {
    let db = setup_db_shared(1).await;
    let store = store(&db.pool);
    let project_id = seed_project(&db.pool, None).await;
    let breakers = breaker_manager(&store, &GatewayConfig::default());

    let update = BreakerConfigUpdate {
        failure_threshold: Some(101),
        ..BreakerConfigUpdate::default()
    };
    let err = admin::update_breaker_config(&store, &breakers, &project_id, &update)
        .await
        .expect_err("out of range");
    assert!(matches!(err, AdminError::Validation(_)));
    assert_eq!(err.to_string(), "failure_threshold must be between 0 and 100");

    let window = BreakerConfigUpdate {
        observability_window: Some(0),
        ..BreakerConfigUpdate::default()
    };
    assert!(matches!(
        admin::update_breaker_config(&store, &breakers, &project_id, &window).await,
        Err(AdminError::Validation(_))
    ));

    let stored = store
        .circuit_breaker_config(&project_id)
        .await
        .expect("config");
    assert_eq!(stored, CircuitBreakerConfig::default());
}

#[tokio::test]
async fn update_of_unknown_project_fails() {
    let db = setup_db_shared(1).await;
    let store = store(&db.pool);
    let breakers = breaker_manager(&store, &GatewayConfig::default());

    let update = BreakerConfigUpdate {
        success_threshold: Some(80),
        ..BreakerConfigUpdate::default()
    };
    let err = admin::update_breaker_config(&store, &breakers, "proj-missing", &update)
        .await
        .expect_err("unknown project");

    assert_eq!(err.to_string(), "project not found");
}
