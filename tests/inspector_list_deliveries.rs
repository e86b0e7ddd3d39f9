#![allow(clippy::expect_used, clippy::unwrap_used)]

mod common;

use std::collections::BTreeMap;

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use chrono::{DateTime, Duration, Utc};
use common::{seed_api_subscription, seed_endpoint, seed_project, setup_db_shared, store};
use courier::{
    config::GatewayConfig,
    handlers::router,
    ingest::ingest_event,
    inspector::ListDeliveriesParams,
    state::AppState,
    store::{EventDeliveryRepository, SqliteStore, StoreError},
    types::{DeliveryStatus, IngestEventRequest, RetryConfiguration},
};
use http_body_util::BodyExt;
use serde_json::json;
use tower::ServiceExt;
use uuid::Uuid;

async fn ingest_at(
    store: &SqliteStore,
    project_id: &str,
    event_type: &str,
    at: DateTime<Utc>,
) -> Uuid {
    let req = IngestEventRequest {
        event_type: event_type.to_string(),
        data: json!({ "n": 1 }),
        endpoint_id: None,
        headers: BTreeMap::new(),
    };
    let response = ingest_event(store, store, store, project_id, req, at)
        .await
        .expect("ingest");
    response.deliveries[0]
}

fn params(limit: i64) -> ListDeliveriesParams {
    ListDeliveriesParams {
        limit,
        before: None,
        status: None,
        project_id: None,
        endpoint_id: None,
    }
}

async fn seed_project_with_endpoint(store: &SqliteStore, event_types: &[&str]) -> (String, String) {
    let pool = store.pool();
    let project_id = seed_project(pool, None).await;
    let endpoint_id = seed_endpoint(pool, &project_id, "https://example.com/hook").await;
    seed_api_subscription(
        pool,
        &project_id,
        &endpoint_id,
        event_types,
        &RetryConfiguration::default(),
    )
    .await;
    (project_id, endpoint_id)
}

#[tokio::test]
async fn list_returns_empty_when_no_deliveries() {
    let db = setup_db_shared(1).await;
    let store = store(&db.pool);

    let page = store.list(&params(50)).await.expect("list");

    assert!(page.deliveries.is_empty());
    assert!(page.next_before.is_none());
}

#[tokio::test]
async fn list_orders_newest_first_and_paginates() {
    let db = setup_db_shared(1).await;
    let store = store(&db.pool);
    let (project_id, _) = seed_project_with_endpoint(&store, &["*"]).await;

    let now = Utc::now();
    let mut ids = Vec::new();
    for i in 0..5 {
        ids.push(ingest_at(&store, &project_id, "order.placed", now - Duration::seconds(i)).await);
    }

    let first = store.list(&params(2)).await.expect("first page");
    assert_eq!(first.deliveries.len(), 2);
    assert_eq!(first.deliveries[0].uid, ids[0]);
    assert_eq!(first.deliveries[1].uid, ids[1]);

    let second = store
        .list(&ListDeliveriesParams {
            before: first.next_before.clone(),
            ..params(2)
        })
        .await
        .expect("second page");
    assert_eq!(second.deliveries.len(), 2);
    assert_eq!(second.deliveries[0].uid, ids[2]);
    assert_eq!(second.deliveries[1].uid, ids[3]);

    let last = store
        .list(&ListDeliveriesParams {
            before: second.next_before.clone(),
            ..params(2)
        })
        .await
        .expect("last page");
    assert_eq!(last.deliveries.len(), 1);
    assert_eq!(last.deliveries[0].uid, ids[4]);
    assert!(last.next_before.is_none());
}

#[tokio::test]
async fn cursor_is_stable_when_timestamps_tie() {
    let db = setup_db_shared(1).await;
    let store = store(&db.pool);
    let (project_id, _) = seed_project_with_endpoint(&store, &["*"]).await;

    let at = Utc::now();
    let mut ids = Vec::new();
    for _ in 0..4 {
        ids.push(ingest_at(&store, &project_id, "order.placed", at).await);
    }

    let mut seen = Vec::new();
    let mut before = None;
    loop {
        let page = store
            .list(&ListDeliveriesParams {
                before: before.clone(),
                ..params(3)
            })
            .await
            .expect("page");
        seen.extend(page.deliveries.iter().map(|d| d.uid));
        before = page.next_before;
        if before.is_none() {
            break;
        }
    }

    ids.sort();
    let mut sorted_seen = seen.clone();
    sorted_seen.sort();
    assert_eq!(sorted_seen, ids, "every delivery listed exactly once");
}

#[tokio::test]
async fn list_filters_by_status_and_endpoint() {
    let db = setup_db_shared(1).await;
    let store = store(&db.pool);
    let (project_id, invoice_endpoint) = seed_project_with_endpoint(&store, &["invoice.*"]).await;
    let payment_endpoint = seed_endpoint(&db.pool, &project_id, "https://pay.example.com").await;
    seed_api_subscription(
        &db.pool,
        &project_id,
        &payment_endpoint,
        &["payment.*"],
        &RetryConfiguration::default(),
    )
    .await;

    let now = Utc::now();
    let invoice = ingest_at(&store, &project_id, "invoice.created", now).await;
    let payment = ingest_at(&store, &project_id, "payment.failed", now).await;
    store
        .update_status(payment, DeliveryStatus::Discarded)
        .await
        .expect("discard");

    let by_endpoint = store
        .list(&ListDeliveriesParams {
            endpoint_id: Some(invoice_endpoint),
            ..params(50)
        })
        .await
        .expect("by endpoint");
    assert_eq!(by_endpoint.deliveries.len(), 1);
    assert_eq!(by_endpoint.deliveries[0].uid, invoice);

    let discarded = store
        .list(&ListDeliveriesParams {
            status: Some(DeliveryStatus::Discarded),
            project_id: Some(project_id.clone()),
            ..params(50)
        })
        .await
        .expect("by status");
    assert_eq!(discarded.deliveries.len(), 1);
    assert_eq!(discarded.deliveries[0].uid, payment);
    assert_eq!(discarded.deliveries[0].endpoint_id.as_deref(), Some(payment_endpoint.as_str()));
}

#[tokio::test]
async fn attempts_of_unknown_delivery_is_not_found() {
    let db = setup_db_shared(1).await;
    let store = store(&db.pool);

    let err = store
        .list_attempts(Uuid::new_v4())
        .await
        .expect_err("unknown delivery");

    assert!(matches!(err, StoreError::NotFound(message) if message == "event delivery not found"));
}

#[tokio::test]
async fn http_listing_round_trips_the_cursor() {
    let db = setup_db_shared(1).await;
    let store = store(&db.pool);
    let (project_id, _) = seed_project_with_endpoint(&store, &["*"]).await;
    let now = Utc::now();
    for i in 0..3 {
        ingest_at(&store, &project_id, "user.created", now - Duration::seconds(i)).await;
    }

    let (state, _hub) = AppState::new(db.pool.clone(), GatewayConfig::default());
    let app = router(state);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/deliveries?limit=2")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["deliveries"].as_array().map(Vec::len), Some(2));
    let cursor = body["next_before"].as_str().expect("cursor").to_string();

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/api/deliveries?limit=2&before={cursor}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["deliveries"].as_array().map(Vec::len), Some(1));
    assert!(body["next_before"].is_null());

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/deliveries?limit=500")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn http_attempts_rejects_malformed_id() {
    let db = setup_db_shared(1).await;
    let (state, _hub) = AppState::new(db.pool.clone(), GatewayConfig::default());

    let response = router(state)
        .oneshot(
            Request::builder()
                .uri("/api/deliveries/not-a-uuid/attempts")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
