#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

mod common;

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::ws::Message;
use chrono::{Duration, Utc};
use common::{seed_cli_subscription, seed_device, seed_project, setup_db_shared, store};
use courier::{
    ingest::ingest_event,
    store::{DeviceRepository, EventDeliveryRepository, SqliteStore},
    stream::{Client, DeviceSink, Hub, HubHandle, StreamError},
    types::{CliEvent, DeliveryStatus, Device, DeviceStatus, IngestEventRequest},
};
use serde_json::json;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

#[derive(Debug)]
enum Frame {
    Event(CliEvent),
    Closed,
}

struct ChannelSink(mpsc::UnboundedSender<Frame>);

#[async_trait]
impl DeviceSink for ChannelSink {
    async fn send_binary(&mut self, payload: Vec<u8>) -> Result<(), StreamError> {
        let event: CliEvent = serde_json::from_slice(&payload)?;
        self.0
            .send(Frame::Event(event))
            .map_err(|err| StreamError::Send(err.to_string()))
    }

    async fn close(&mut self) -> Result<(), StreamError> {
        let _ = self.0.send(Frame::Closed);
        Ok(())
    }
}

struct Harness {
    store: SqliteStore,
    hub: HubHandle,
    project_id: String,
    device: Device,
    _shutdown: watch::Sender<bool>,
    _db: common::TestDb,
}

async fn harness(subscription_types: &[&str]) -> Harness {
    let db = setup_db_shared(2).await;
    let store = store(&db.pool);
    let project_id = seed_project(&db.pool, None).await;
    let device = seed_device(&store, &project_id, "dev-laptop").await;
    seed_cli_subscription(&db.pool, &project_id, device.uid, subscription_types).await;

    let hub = Hub::new(store.feed().clone(), 64);
    let handle = hub.handle();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    hub.spawn(shutdown_rx);

    Harness {
        store,
        hub: handle,
        project_id,
        device,
        _shutdown: shutdown_tx,
        _db: db,
    }
}

impl Harness {
    async fn connect(
        &self,
        event_types: &[&str],
        max_last_seen: Duration,
    ) -> (Arc<Client>, mpsc::UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let client = Client::new(
            self.device.clone(),
            Box::new(ChannelSink(tx)),
            event_types.iter().map(|t| t.to_string()).collect(),
            Arc::new(self.store.clone()),
            Arc::new(self.store.clone()),
            self.hub.clone(),
            max_last_seen,
        );
        client.touch(Utc::now()).await.expect("touch");
        self.hub.register(Arc::clone(&client)).expect("register");
        for _ in 0..100 {
            if self.hub.is_registered(self.device.uid).await {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert!(self.hub.is_registered(self.device.uid).await);
        (client, rx)
    }

    async fn ingest(&self, event_type: &str) -> Uuid {
        let req = IngestEventRequest {
            event_type: event_type.to_string(),
            data: json!({ "type": event_type }),
            endpoint_id: None,
            headers: BTreeMap::from([("x-source".to_string(), "test".to_string())]),
        };
        ingest_event(&self.store, &self.store, &self.store, &self.project_id, req, Utc::now())
            .await
            .expect("ingest")
            .deliveries[0]
    }
}

async fn next_frame(rx: &mut mpsc::UnboundedReceiver<Frame>) -> Option<Frame> {
    tokio::time::timeout(std::time::Duration::from_millis(500), rx.recv())
        .await
        .ok()
        .flatten()
}

async fn no_frame(rx: &mut mpsc::UnboundedReceiver<Frame>) -> bool {
    tokio::time::timeout(std::time::Duration::from_millis(150), rx.recv())
        .await
        .is_err()
}

#[tokio::test]
async fn device_receives_only_matching_event_types() {
    let h = harness(&["*"]).await;
    let (_client, mut rx) = h.connect(&["invoice.*"], Duration::seconds(10)).await;

    let invoice = h.ingest("invoice.created").await;
    let _payment = h.ingest("payment.failed").await;

    match next_frame(&mut rx).await {
        Some(Frame::Event(event)) => {
            assert_eq!(event.uid, invoice);
            assert_eq!(event.event_type, "invoice.created");
            assert_eq!(event.device_id, h.device.uid);
            assert_eq!(event.project_id, h.project_id);
            assert_eq!(event.headers.get("x-source").map(String::as_str), Some("test"));
        }
        other => panic!("expected invoice event, got {other:?}"),
    }
    assert!(no_frame(&mut rx).await, "payment.failed must be filtered");
}

#[tokio::test]
async fn ack_settles_delivery_as_success() {
    let h = harness(&["*"]).await;
    let (client, mut rx) = h.connect(&[], Duration::seconds(10)).await;

    let uid = h.ingest("invoice.created").await;
    assert!(matches!(next_frame(&mut rx).await, Some(Frame::Event(_))));
    assert_eq!(
        h.store.find(uid).await.expect("find").status,
        DeliveryStatus::Discarded,
        "unacked CLI delivery stays eligible for resend"
    );

    client.acknowledge(uid).await.expect("ack");
    assert_eq!(
        h.store.find(uid).await.expect("find").status,
        DeliveryStatus::Success
    );
    client.acknowledge(uid).await.expect("repeated ack is a no-op");

    let foreign = client.acknowledge(Uuid::new_v4()).await;
    assert!(foreign.is_err());
}

#[tokio::test]
async fn since_resend_recovers_missed_events_and_is_repeatable() {
    let h = harness(&["*"]).await;
    let start = Utc::now() - Duration::seconds(1);

    // device offline: nothing is delivered, nothing is lost
    let first = h.ingest("invoice.created").await;
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    let second = h.ingest("invoice.paid").await;
    // let the hub drop the live copies before the device connects
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    let (client, mut rx) = h.connect(&["invoice.*"], Duration::seconds(10)).await;
    assert!(no_frame(&mut rx).await);

    assert_eq!(client.resend_since(start).await.expect("resend"), 2);
    assert_eq!(client.resend_since(start).await.expect("resend again"), 2);

    let mut received = Vec::new();
    for _ in 0..4 {
        match next_frame(&mut rx).await {
            Some(Frame::Event(event)) => received.push(event.uid),
            other => panic!("expected resent event, got {other:?}"),
        }
    }
    let unique: HashSet<Uuid> = received.iter().copied().collect();
    assert_eq!(unique, HashSet::from([first, second]));
    assert_eq!(&received[..2], &[first, second], "resend is oldest first");

    client.acknowledge(first).await.expect("ack");
    assert_eq!(client.resend_since(start).await.expect("resend"), 1);
    assert!(matches!(
        next_frame(&mut rx).await,
        Some(Frame::Event(event)) if event.uid == second
    ));
}

#[tokio::test]
async fn stale_device_is_marked_offline_instead_of_sent_to() {
    let h = harness(&["*"]).await;
    let (client, mut rx) = h.connect(&["*"], Duration::zero()).await;

    h.ingest("invoice.created").await;

    assert!(no_frame(&mut rx).await);
    let device = h.store.fetch_by_id(h.device.uid).await.expect("device");
    assert_eq!(device.status, DeviceStatus::Offline);
    assert_eq!(client.device().await.status, DeviceStatus::Offline);
}

#[tokio::test]
async fn read_pump_handles_ack_then_disconnect() {
    let h = harness(&["*"]).await;
    let (client, mut rx) = h.connect(&["*"], Duration::seconds(10)).await;

    let uid = h.ingest("invoice.created").await;
    assert!(matches!(next_frame(&mut rx).await, Some(Frame::Event(_))));

    let frames: Vec<Result<Message, axum::Error>> = vec![
        Ok(Message::Ping(Vec::new())),
        Ok(Message::Text("not a control message".to_string())),
        Ok(Message::Text(json!({ "uid": uid }).to_string())),
        Ok(Message::Text("disconnect".to_string())),
        Ok(Message::Text(json!({ "uid": Uuid::new_v4() }).to_string())),
    ];
    client
        .clone()
        .read_pump(futures_util::stream::iter(frames))
        .await;

    assert_eq!(
        h.store.find(uid).await.expect("find").status,
        DeliveryStatus::Success
    );
    assert!(matches!(next_frame(&mut rx).await, Some(Frame::Closed)));
    assert_eq!(
        h.store.fetch_by_id(h.device.uid).await.expect("device").status,
        DeviceStatus::Offline
    );

    for _ in 0..100 {
        if !h.hub.is_registered(h.device.uid).await {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    assert!(!h.hub.is_registered(h.device.uid).await);
}

#[tokio::test]
async fn reconnect_supersedes_the_previous_connection() {
    let h = harness(&["*"]).await;
    let (old, mut old_rx) = h.connect(&["*"], Duration::seconds(10)).await;
    let (_new, mut new_rx) = h.connect(&["*"], Duration::seconds(10)).await;

    assert!(matches!(next_frame(&mut old_rx).await, Some(Frame::Closed)));

    // the old socket's reader winds down after the hub closed it
    let frames: Vec<Result<Message, axum::Error>> = vec![Ok(Message::Close(None))];
    old.clone()
        .read_pump(futures_util::stream::iter(frames))
        .await;
    assert_eq!(
        h.store.fetch_by_id(h.device.uid).await.expect("device").status,
        DeviceStatus::Online
    );

    let uid = h.ingest("invoice.created").await;
    assert!(matches!(
        next_frame(&mut new_rx).await,
        Some(Frame::Event(event)) if event.uid == uid
    ));

    // the stale client unregistering must not evict its successor
    h.hub.unregister(old);
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    assert!(h.hub.is_registered(h.device.uid).await);
    assert_eq!(h.hub.connected().await, 1);
}
