use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::{RwLock, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{Client, StreamError};
use crate::store::DeliveryFeed;
use crate::types::{CliEvent, EventDelivery};

type ClientMap = Arc<RwLock<HashMap<Uuid, Arc<Client>>>>;

enum HubCommand {
    Register(Arc<Client>),
    Unregister(Arc<Client>),
}

/// Cloneable front of a running hub. Request handlers and clients only ever
/// send commands; the map is written by the membership task alone.
#[derive(Clone)]
pub struct HubHandle {
    commands: mpsc::UnboundedSender<HubCommand>,
    events: mpsc::Sender<CliEvent>,
    clients: ClientMap,
}

impl HubHandle {
    pub fn register(&self, client: Arc<Client>) -> Result<(), StreamError> {
        self.commands
            .send(HubCommand::Register(client))
            .map_err(|_| StreamError::Closed)
    }

    pub fn unregister(&self, client: Arc<Client>) {
        if self.commands.send(HubCommand::Unregister(client)).is_err() {
            debug!("hub already stopped, unregister dropped");
        }
    }

    /// Queues an event for the sender task.
    pub async fn emit(&self, event: CliEvent) -> Result<(), StreamError> {
        self.events.send(event).await.map_err(|_| StreamError::Closed)
    }

    pub async fn is_registered(&self, device_id: Uuid) -> bool {
        self.clients.read().await.contains_key(&device_id)
    }

    /// Whether another connection for the same device has replaced `client`.
    pub async fn is_superseded(&self, client: &Arc<Client>) -> bool {
        self.clients
            .read()
            .await
            .get(&client.device_id())
            .is_some_and(|registered| !Arc::ptr_eq(registered, client))
    }

    pub async fn connected(&self) -> usize {
        self.clients.read().await.len()
    }
}

/// Routes CLI deliveries from the change feed to connected devices.
pub struct Hub {
    handle: HubHandle,
    commands: mpsc::UnboundedReceiver<HubCommand>,
    events: mpsc::Receiver<CliEvent>,
    feed: DeliveryFeed,
}

impl Hub {
    pub fn new(feed: DeliveryFeed, event_buffer: usize) -> Self {
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (events_tx, events) = mpsc::channel(event_buffer.max(1));

        Self {
            handle: HubHandle {
                commands: commands_tx,
                events: events_tx,
                clients: Arc::new(RwLock::new(HashMap::new())),
            },
            commands,
            events,
            feed,
        }
    }

    pub fn handle(&self) -> HubHandle {
        self.handle.clone()
    }

    /// Starts the membership, watcher and sender tasks. All three stop when
    /// `shutdown` flips to true; open connections are closed on the way out.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let Hub {
            handle,
            commands,
            events,
            feed,
        } = self;

        let membership = tokio::spawn(run_membership(
            handle.clients.clone(),
            commands,
            shutdown.clone(),
        ));
        let watcher = tokio::spawn(run_watcher(
            feed.subscribe(),
            handle.events.clone(),
            shutdown.clone(),
        ));
        let sender = tokio::spawn(run_sender(handle.clone(), events, shutdown));

        vec![membership, watcher, sender]
    }
}

async fn run_membership(
    clients: ClientMap,
    mut commands: mpsc::UnboundedReceiver<HubCommand>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(HubCommand::Register(client)) => {
                    let device_id = client.device_id();
                    let replaced = clients.write().await.insert(device_id, Arc::clone(&client));
                    info!(%device_id, event_types = ?client.event_types(), "device registered");
                    // a reconnecting device supersedes its stale connection
                    if let Some(previous) = replaced
                        && !Arc::ptr_eq(&previous, &client)
                    {
                        previous.close().await;
                    }
                }
                Some(HubCommand::Unregister(client)) => {
                    let device_id = client.device_id();
                    let mut map = clients.write().await;
                    let current = map
                        .get(&device_id)
                        .is_some_and(|registered| Arc::ptr_eq(registered, &client));
                    if current {
                        map.remove(&device_id);
                        info!(%device_id, "device unregistered");
                    }
                }
                None => break,
            },
            _ = shutdown.changed() => break,
        }
    }

    let drained: Vec<Arc<Client>> = clients.write().await.drain().map(|(_, c)| c).collect();
    for client in drained {
        client.close().await;
    }
    info!("hub membership stopped");
}

async fn run_watcher(
    mut feed: broadcast::Receiver<EventDelivery>,
    events: mpsc::Sender<CliEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            received = feed.recv() => match received {
                Ok(delivery) => {
                    let Some(event) = CliEvent::from_delivery(&delivery) else {
                        continue;
                    };
                    if events.send(event).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "hub fell behind the delivery feed, devices must resend since");
                }
                Err(RecvError::Closed) => break,
            },
            _ = shutdown.changed() => break,
        }
    }
    debug!("hub watcher stopped");
}

/// Single consumer: per-device ordering follows channel order.
async fn run_sender(
    hub: HubHandle,
    mut events: mpsc::Receiver<CliEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => deliver(&hub, event).await,
                None => break,
            },
            _ = shutdown.changed() => break,
        }
    }
    debug!("hub sender stopped");
}

async fn deliver(hub: &HubHandle, event: CliEvent) {
    let client = hub.clients.read().await.get(&event.device_id).cloned();
    let Some(client) = client else {
        debug!(device_id = %event.device_id, delivery_id = %event.uid, "device not connected");
        return;
    };

    if !client.is_online(Utc::now()).await {
        if let Err(err) = client.mark_offline().await {
            warn!(device_id = %event.device_id, error = %err, "failed to mark device offline");
        }
        debug!(device_id = %event.device_id, delivery_id = %event.uid, "device stale, skipping");
        return;
    }

    if !client.accepts(&event) {
        debug!(
            device_id = %event.device_id,
            event_type = %event.event_type,
            "event outside device scope"
        );
        return;
    }

    match client.send_event(&event).await {
        Ok(()) => debug!(device_id = %event.device_id, delivery_id = %event.uid, "event sent"),
        Err(err) => {
            warn!(device_id = %event.device_id, error = %err, "send failed, dropping device");
            hub.unregister(client);
        }
    }
}
