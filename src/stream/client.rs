use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use chrono::{DateTime, Duration, Utc};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, Stream, StreamExt};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{HubHandle, StreamError, event_type_filters, matches_event_type};
use crate::interval::parse_duration;
use crate::store::{DeviceRepository, EventDeliveryRepository};
use crate::types::{AckMessage, CliEvent, DeliveryStatus, Device, DeviceStatus};

/// Write half of a device connection.
#[async_trait]
pub trait DeviceSink: Send {
    async fn send_binary(&mut self, payload: Vec<u8>) -> Result<(), StreamError>;

    async fn close(&mut self) -> Result<(), StreamError>;
}

#[async_trait]
impl DeviceSink for SplitSink<WebSocket, Message> {
    async fn send_binary(&mut self, payload: Vec<u8>) -> Result<(), StreamError> {
        self.send(Message::Binary(payload))
            .await
            .map_err(|err| StreamError::Send(err.to_string()))
    }

    async fn close(&mut self) -> Result<(), StreamError> {
        SinkExt::close(self)
            .await
            .map_err(|err| StreamError::Send(err.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    Disconnect,
    Since(SinceBound),
    Ack(Uuid),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinceBound {
    Duration(Duration),
    Timestamp(DateTime<Utc>),
}

impl SinceBound {
    pub fn lower_bound(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            SinceBound::Duration(duration) => now - *duration,
            SinceBound::Timestamp(at) => *at,
        }
    }
}

pub fn parse_control_message(text: &str) -> Result<ControlMessage, StreamError> {
    let text = text.trim();
    if text == "disconnect" {
        return Ok(ControlMessage::Disconnect);
    }
    if let Some(raw) = text.strip_prefix("since:duration:") {
        return Ok(ControlMessage::Since(SinceBound::Duration(parse_duration(
            raw,
        )?)));
    }
    if let Some(raw) = text.strip_prefix("since:timestamp:") {
        let at = DateTime::parse_from_rfc3339(raw.trim())
            .map_err(|err| StreamError::InvalidMessage(format!("invalid since timestamp: {err}")))?;
        return Ok(ControlMessage::Since(SinceBound::Timestamp(
            at.with_timezone(&Utc),
        )));
    }

    serde_json::from_str::<AckMessage>(text)
        .map(|ack| ControlMessage::Ack(ack.uid))
        .map_err(|_| StreamError::InvalidMessage(format!("unrecognised message {text:?}")))
}

/// One connected device.
///
/// The hub owns membership; the client owns the device record. Status
/// changes go through `device`, a lock separate from the hub's map.
pub struct Client {
    device_id: Uuid,
    project_id: String,
    endpoint_id: Option<String>,
    event_types: Vec<String>,
    device: Mutex<Device>,
    sink: Mutex<Box<dyn DeviceSink>>,
    deliveries: Arc<dyn EventDeliveryRepository>,
    devices: Arc<dyn DeviceRepository>,
    hub: HubHandle,
    max_last_seen: Duration,
}

impl Client {
    pub fn new(
        device: Device,
        sink: Box<dyn DeviceSink>,
        event_types: Vec<String>,
        deliveries: Arc<dyn EventDeliveryRepository>,
        devices: Arc<dyn DeviceRepository>,
        hub: HubHandle,
        max_last_seen: Duration,
    ) -> Arc<Self> {
        let event_types = event_type_filters(event_types);

        Arc::new(Self {
            device_id: device.uid,
            project_id: device.project_id.clone(),
            endpoint_id: device.endpoint_id.clone(),
            event_types,
            device: Mutex::new(device),
            sink: Mutex::new(sink),
            deliveries,
            devices,
            hub,
            max_last_seen,
        })
    }

    pub fn device_id(&self) -> Uuid {
        self.device_id
    }

    pub fn event_types(&self) -> &[String] {
        &self.event_types
    }

    pub async fn device(&self) -> Device {
        self.device.lock().await.clone()
    }

    pub async fn is_online(&self, now: DateTime<Utc>) -> bool {
        let device = self.device.lock().await;
        now - device.last_seen_at < self.max_last_seen
    }

    /// Whether `event` is in scope for this device: same project, same
    /// endpoint when the device is scoped to one, and an accepted type.
    pub fn accepts(&self, event: &CliEvent) -> bool {
        if event.project_id != self.project_id {
            return false;
        }
        if let Some(endpoint_id) = &self.endpoint_id
            && event.app_id.as_deref() != Some(endpoint_id.as_str())
        {
            return false;
        }
        matches_event_type(&self.event_types, &event.event_type)
    }

    /// Records a sign of life and marks the device online.
    pub async fn touch(&self, now: DateTime<Utc>) -> Result<(), StreamError> {
        let mut device = self.device.lock().await;
        let was_offline = device.status == DeviceStatus::Offline;
        device.last_seen_at = now;
        device.status = DeviceStatus::Online;
        device.updated_at = now;
        self.devices
            .update_last_seen(self.device_id, DeviceStatus::Online, now)
            .await?;
        if was_offline {
            info!(device_id = %self.device_id, "device online");
        }
        Ok(())
    }

    pub async fn mark_offline(&self) -> Result<(), StreamError> {
        let mut device = self.device.lock().await;
        if device.status == DeviceStatus::Offline {
            return Ok(());
        }
        device.status = DeviceStatus::Offline;
        self.devices
            .update_last_seen(self.device_id, DeviceStatus::Offline, device.last_seen_at)
            .await?;
        info!(device_id = %self.device_id, "device offline");
        Ok(())
    }

    pub async fn send_event(&self, event: &CliEvent) -> Result<(), StreamError> {
        let payload = serde_json::to_vec(event)?;
        self.sink.lock().await.send_binary(payload).await
    }

    pub async fn close(&self) {
        if let Err(err) = self.sink.lock().await.close().await {
            debug!(device_id = %self.device_id, error = %err, "closing device connection failed");
        }
    }

    /// Re-emits every discarded delivery for this device created at or after
    /// `since`. Read-only; repeating it emits the same set.
    pub async fn resend_since(&self, since: DateTime<Utc>) -> Result<usize, StreamError> {
        let deliveries = self
            .deliveries
            .find_discarded_since(&self.project_id, self.device_id, since)
            .await?;

        let mut sent = 0;
        for event in deliveries.iter().filter_map(CliEvent::from_delivery) {
            self.hub.emit(event).await?;
            sent += 1;
        }
        info!(device_id = %self.device_id, %since, sent, "since-resend queued");
        Ok(sent)
    }

    /// Settles an acknowledged delivery as `Success`.
    pub async fn acknowledge(&self, uid: Uuid) -> Result<(), StreamError> {
        let delivery = self.deliveries.find(uid).await?;
        let owned = delivery
            .cli_metadata
            .as_ref()
            .is_some_and(|cli| cli.device_id == self.device_id);
        if !owned {
            return Err(StreamError::InvalidMessage(format!(
                "delivery {uid} is not routed to this device"
            )));
        }
        if delivery.status == DeliveryStatus::Success {
            return Ok(());
        }
        self.deliveries
            .update_status(uid, DeliveryStatus::Success)
            .await?;
        debug!(device_id = %self.device_id, delivery_id = %uid, "delivery acknowledged");
        Ok(())
    }

    /// Single reader for the connection. Returns once the peer closes,
    /// errors, or asks to disconnect; the device is then unregistered, and
    /// offline unless a newer connection has taken over.
    pub async fn read_pump<S>(self: Arc<Self>, mut stream: S)
    where
        S: Stream<Item = Result<Message, axum::Error>> + Unpin + Send,
    {
        while let Some(frame) = stream.next().await {
            match frame {
                // the websocket layer answers pings itself
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {
                    if let Err(err) = self.touch(Utc::now()).await {
                        warn!(device_id = %self.device_id, error = %err, "failed to record heartbeat");
                    }
                }
                Ok(Message::Text(text)) => {
                    if !self.handle_text(&text).await {
                        break;
                    }
                }
                Ok(Message::Binary(_)) => {
                    debug!(device_id = %self.device_id, "ignoring binary frame from device");
                }
                Ok(Message::Close(_)) => break,
                Err(err) => {
                    debug!(device_id = %self.device_id, error = %err, "device connection error");
                    break;
                }
            }
        }

        self.shutdown().await;
    }

    /// Returns false when the connection should end.
    async fn handle_text(self: &Arc<Self>, text: &str) -> bool {
        match parse_control_message(text) {
            Ok(ControlMessage::Disconnect) => {
                info!(device_id = %self.device_id, "device requested disconnect");
                false
            }
            Ok(ControlMessage::Since(bound)) => {
                let since = bound.lower_bound(Utc::now());
                let client = Arc::clone(self);
                tokio::spawn(async move {
                    if let Err(err) = client.resend_since(since).await {
                        warn!(device_id = %client.device_id, error = %err, "since-resend failed");
                    }
                });
                true
            }
            Ok(ControlMessage::Ack(uid)) => {
                if let Err(err) = self.acknowledge(uid).await {
                    warn!(device_id = %self.device_id, delivery_id = %uid, error = %err, "ack rejected");
                }
                true
            }
            Err(err) => {
                warn!(device_id = %self.device_id, error = %err, "invalid device message");
                true
            }
        }
    }

    async fn shutdown(self: Arc<Self>) {
        // the device row belongs to the newer connection once superseded
        if self.hub.is_superseded(&self).await {
            debug!(device_id = %self.device_id, "superseded connection closed");
        } else if let Err(err) = self.mark_offline().await {
            warn!(device_id = %self.device_id, error = %err, "failed to mark device offline");
        }
        self.hub.unregister(Arc::clone(&self));
        self.close().await;
    }
}
