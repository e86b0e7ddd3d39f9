use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::store::{EventDeliveryRepository, StoreError};
use crate::types::DeliveryStatus;

pub const EVENT_PROCESSOR: &str = "EventProcessor";
pub const EVENT_QUEUE: &str = "EventQueue";

/// Statuses a delivery may be re-enqueued from. In-flight deliveries are
/// never duplicated.
pub const REQUEUEABLE: [DeliveryStatus; 5] = [
    DeliveryStatus::Scheduled,
    DeliveryStatus::Retry,
    DeliveryStatus::Failed,
    DeliveryStatus::Success,
    DeliveryStatus::Discarded,
];

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue store error: {0}")]
    Store(#[from] StoreError),
    #[error("queue {0} is closed")]
    Closed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub delivery_id: Uuid,
}

impl Job {
    pub fn for_delivery(delivery_id: Uuid) -> Self {
        Self {
            id: format!("{delivery_id}:{}", Uuid::new_v4()),
            delivery_id,
        }
    }
}

#[async_trait]
pub trait Queue: Send + Sync {
    async fn write(&self, processor: &str, queue: &str, job: Job) -> Result<(), QueueError>;
}

/// Uses the delivery table itself as the durable queue: writing a job makes
/// the delivery due now, and the dispatcher lease picks it up.
pub struct StoreQueue {
    deliveries: Arc<dyn EventDeliveryRepository>,
}

impl StoreQueue {
    pub fn new(deliveries: Arc<dyn EventDeliveryRepository>) -> Self {
        Self { deliveries }
    }
}

#[async_trait]
impl Queue for StoreQueue {
    async fn write(&self, processor: &str, queue: &str, job: Job) -> Result<(), QueueError> {
        let scheduled = self
            .deliveries
            .mark_scheduled(job.delivery_id, &REQUEUEABLE, Utc::now())
            .await?;
        if !scheduled {
            debug!(
                processor,
                queue,
                delivery_id = %job.delivery_id,
                "delivery no longer requeueable, job dropped"
            );
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedJob {
    pub processor: String,
    pub queue: String,
    pub job: Job,
}

/// In-process queue feeding a tokio channel.
#[derive(Clone)]
pub struct ChannelQueue {
    tx: mpsc::Sender<QueuedJob>,
}

impl ChannelQueue {
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<QueuedJob>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl Queue for ChannelQueue {
    async fn write(&self, processor: &str, queue: &str, job: Job) -> Result<(), QueueError> {
        self.tx
            .send(QueuedJob {
                processor: processor.to_string(),
                queue: queue.to_string(),
                job,
            })
            .await
            .map_err(|_| QueueError::Closed(queue.to_string()))
    }
}
