use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, error, info};

use super::{EVENT_PROCESSOR, EVENT_QUEUE, Job, Queue, RetryError};
use crate::interval::TimeRange;
use crate::store::EventDeliveryRepository;
use crate::types::DeliveryStatus;

/// Re-enqueues every delivery in `statuses` created inside `range`, ignoring
/// the backoff schedule. Returns how many jobs were written.
pub async fn requeue_by_status_and_time(
    deliveries: &dyn EventDeliveryRepository,
    queue: &dyn Queue,
    statuses: &[DeliveryStatus],
    range: &TimeRange,
) -> Result<usize, RetryError> {
    let ids = deliveries.find_for_requeue(statuses, range).await?;
    for id in &ids {
        queue
            .write(EVENT_PROCESSOR, EVENT_QUEUE, Job::for_delivery(*id))
            .await?;
    }

    info!(
        count = ids.len(),
        start = %range.start,
        end = %range.end,
        "requeued deliveries"
    );
    Ok(ids.len())
}

/// Background loop moving due `Retry` deliveries back onto the queue.
pub struct RetryPoller {
    deliveries: Arc<dyn EventDeliveryRepository>,
    queue: Arc<dyn Queue>,
    interval: std::time::Duration,
    batch_size: i64,
}

impl RetryPoller {
    pub fn new(
        deliveries: Arc<dyn EventDeliveryRepository>,
        queue: Arc<dyn Queue>,
        interval: std::time::Duration,
        batch_size: i64,
    ) -> Self {
        Self {
            deliveries,
            queue,
            interval,
            batch_size: batch_size.max(1),
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.poll_once(Utc::now()).await {
                        error!(error = %err, "retry poll failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("retry poller stopping");
                        break;
                    }
                }
            }
        }
    }

    /// Enqueues up to one batch of due retries.
    pub async fn poll_once(&self, now: DateTime<Utc>) -> Result<usize, RetryError> {
        let due = self.deliveries.find_due_retries(now, self.batch_size).await?;
        for id in &due {
            self.queue
                .write(EVENT_PROCESSOR, EVENT_QUEUE, Job::for_delivery(*id))
                .await?;
            debug!(delivery_id = %id, "retry due, re-enqueued");
        }
        Ok(due.len())
    }
}
