//! Backoff scheduling and re-enqueueing of failed deliveries.

mod policy;
mod queue;
mod requeue;

pub use policy::{RetrySchedule, delay_for, schedule_deferral, schedule_next};
pub use queue::{
    ChannelQueue, EVENT_PROCESSOR, EVENT_QUEUE, Job, Queue, QueueError, QueuedJob, REQUEUEABLE,
    StoreQueue,
};
pub use requeue::{RetryPoller, requeue_by_status_and_time};

use crate::interval::IntervalError;
use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum RetryError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Interval(#[from] IntervalError),
}
