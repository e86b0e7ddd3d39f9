//! Websocket fan-out of CLI deliveries to connected devices.
//!
//! Delivery to a device is best effort. The durable record is the delivery
//! row: a device that missed events asks for a since-resend, and an ack
//! settles the delivery.

mod client;
mod filter;
mod hub;

pub use client::{Client, ControlMessage, DeviceSink, SinceBound, parse_control_message};
pub use filter::{event_type_filters, matches_event_type};
pub use hub::{Hub, HubHandle};

use crate::interval::IntervalError;
use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Interval(#[from] IntervalError),
    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("send to device failed: {0}")]
    Send(String),
    #[error("{0}")]
    InvalidMessage(String),
    #[error("stream hub is not running")]
    Closed,
}
