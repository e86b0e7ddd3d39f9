use tokio::sync::broadcast;
use tracing::debug;

use crate::types::EventDelivery;

/// Change feed of newly persisted deliveries.
///
/// Subscribers that fall behind lose the oldest entries; the stream hub
/// recovers those through since-resend, so the feed holds no history.
#[derive(Clone)]
pub struct DeliveryFeed {
    tx: broadcast::Sender<EventDelivery>,
}

impl DeliveryFeed {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventDelivery> {
        self.tx.subscribe()
    }

    pub fn publish(&self, delivery: EventDelivery) {
        if self.tx.send(delivery).is_err() {
            debug!("delivery feed has no subscribers");
        }
    }
}

impl Default for DeliveryFeed {
    fn default() -> Self {
        Self::new(1024)
    }
}
