use chrono::{DateTime, Utc};
use tracing::{debug, info};
use uuid::Uuid;

use crate::store::{EventDeliveryRepository, EventRepository, StoreError, SubscriptionRepository};
use crate::types::{
    CliMetadata, DeliveryMetadata, DeliveryStatus, Event, EventDelivery, IngestEventRequest,
    IngestEventResponse, Subscription, SubscriptionKind,
};

/// Persists an event and creates one delivery per matching subscription.
///
/// API deliveries start `Scheduled` for the dispatcher. CLI deliveries start
/// `Discarded`: the stream hub pushes them from the change feed and only an
/// ack settles them, so an unacked one stays eligible for since-resend.
pub async fn ingest_event(
    events: &dyn EventRepository,
    subscriptions: &dyn SubscriptionRepository,
    deliveries: &dyn EventDeliveryRepository,
    project_id: &str,
    req: IngestEventRequest,
    now: DateTime<Utc>,
) -> Result<IngestEventResponse, StoreError> {
    let data = serde_json::to_string(&req.data)
        .map_err(|err| StoreError::Parse(format!("invalid event data: {err}")))?;
    let event = Event {
        id: Uuid::new_v4(),
        project_id: project_id.to_string(),
        event_type: req.event_type,
        endpoint_id: req.endpoint_id,
        headers: req.headers,
        data,
        created_at: now,
    };
    events.create(&event).await?;

    let matched = subscriptions
        .find_for_event(project_id, &event.event_type, event.endpoint_id.as_deref())
        .await?;

    let mut created = Vec::with_capacity(matched.len());
    for subscription in &matched {
        let Some(delivery) = delivery_for(&event, subscription, now) else {
            debug!(subscription_id = %subscription.id, "subscription has no target, skipped");
            continue;
        };
        deliveries.create(&delivery).await?;
        created.push(delivery.uid);
    }

    info!(
        event_id = %event.id,
        project_id,
        event_type = %event.event_type,
        deliveries = created.len(),
        "event ingested"
    );

    Ok(IngestEventResponse {
        event_id: event.id,
        deliveries: created,
    })
}

fn delivery_for(
    event: &Event,
    subscription: &Subscription,
    now: DateTime<Utc>,
) -> Option<EventDelivery> {
    let (status, endpoint_id, cli_metadata) = match subscription.kind {
        SubscriptionKind::Api => (
            DeliveryStatus::Scheduled,
            Some(subscription.endpoint_id.clone()?),
            None,
        ),
        SubscriptionKind::Cli => (
            DeliveryStatus::Discarded,
            subscription.endpoint_id.clone(),
            Some(CliMetadata {
                event_type: event.event_type.clone(),
                device_id: subscription.device_id?,
            }),
        ),
    };

    Some(EventDelivery {
        uid: Uuid::new_v4(),
        project_id: event.project_id.clone(),
        event_id: event.id,
        subscription_id: subscription.id.clone(),
        endpoint_id,
        event_type: event.event_type.clone(),
        status,
        headers: event.headers.clone(),
        metadata: DeliveryMetadata {
            data: event.data.clone(),
            retry: subscription.retry_config.clone(),
            num_trials: 0,
            next_send_time: now,
        },
        cli_metadata,
        attempts: Vec::new(),
        description: None,
        created_at: now,
        updated_at: now,
    })
}
