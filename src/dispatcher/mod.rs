//! Lease/report protocol between the gateway and its delivery workers.
//!
//! Workers lease due deliveries, perform the HTTP call themselves and report
//! the outcome. The breaker is consulted at lease time and fed at report
//! time; the retry policy decides what happens after a failure.

mod store;

pub use store::{claim_due, defer};

use std::sync::Arc;

use chrono::{Duration, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::breaker::CircuitBreakerManager;
use crate::retry::{schedule_deferral, schedule_next};
use crate::store::{AttemptUpdate, EventDeliveryRepository, StoreError};
use crate::types::{
    DeliveryAttempt, DeliveryStatus, LeaseRequest, LeaseResponse, ReportRequest, ReportResponse,
};

pub struct Dispatcher {
    deliveries: Arc<dyn EventDeliveryRepository>,
    breakers: Arc<CircuitBreakerManager>,
}

impl Dispatcher {
    pub fn new(
        deliveries: Arc<dyn EventDeliveryRepository>,
        breakers: Arc<CircuitBreakerManager>,
    ) -> Self {
        Self {
            deliveries,
            breakers,
        }
    }

    /// Claims due deliveries and hands back those whose endpoint breaker
    /// allows an attempt. The rest are released on their backoff schedule
    /// without spending a trial.
    pub async fn lease(&self, req: &LeaseRequest) -> Result<LeaseResponse, StoreError> {
        let now = Utc::now();
        let claimed = self
            .deliveries
            .claim_due(
                req.limit,
                &req.worker_id,
                Duration::milliseconds(req.lease_ms),
                now,
            )
            .await?;

        let mut deliveries = Vec::with_capacity(claimed.len());
        let mut deferred = 0;

        for leased in claimed {
            let delivery = &leased.delivery;
            let Some(endpoint_id) = delivery.endpoint_id.as_deref() else {
                deliveries.push(leased);
                continue;
            };

            if self
                .breakers
                .allow_or_fail_open(&delivery.project_id, endpoint_id)
                .await
            {
                deliveries.push(leased);
                continue;
            }

            let schedule = schedule_deferral(delivery, &delivery.metadata.retry, now);
            let (status, description) = if schedule.terminal {
                (DeliveryStatus::Discarded, "circuit breaker open, retry limit reached")
            } else {
                (DeliveryStatus::Retry, "circuit breaker open")
            };
            self.deliveries
                .defer(
                    delivery.uid,
                    &req.worker_id,
                    status,
                    schedule.next_attempt_at,
                    Some(description),
                )
                .await?;
            deferred += 1;
            debug!(
                delivery_id = %delivery.uid,
                endpoint_id,
                next_send_time = %schedule.next_attempt_at,
                "breaker open, delivery deferred"
            );
        }

        Ok(LeaseResponse {
            deliveries,
            deferred,
        })
    }

    /// Records one attempt and settles the delivery as `Success`, `Retry` or
    /// `Discarded`.
    pub async fn report(&self, req: &ReportRequest) -> Result<ReportResponse, StoreError> {
        let mut delivery = self.deliveries.find(req.delivery_id).await?;
        if delivery.status != DeliveryStatus::Processing {
            return Err(StoreError::Conflict("lease_not_owned".to_string()));
        }

        let now = Utc::now();
        delivery.metadata.num_trials += 1;
        let num_trials = delivery.metadata.num_trials;

        let attempt = DeliveryAttempt {
            id: Uuid::new_v4(),
            attempt_no: num_trials,
            started_at: req.attempt.started_at,
            finished_at: req.attempt.finished_at,
            status_code: req.attempt.status_code,
            latency_ms: (req.attempt.finished_at - req.attempt.started_at)
                .num_milliseconds()
                .max(0) as u64,
            error: req.attempt.error.clone(),
        };

        let (status, next_send_time, description) = if req.success {
            (
                DeliveryStatus::Success,
                delivery.metadata.next_send_time,
                None,
            )
        } else if !req.retryable {
            (
                DeliveryStatus::Discarded,
                delivery.metadata.next_send_time,
                Some("non-retryable failure"),
            )
        } else {
            let schedule = schedule_next(&delivery, &delivery.metadata.retry, now);
            if schedule.terminal {
                (
                    DeliveryStatus::Discarded,
                    delivery.metadata.next_send_time,
                    Some("retry limit exceeded"),
                )
            } else {
                (DeliveryStatus::Retry, schedule.next_attempt_at, None)
            }
        };

        self.deliveries
            .update_with_attempt(&AttemptUpdate {
                delivery_id: delivery.uid,
                worker_id: Some(&req.worker_id),
                status,
                num_trials,
                next_send_time,
                attempt: &attempt,
                description,
            })
            .await?;

        if let Some(endpoint_id) = delivery.endpoint_id.as_deref() {
            self.record_outcome(&delivery.project_id, endpoint_id, req.success)
                .await;
        }

        match status {
            DeliveryStatus::Discarded => info!(
                delivery_id = %delivery.uid,
                num_trials,
                reason = description.unwrap_or_default(),
                "delivery discarded"
            ),
            DeliveryStatus::Retry => debug!(
                delivery_id = %delivery.uid,
                num_trials,
                next_send_time = %next_send_time,
                "delivery scheduled for retry"
            ),
            _ => {}
        }

        Ok(ReportResponse {
            status,
            num_trials,
            next_send_time: (status == DeliveryStatus::Retry).then_some(next_send_time),
        })
    }

    async fn record_outcome(&self, project_id: &str, endpoint_id: &str, success: bool) {
        let sampled = match self.breakers.should_sample(project_id).await {
            Ok(sampled) => sampled,
            Err(err) => {
                warn!(project_id, error = %err, "breaker sampling failed, outcome not sampled");
                false
            }
        };
        if let Err(err) = self
            .breakers
            .record_result(project_id, endpoint_id, success, sampled)
            .await
        {
            warn!(endpoint_id, error = %err, "failed to record breaker outcome");
        }
    }
}
