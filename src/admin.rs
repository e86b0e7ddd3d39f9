//! Operator commands behind `courier circuit-breakers` and `courier retry`.
//!
//! Everything here returns values; printing and exit codes belong to the
//! binary.

use chrono::{DateTime, Utc};

use crate::breaker::{BreakerError, CircuitBreakerManager};
use crate::interval::{IntervalError, TimeRange, parse_duration};
use crate::retry::{Queue, RetryError, requeue_by_status_and_time};
use crate::store::{EventDeliveryRepository, ProjectRepository, StoreError};
use crate::types::{CircuitBreakerConfig, CircuitBreakerSummary, DeliveryStatus};

#[derive(Debug, thiserror::Error)]
pub enum AdminError {
    #[error("{0}")]
    Validation(String),
    #[error(transparent)]
    Breaker(#[from] BreakerError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Retry(#[from] RetryError),
    #[error("invalid --time: {0}")]
    Interval(#[from] IntervalError),
}

/// Field overrides for a project's breaker config. `None` keeps the stored value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BreakerConfigUpdate {
    pub sample_rate: Option<u32>,
    pub failure_threshold: Option<u32>,
    pub success_threshold: Option<u32>,
    pub minimum_request_count: Option<u64>,
    pub observability_window: Option<u64>,
    pub consecutive_failure_threshold: Option<u64>,
    pub breaker_timeout: Option<u64>,
}

impl BreakerConfigUpdate {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    fn apply(&self, config: &mut CircuitBreakerConfig) {
        if let Some(value) = self.sample_rate {
            config.sample_rate = value;
        }
        if let Some(value) = self.failure_threshold {
            config.failure_threshold = value;
        }
        if let Some(value) = self.success_threshold {
            config.success_threshold = value;
        }
        if let Some(value) = self.minimum_request_count {
            config.minimum_request_count = value;
        }
        if let Some(value) = self.observability_window {
            config.observability_window = value;
        }
        if let Some(value) = self.consecutive_failure_threshold {
            config.consecutive_failure_threshold = value;
        }
        if let Some(value) = self.breaker_timeout {
            config.breaker_timeout = value;
        }
    }
}

/// Result of a config update: what was stored and how many breakers were reset.
#[derive(Debug, Clone)]
pub struct BreakerUpdateOutcome {
    pub config: CircuitBreakerConfig,
    pub breakers_reset: u64,
}

pub async fn get_breaker(
    breakers: &CircuitBreakerManager,
    endpoint_id: &str,
) -> Result<CircuitBreakerSummary, AdminError> {
    let endpoint_id = endpoint_id.trim();
    if endpoint_id.is_empty() {
        return Err(AdminError::Validation("endpoint id is required".to_string()));
    }
    let breaker = breakers.get(endpoint_id).await?;
    Ok(CircuitBreakerSummary::from(&breaker))
}

/// Merges `update` into the project's config, persists it and drops every
/// breaker of the project so the next evaluation starts from the new values.
/// Out-of-range values are rejected before anything is written.
pub async fn update_breaker_config(
    projects: &dyn ProjectRepository,
    breakers: &CircuitBreakerManager,
    project_id: &str,
    update: &BreakerConfigUpdate,
) -> Result<BreakerUpdateOutcome, AdminError> {
    let project_id = project_id.trim();
    if project_id.is_empty() {
        return Err(AdminError::Validation("project id is required".to_string()));
    }

    let mut config = projects.circuit_breaker_config(project_id).await?;
    update.apply(&mut config);
    config.validate().map_err(AdminError::Validation)?;

    projects
        .update_circuit_breaker_config(project_id, &config)
        .await?;
    let breakers_reset = breakers.reset_project(project_id).await?;

    Ok(BreakerUpdateOutcome {
        config,
        breakers_reset,
    })
}

/// Parses `--status` values. Unknown names are a validation error, not skipped.
pub fn parse_statuses(raw: &[String]) -> Result<Vec<DeliveryStatus>, AdminError> {
    let mut statuses = Vec::with_capacity(raw.len());
    for value in raw {
        let status = value
            .parse::<DeliveryStatus>()
            .map_err(|err| AdminError::Validation(err.to_string()))?;
        if status == DeliveryStatus::Processing {
            return Err(AdminError::Validation(
                "processing deliveries are in flight and cannot be requeued".to_string(),
            ));
        }
        if !statuses.contains(&status) {
            statuses.push(status);
        }
    }
    if statuses.is_empty() {
        return Err(AdminError::Validation(
            "at least one --status is required".to_string(),
        ));
    }
    Ok(statuses)
}

/// Requeues every delivery in `statuses` created within the trailing `window`.
pub async fn requeue(
    deliveries: &dyn EventDeliveryRepository,
    queue: &dyn Queue,
    statuses: &[String],
    window: &str,
    now: DateTime<Utc>,
) -> Result<usize, AdminError> {
    let statuses = parse_statuses(statuses)?;
    let interval = parse_duration(window)?;
    if interval <= chrono::Duration::zero() {
        return Err(AdminError::Validation("--time must be positive".to_string()));
    }
    let range = TimeRange::trailing(interval, now);

    Ok(requeue_by_status_and_time(deliveries, queue, &statuses, &range).await?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn statuses_are_deduplicated() {
        let parsed = parse_statuses(&strings(&["retry", "Discarded", "retry"])).ok();
        assert_eq!(
            parsed,
            Some(vec![DeliveryStatus::Retry, DeliveryStatus::Discarded])
        );
    }

    #[test]
    fn processing_and_unknown_statuses_are_rejected() {
        assert!(matches!(
            parse_statuses(&strings(&["processing"])),
            Err(AdminError::Validation(_))
        ));
        assert!(matches!(
            parse_statuses(&strings(&["lost"])),
            Err(AdminError::Validation(_))
        ));
        assert!(matches!(
            parse_statuses(&[]),
            Err(AdminError::Validation(_))
        ));
    }

    #[test]
    fn update_only_touches_given_fields() {
        let mut config = CircuitBreakerConfig::default();
        let update = BreakerConfigUpdate {
            failure_threshold: Some(40),
            observability_window: Some(10),
            ..BreakerConfigUpdate::default()
        };
        update.apply(&mut config);

        assert_eq!(config.failure_threshold, 40);
        assert_eq!(config.observability_window, 10);
        assert_eq!(
            config.success_threshold,
            CircuitBreakerConfig::default().success_threshold
        );
        assert!(!update.is_empty());
        assert!(BreakerConfigUpdate::default().is_empty());
    }
}
