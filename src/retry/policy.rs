use chrono::{DateTime, Duration, Utc};

use crate::types::{EventDelivery, RetryConfiguration};

const MAX_DELAY_SECS: u64 = 365 * 24 * 60 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrySchedule {
    pub next_attempt_at: DateTime<Utc>,
    /// The retry budget is spent; the delivery should be discarded.
    pub terminal: bool,
}

/// Schedule after a failed attempt. `num_trials` on the delivery must already
/// count the attempt that just failed.
pub fn schedule_next(
    delivery: &EventDelivery,
    config: &RetryConfiguration,
    now: DateTime<Utc>,
) -> RetrySchedule {
    schedule(delivery.metadata.num_trials, config, now)
}

/// Schedule for an attempt the breaker refused. No trial is consumed, so the
/// delivery keeps its place on the backoff curve.
pub fn schedule_deferral(
    delivery: &EventDelivery,
    config: &RetryConfiguration,
    now: DateTime<Utc>,
) -> RetrySchedule {
    schedule(delivery.metadata.num_trials, config, now)
}

fn schedule(trials: u32, config: &RetryConfiguration, now: DateTime<Utc>) -> RetrySchedule {
    RetrySchedule {
        next_attempt_at: now + delay_for(config, trials.saturating_sub(1)),
        terminal: trials > config.retry_limit(),
    }
}

/// Delay before retry number `index` (zero-based).
pub fn delay_for(config: &RetryConfiguration, index: u32) -> Duration {
    let seconds = match config {
        RetryConfiguration::Linear {
            interval_seconds, ..
        } => *interval_seconds,
        RetryConfiguration::Exponential { backoff_times, .. } => {
            let last = backoff_times.len().saturating_sub(1);
            let position = (index as usize).min(last);
            backoff_times.get(position).copied().unwrap_or(0)
        }
    };
    Duration::seconds(seconds.min(MAX_DELAY_SECS) as i64)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use uuid::Uuid;

    use super::*;
    use crate::types::{DeliveryMetadata, DeliveryStatus};

    fn delivery(num_trials: u32, retry: RetryConfiguration) -> EventDelivery {
        let now = Utc::now();
        EventDelivery {
            uid: Uuid::new_v4(),
            project_id: "proj-1".to_string(),
            event_id: Uuid::new_v4(),
            subscription_id: "sub-1".to_string(),
            endpoint_id: Some("ep-1".to_string()),
            event_type: "invoice.created".to_string(),
            status: DeliveryStatus::Processing,
            headers: BTreeMap::new(),
            metadata: DeliveryMetadata {
                data: "{}".to_string(),
                retry,
                num_trials,
                next_send_time: now,
            },
            cli_metadata: None,
            attempts: Vec::new(),
            description: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn linear_delay_ignores_attempt_index() {
        let config = RetryConfiguration::Linear {
            retry_limit: 10,
            interval_seconds: 45,
        };
        for index in [0, 1, 5, 100, u32::MAX] {
            assert_eq!(delay_for(&config, index), Duration::seconds(45));
        }
    }

    #[test]
    fn exponential_delay_follows_schedule_then_repeats_last() {
        let config = RetryConfiguration::Exponential {
            retry_limit: 10,
            backoff_times: vec![5, 30, 120],
        };
        assert_eq!(delay_for(&config, 0), Duration::seconds(5));
        assert_eq!(delay_for(&config, 1), Duration::seconds(30));
        assert_eq!(delay_for(&config, 2), Duration::seconds(120));
        assert_eq!(delay_for(&config, 7), Duration::seconds(120));
    }

    #[test]
    fn linear_policy_retries_three_times_then_discards() {
        let config = RetryConfiguration::Linear {
            retry_limit: 3,
            interval_seconds: 30,
        };
        let now = Utc::now();

        for trials in 1..=3 {
            let schedule = schedule_next(&delivery(trials, config.clone()), &config, now);
            assert!(!schedule.terminal, "failure {trials} should retry");
            assert_eq!(schedule.next_attempt_at, now + Duration::seconds(30));
        }
        let fourth = schedule_next(&delivery(4, config.clone()), &config, now);
        assert!(fourth.terminal);
    }

    #[test]
    fn zero_retry_limit_discards_first_failure() {
        let config = RetryConfiguration::Linear {
            retry_limit: 0,
            interval_seconds: 30,
        };
        let schedule = schedule_next(&delivery(1, config.clone()), &config, Utc::now());
        assert!(schedule.terminal);
    }

    #[test]
    fn deferral_does_not_spend_budget() {
        let config = RetryConfiguration::Exponential {
            retry_limit: 2,
            backoff_times: vec![10, 60],
        };
        let now = Utc::now();

        let fresh = schedule_deferral(&delivery(0, config.clone()), &config, now);
        assert!(!fresh.terminal);
        assert_eq!(fresh.next_attempt_at, now + Duration::seconds(10));

        let after_two = schedule_deferral(&delivery(2, config.clone()), &config, now);
        assert!(!after_two.terminal);
        assert_eq!(after_two.next_attempt_at, now + Duration::seconds(60));
    }
}
