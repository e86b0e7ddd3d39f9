use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tracing::{error, warn};

use super::BreakerError;
use crate::types::CircuitBreaker;

/// Receives breaker alerts. Implementations must not block the dispatch path
/// for long; they are awaited inline.
#[async_trait]
pub trait BreakerNotifier: Send + Sync {
    /// Called once per transition into Open.
    async fn breaker_opened(&self, breaker: &CircuitBreaker);

    async fn store_unavailable(&self, error: &BreakerError);
}

/// Writes alerts to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl BreakerNotifier for LogNotifier {
    async fn breaker_opened(&self, breaker: &CircuitBreaker) {
        warn!(
            tenant_id = %breaker.tenant_id,
            project_id = %breaker.project_id,
            failure_rate = breaker.failure_rate,
            consecutive_failures = breaker.consecutive_failures,
            notifications_sent = breaker.notifications_sent,
            will_reset_at = ?breaker.will_reset_at,
            "circuit breaker opened"
        );
    }

    async fn store_unavailable(&self, err: &BreakerError) {
        error!(error = %err, "circuit breaker store unavailable, failing open");
    }
}

/// Lets at most one alert through per interval.
#[derive(Debug)]
pub struct AlertLimiter {
    interval_ms: i64,
    last_alert_ms: AtomicI64,
}

impl AlertLimiter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval_ms: interval.num_milliseconds().max(0),
            last_alert_ms: AtomicI64::new(i64::MIN),
        }
    }

    pub fn try_acquire(&self, now: DateTime<Utc>) -> bool {
        let now_ms = now.timestamp_millis();
        let last = self.last_alert_ms.load(Ordering::Acquire);
        if last != i64::MIN && now_ms.saturating_sub(last) < self.interval_ms {
            return false;
        }
        self.last_alert_ms
            .compare_exchange(last, now_ms, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limiter_allows_one_alert_per_interval() {
        let limiter = AlertLimiter::new(Duration::seconds(60));
        let now = Utc::now();

        assert!(limiter.try_acquire(now));
        assert!(!limiter.try_acquire(now + Duration::seconds(10)));
        assert!(limiter.try_acquire(now + Duration::seconds(61)));
    }
}
