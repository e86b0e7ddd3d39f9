use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use tracing::{debug, info};

use super::{AlertLimiter, BreakerError, BreakerNotifier, BreakerStore};
use crate::store::ProjectRepository;
use crate::types::{BreakerState, CircuitBreaker, CircuitBreakerConfig, WindowBucket};

const MAX_TIMEOUT_SECS: u64 = 365 * 24 * 60 * 60;

pub fn breaker_key(tenant_id: &str) -> String {
    format!("breaker:{tenant_id}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Opened,
    HalfOpened,
    Closed,
}

/// Evaluates breakers for delivery attempts.
///
/// Configuration is looked up per call, so threshold changes apply to
/// existing snapshots on their next evaluation.
///
/// The observability window is counted in whole wall-clock minutes: a window
/// of `n` keeps the current minute and the `n - 1` before it, so it spans
/// between `n - 1` and `n` minutes of history. With `n = 1` the counts start
/// over at every minute boundary.
pub struct CircuitBreakerManager {
    store: Arc<dyn BreakerStore>,
    projects: Arc<dyn ProjectRepository>,
    notifier: Arc<dyn BreakerNotifier>,
    min_ttl: Duration,
    store_alerts: AlertLimiter,
}

impl CircuitBreakerManager {
    pub fn new(
        store: Arc<dyn BreakerStore>,
        projects: Arc<dyn ProjectRepository>,
        notifier: Arc<dyn BreakerNotifier>,
    ) -> Self {
        Self {
            store,
            projects,
            notifier,
            min_ttl: Duration::hours(24),
            store_alerts: AlertLimiter::new(Duration::minutes(1)),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.min_ttl = ttl;
        self
    }

    pub fn with_alert_interval(mut self, interval: Duration) -> Self {
        self.store_alerts = AlertLimiter::new(interval);
        self
    }

    pub async fn allow(&self, project_id: &str, tenant_id: &str) -> Result<bool, BreakerError> {
        self.allow_at(project_id, tenant_id, Utc::now()).await
    }

    pub async fn allow_at(
        &self,
        project_id: &str,
        tenant_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, BreakerError> {
        let key = breaker_key(tenant_id);
        let Some(mut breaker) = self.store.get(&key, now).await? else {
            return Ok(true);
        };

        match breaker.state {
            BreakerState::Closed => Ok(true),
            BreakerState::Open => {
                if breaker.will_reset_at.is_some_and(|at| now < at) {
                    return Ok(false);
                }
                let config = self.projects.circuit_breaker_config(project_id).await?;
                enter_half_open(&mut breaker, &config, now);
                self.persist(&breaker, &config, now).await?;
                info!(tenant_id, "circuit breaker half-open, probing endpoint");
                Ok(true)
            }
            BreakerState::HalfOpen => {
                let config = self.projects.circuit_breaker_config(project_id).await?;
                if breaker.probes_issued < probe_budget(&config) {
                    breaker.probes_issued += 1;
                } else if breaker.probe_deadline.is_none_or(|deadline| now >= deadline) {
                    // Probes went out but no verdict came back in time.
                    breaker.probes_issued = 1;
                    breaker.probe_deadline = Some(now + seconds(config.breaker_timeout));
                } else {
                    return Ok(false);
                }
                breaker.updated_at = now;
                self.persist(&breaker, &config, now).await?;
                Ok(true)
            }
        }
    }

    /// `allow`, but an unreachable store lets the attempt through and raises a
    /// rate-limited alert instead of stalling every delivery.
    pub async fn allow_or_fail_open(&self, project_id: &str, tenant_id: &str) -> bool {
        match self.allow(project_id, tenant_id).await {
            Ok(allowed) => allowed,
            Err(err) => {
                if self.store_alerts.try_acquire(Utc::now()) {
                    self.notifier.store_unavailable(&err).await;
                } else {
                    debug!(tenant_id, error = %err, "breaker check failed, failing open");
                }
                true
            }
        }
    }

    /// Draws whether this attempt's outcome should update breaker statistics.
    pub async fn should_sample(&self, project_id: &str) -> Result<bool, BreakerError> {
        let config = self.projects.circuit_breaker_config(project_id).await?;
        Ok(sample(config.sample_rate))
    }

    pub async fn record_result(
        &self,
        project_id: &str,
        tenant_id: &str,
        success: bool,
        sampled: bool,
    ) -> Result<Option<Transition>, BreakerError> {
        self.record_result_at(project_id, tenant_id, success, sampled, Utc::now())
            .await
    }

    /// Outcomes while half-open are always evaluated; otherwise only sampled
    /// ones are. Results arriving while open came from attempts started
    /// before the trip and are ignored.
    pub async fn record_result_at(
        &self,
        project_id: &str,
        tenant_id: &str,
        success: bool,
        sampled: bool,
        now: DateTime<Utc>,
    ) -> Result<Option<Transition>, BreakerError> {
        let key = breaker_key(tenant_id);
        let existing = self.store.get(&key, now).await?;
        let half_open = existing
            .as_ref()
            .is_some_and(|breaker| breaker.state == BreakerState::HalfOpen);
        if !sampled && !half_open {
            return Ok(None);
        }

        let mut breaker = existing.unwrap_or_else(|| new_breaker(project_id, tenant_id, now));
        if breaker.state == BreakerState::Open {
            debug!(tenant_id, "ignoring result reported while breaker is open");
            return Ok(None);
        }

        let config = self.projects.circuit_breaker_config(project_id).await?;
        let transition = apply_outcome(&mut breaker, &config, success, now);
        self.persist(&breaker, &config, now).await?;

        match transition {
            Some(Transition::Opened) => self.notifier.breaker_opened(&breaker).await,
            Some(Transition::Closed) => info!(tenant_id, "circuit breaker closed"),
            _ => {}
        }
        Ok(transition)
    }

    pub async fn get(&self, tenant_id: &str) -> Result<CircuitBreaker, BreakerError> {
        self.store
            .get(&breaker_key(tenant_id), Utc::now())
            .await?
            .ok_or(BreakerError::NotFound)
    }

    /// Drops the snapshot; the next attempt starts a fresh closed breaker.
    pub async fn reset(&self, tenant_id: &str) -> Result<bool, BreakerError> {
        self.store.delete(&breaker_key(tenant_id)).await
    }

    pub async fn reset_project(&self, project_id: &str) -> Result<u64, BreakerError> {
        let removed = self.store.delete_by_project(project_id).await?;
        info!(project_id, removed, "circuit breakers reset");
        Ok(removed)
    }

    async fn persist(
        &self,
        breaker: &CircuitBreaker,
        config: &CircuitBreakerConfig,
        now: DateTime<Utc>,
    ) -> Result<(), BreakerError> {
        let needed = window_length(config) + seconds(config.breaker_timeout) * 2;
        let ttl = if needed > self.min_ttl {
            needed
        } else {
            self.min_ttl
        };
        self.store.set(breaker, ttl, now).await
    }
}

fn sample(rate: u32) -> bool {
    match rate {
        0 => false,
        rate if rate >= 100 => true,
        rate => rand::thread_rng().gen_range(0..100) < rate,
    }
}

fn seconds(value: u64) -> Duration {
    Duration::seconds(value.min(MAX_TIMEOUT_SECS) as i64)
}

fn window_length(config: &CircuitBreakerConfig) -> Duration {
    seconds(config.observability_window.saturating_mul(60))
}

fn probe_budget(config: &CircuitBreakerConfig) -> u64 {
    config.minimum_request_count.max(1)
}

fn new_breaker(project_id: &str, tenant_id: &str, now: DateTime<Utc>) -> CircuitBreaker {
    CircuitBreaker {
        key: breaker_key(tenant_id),
        tenant_id: tenant_id.to_string(),
        project_id: project_id.to_string(),
        state: BreakerState::Closed,
        requests: 0,
        total_failures: 0,
        total_successes: 0,
        consecutive_failures: 0,
        failure_rate: 0.0,
        success_rate: 0.0,
        notifications_sent: 0,
        will_reset_at: None,
        probes_issued: 0,
        probe_deadline: None,
        window: Vec::new(),
        updated_at: now,
    }
}

fn apply_outcome(
    breaker: &mut CircuitBreaker,
    config: &CircuitBreakerConfig,
    success: bool,
    now: DateTime<Utc>,
) -> Option<Transition> {
    record_in_window(breaker, config, success, now);
    if success {
        breaker.consecutive_failures = 0;
    } else {
        breaker.consecutive_failures += 1;
    }
    breaker.updated_at = now;

    match breaker.state {
        BreakerState::Closed if !success && should_trip(breaker, config) => {
            trip(breaker, config, now);
            Some(Transition::Opened)
        }
        BreakerState::HalfOpen if !success => {
            trip(breaker, config, now);
            Some(Transition::Opened)
        }
        BreakerState::HalfOpen
            if breaker.requests >= probe_budget(config)
                && breaker.success_rate >= f64::from(config.success_threshold) =>
        {
            close(breaker);
            Some(Transition::Closed)
        }
        _ => None,
    }
}

fn should_trip(breaker: &CircuitBreaker, config: &CircuitBreakerConfig) -> bool {
    if breaker.requests < config.minimum_request_count {
        return false;
    }
    let rate_tripped = breaker.failure_rate >= f64::from(config.failure_threshold);
    // zero disables the consecutive-failure condition
    let streak_tripped = config.consecutive_failure_threshold > 0
        && breaker.consecutive_failures >= config.consecutive_failure_threshold;
    rate_tripped || streak_tripped
}

fn record_in_window(
    breaker: &mut CircuitBreaker,
    config: &CircuitBreakerConfig,
    success: bool,
    now: DateTime<Utc>,
) {
    let minute = now.timestamp().div_euclid(60);
    let oldest = minute - config.observability_window.min(MAX_TIMEOUT_SECS) as i64;
    breaker.window.retain(|bucket| bucket.minute > oldest);

    let position = breaker
        .window
        .iter()
        .position(|bucket| bucket.minute == minute);
    let index = match position {
        Some(index) => index,
        None => {
            breaker.window.push(WindowBucket {
                minute,
                successes: 0,
                failures: 0,
            });
            breaker.window.len() - 1
        }
    };
    if let Some(bucket) = breaker.window.get_mut(index) {
        if success {
            bucket.successes += 1;
        } else {
            bucket.failures += 1;
        }
    }
    recompute(breaker);
}

fn recompute(breaker: &mut CircuitBreaker) {
    let (successes, failures) = breaker
        .window
        .iter()
        .fold((0u64, 0u64), |(s, f), bucket| {
            (s + bucket.successes, f + bucket.failures)
        });
    breaker.total_successes = successes;
    breaker.total_failures = failures;
    breaker.requests = successes + failures;
    if breaker.requests == 0 {
        breaker.failure_rate = 0.0;
        breaker.success_rate = 0.0;
    } else {
        breaker.failure_rate = failures as f64 * 100.0 / breaker.requests as f64;
        breaker.success_rate = successes as f64 * 100.0 / breaker.requests as f64;
    }
}

fn trip(breaker: &mut CircuitBreaker, config: &CircuitBreakerConfig, now: DateTime<Utc>) {
    breaker.state = BreakerState::Open;
    breaker.will_reset_at = Some(now + seconds(config.breaker_timeout));
    breaker.notifications_sent += 1;
    breaker.probes_issued = 0;
    breaker.probe_deadline = None;
}

fn enter_half_open(breaker: &mut CircuitBreaker, config: &CircuitBreakerConfig, now: DateTime<Utc>) {
    breaker.state = BreakerState::HalfOpen;
    breaker.window.clear();
    breaker.consecutive_failures = 0;
    recompute(breaker);
    breaker.will_reset_at = None;
    breaker.probes_issued = 1;
    breaker.probe_deadline = Some(now + seconds(config.breaker_timeout));
    breaker.updated_at = now;
}

fn close(breaker: &mut CircuitBreaker) {
    breaker.state = BreakerState::Closed;
    breaker.window.clear();
    breaker.consecutive_failures = 0;
    recompute(breaker);
    breaker.will_reset_at = None;
    breaker.probes_issued = 0;
    breaker.probe_deadline = None;
}
