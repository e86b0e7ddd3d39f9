use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-project breaker tuning. Rates are percentages in `[0, 100]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Percentage of attempts whose outcome updates breaker statistics.
    pub sample_rate: u32,
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub minimum_request_count: u64,
    /// Sliding window size in minutes.
    pub observability_window: u64,
    pub consecutive_failure_threshold: u64,
    /// Seconds an open breaker stays open before probing.
    #[serde(alias = "error_timeout")]
    pub breaker_timeout: u64,
}

impl CircuitBreakerConfig {
    pub fn validate(&self) -> Result<(), String> {
        check_percentage("sample_rate", self.sample_rate)?;
        check_percentage("failure_threshold", self.failure_threshold)?;
        check_percentage("success_threshold", self.success_threshold)?;
        if self.observability_window == 0 {
            return Err("observability_window must be greater than 0".to_string());
        }
        Ok(())
    }
}

fn check_percentage(field: &str, value: u32) -> Result<(), String> {
    if value > 100 {
        return Err(format!("{field} must be between 0 and 100"));
    }
    Ok(())
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            sample_rate: 100,
            failure_threshold: 70,
            success_threshold: 60,
            minimum_request_count: 10,
            observability_window: 5,
            consecutive_failure_threshold: 10,
            breaker_timeout: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    HalfOpen,
    Open,
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreakerState::Closed => f.write_str("closed"),
            BreakerState::HalfOpen => f.write_str("half_open"),
            BreakerState::Open => f.write_str("open"),
        }
    }
}

/// Outcome counts for one minute of the observability window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowBucket {
    /// Unix minute the bucket covers.
    pub minute: i64,
    pub successes: u64,
    pub failures: u64,
}

/// Persisted breaker snapshot for one tenant (endpoint).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreaker {
    pub key: String,
    pub tenant_id: String,
    pub project_id: String,
    pub state: BreakerState,
    pub requests: u64,
    pub total_failures: u64,
    pub total_successes: u64,
    pub consecutive_failures: u64,
    pub failure_rate: f64,
    pub success_rate: f64,
    pub notifications_sent: u64,
    pub will_reset_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub probes_issued: u64,
    #[serde(default)]
    pub probe_deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    pub window: Vec<WindowBucket>,
    pub updated_at: DateTime<Utc>,
}

/// Admin view of a breaker, without the raw window buckets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerSummary {
    pub key: String,
    pub tenant_id: String,
    pub state: BreakerState,
    pub requests: u64,
    pub failure_rate: f64,
    pub success_rate: f64,
    pub will_reset_at: Option<DateTime<Utc>>,
    pub total_failures: u64,
    pub total_successes: u64,
    pub consecutive_failures: u64,
    pub notifications_sent: u64,
}

impl From<&CircuitBreaker> for CircuitBreakerSummary {
    fn from(breaker: &CircuitBreaker) -> Self {
        Self {
            key: breaker.key.clone(),
            tenant_id: breaker.tenant_id.clone(),
            state: breaker.state,
            requests: breaker.requests,
            failure_rate: breaker.failure_rate,
            success_rate: breaker.success_rate,
            will_reset_at: breaker.will_reset_at,
            total_failures: breaker.total_failures,
            total_successes: breaker.total_successes,
            consecutive_failures: breaker.consecutive_failures,
            notifications_sent: breaker.notifications_sent,
        }
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn validate_rejects_out_of_range_thresholds() {
        let config = CircuitBreakerConfig {
            failure_threshold: 101,
            ..CircuitBreakerConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err("failure_threshold must be between 0 and 100".to_string())
        );

        let config = CircuitBreakerConfig {
            observability_window: 0,
            ..CircuitBreakerConfig::default()
        };
        assert!(config.validate().is_err());
        assert!(CircuitBreakerConfig::default().validate().is_ok());
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let config: CircuitBreakerConfig =
            serde_json::from_str(r#"{"failure_threshold": 50, "error_timeout": 60}"#)
                .expect("parse config");
        assert_eq!(config.failure_threshold, 50);
        assert_eq!(config.breaker_timeout, 60);
        assert_eq!(config.sample_rate, 100);
    }
}
