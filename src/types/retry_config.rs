use serde::{Deserialize, Serialize};

/// Per-subscription retry policy.
///
/// `retry_limit` counts retries after the first attempt, so a delivery is
/// discarded once it has been tried `retry_limit + 1` times.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RetryConfiguration {
    Linear {
        retry_limit: u32,
        interval_seconds: u64,
    },
    Exponential {
        retry_limit: u32,
        /// Precomputed delay schedule in seconds; the last entry repeats.
        backoff_times: Vec<u64>,
    },
}

impl RetryConfiguration {
    pub fn retry_limit(&self) -> u32 {
        match self {
            RetryConfiguration::Linear { retry_limit, .. }
            | RetryConfiguration::Exponential { retry_limit, .. } => *retry_limit,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        match self {
            RetryConfiguration::Linear { .. } => Ok(()),
            RetryConfiguration::Exponential { backoff_times, .. } if backoff_times.is_empty() => {
                Err("backoff_times must not be empty".to_string())
            }
            RetryConfiguration::Exponential { .. } => Ok(()),
        }
    }
}

impl Default for RetryConfiguration {
    fn default() -> Self {
        RetryConfiguration::Linear {
            retry_limit: 3,
            interval_seconds: 30,
        }
    }
}
