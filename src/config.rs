use std::time::Duration;

/// Process settings read from the environment. Unparseable values are
/// ignored and the default kept.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub database_url: String,
    pub bind_addr: String,
    /// Bearer token for the inspector, ingest and stream routes. `None`
    /// leaves them open.
    pub api_token: Option<String>,
    pub retry_poll_interval: Duration,
    pub retry_batch_size: i64,
    pub device_max_last_seen: Duration,
    pub hub_event_buffer: usize,
    pub breaker_ttl: Duration,
    pub store_alert_interval: Duration,
}

impl GatewayConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(value) = std::env::var("DATABASE_URL")
            && !value.trim().is_empty()
        {
            config.database_url = value;
        }
        if let Ok(value) = std::env::var("COURIER_BIND_ADDR")
            && !value.trim().is_empty()
        {
            config.bind_addr = value;
        }
        if let Ok(value) = std::env::var("COURIER_API_TOKEN") {
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                config.api_token = Some(trimmed.to_string());
            }
        }
        if let Ok(value) = std::env::var("COURIER_RETRY_POLL_INTERVAL_MS")
            && let Ok(parsed) = value.parse::<u64>()
        {
            config.retry_poll_interval = Duration::from_millis(parsed.max(10));
        }
        if let Ok(value) = std::env::var("COURIER_RETRY_BATCH_SIZE")
            && let Ok(parsed) = value.parse::<i64>()
        {
            config.retry_batch_size = parsed.max(1);
        }
        if let Ok(value) = std::env::var("COURIER_DEVICE_MAX_LAST_SEEN_MS")
            && let Ok(parsed) = value.parse::<u64>()
        {
            config.device_max_last_seen = Duration::from_millis(parsed.max(1));
        }
        if let Ok(value) = std::env::var("COURIER_HUB_EVENT_BUFFER")
            && let Ok(parsed) = value.parse::<usize>()
        {
            config.hub_event_buffer = parsed.max(1);
        }
        if let Ok(value) = std::env::var("COURIER_BREAKER_TTL_SECS")
            && let Ok(parsed) = value.parse::<u64>()
        {
            config.breaker_ttl = Duration::from_secs(parsed.max(1));
        }
        if let Ok(value) = std::env::var("COURIER_STORE_ALERT_INTERVAL_SECS")
            && let Ok(parsed) = value.parse::<u64>()
        {
            config.store_alert_interval = Duration::from_secs(parsed);
        }

        config
    }

    pub fn device_max_last_seen(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.device_max_last_seen)
            .unwrap_or_else(|_| chrono::Duration::seconds(10))
    }

    pub fn breaker_ttl(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.breaker_ttl).unwrap_or_else(|_| chrono::Duration::days(1))
    }

    pub fn store_alert_interval(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.store_alert_interval)
            .unwrap_or_else(|_| chrono::Duration::minutes(1))
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite:courier.db".to_string(),
            bind_addr: "127.0.0.1:3001".to_string(),
            api_token: None,
            retry_poll_interval: Duration::from_millis(1_000),
            retry_batch_size: 100,
            device_max_last_seen: Duration::from_secs(10),
            hub_event_buffer: 1_024,
            breaker_ttl: Duration::from_secs(24 * 60 * 60),
            store_alert_interval: Duration::from_secs(60),
        }
    }
}
