use std::sync::Arc;

use sqlx::SqlitePool;

use crate::breaker::{CircuitBreakerManager, LogNotifier, SqliteBreakerStore};
use crate::config::GatewayConfig;
use crate::dispatcher::Dispatcher;
use crate::store::{DeliveryFeed, SqliteStore};
use crate::stream::{Hub, HubHandle};

#[derive(Clone)]
pub struct AppState {
    pub store: SqliteStore,
    pub dispatcher: Arc<Dispatcher>,
    pub breakers: Arc<CircuitBreakerManager>,
    pub hub: HubHandle,
    pub config: Arc<GatewayConfig>,
}

impl AppState {
    /// Wires every component over one pool. The returned hub is not running
    /// yet; the caller spawns it with its shutdown signal.
    pub fn new(pool: SqlitePool, config: GatewayConfig) -> (Self, Hub) {
        let feed = DeliveryFeed::new(config.hub_event_buffer);
        let store = SqliteStore::new(pool, feed.clone());
        let breakers = Arc::new(breaker_manager(&store, &config));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::new(store.clone()),
            Arc::clone(&breakers),
        ));
        let hub = Hub::new(feed, config.hub_event_buffer);

        let state = Self {
            store,
            dispatcher,
            breakers,
            hub: hub.handle(),
            config: Arc::new(config),
        };
        (state, hub)
    }
}

/// Breaker manager backed by the breaker table of `store`'s database.
pub fn breaker_manager(store: &SqliteStore, config: &GatewayConfig) -> CircuitBreakerManager {
    CircuitBreakerManager::new(
        Arc::new(SqliteBreakerStore::new(store.pool().clone())),
        Arc::new(store.clone()),
        Arc::new(LogNotifier),
    )
    .with_ttl(config.breaker_ttl())
    .with_alert_interval(config.store_alert_interval())
}
