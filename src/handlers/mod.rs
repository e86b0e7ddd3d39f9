pub mod dispatcher;
pub mod events;
pub mod inspector;
pub mod stream;

use axum::{
    Router, middleware,
    routing::{get, post},
};

use crate::{auth::api_auth, state::AppState};

/// All HTTP routes. Worker routes are internal and unauthenticated; the rest
/// sit behind the bearer-token guard.
pub fn router(state: AppState) -> Router {
    let internal = Router::new()
        .route("/internal/dispatcher/lease", post(dispatcher::lease_handler))
        .route("/internal/dispatcher/report", post(dispatcher::report_handler));

    let protected = Router::new()
        .route(
            "/api/projects/:project_id/events",
            post(events::ingest_event_handler),
        )
        .route("/api/deliveries", get(inspector::list_deliveries_handler))
        .route(
            "/api/deliveries/:delivery_id/attempts",
            get(inspector::list_attempts_handler),
        )
        .route("/stream/login", post(stream::login_handler))
        .route("/stream/listen", get(stream::listen_handler))
        .layer(middleware::from_fn_with_state(state.clone(), api_auth));

    Router::new()
        .merge(internal)
        .merge(protected)
        .with_state(state)
}
