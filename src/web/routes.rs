use axum::{
    routing::{any, get, post},
    Router,
};
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use super::handlers;
use super::ws::ws_handler;
use crate::state::AppState;

/// Create the control-surface router
pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        .route("/ready", get(handlers::ready))
        .route("/sources", get(handlers::list_sources))
        // Triggers are plain GETs so cameras and scripts can fire them
        .route("/record/:source_id", get(handlers::record).post(handlers::record))
        .route(
            "/stream/start/:peer_id",
            get(handlers::stream_start).post(handlers::stream_start),
        )
        .route("/stream/stop", post(handlers::stream_stop))
        .route("/stream/status", get(handlers::stream_status))
        .route("/graph", get(handlers::graph_snapshot))
        .route("/config", get(handlers::get_config))
        .route("/ws", any(ws_handler));

    Router::new()
        .nest("/api", api_routes)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
