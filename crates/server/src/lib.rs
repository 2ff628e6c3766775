//! HTTP/WebSocket ingress for SyncKairos. The interesting machinery lives in
//! the component crates; this one wires them into an axum router and a
//! binary.

use std::sync::Arc;

use axum::{
    middleware,
    routing::{
        get,
        post,
    },
    Router,
};
use engine::SyncEngine;
use gateway::FanoutGateway;
use tower_http::trace::TraceLayer;

pub mod config;
mod http;
mod rate_limit;
mod routes;
mod ws;

pub use config::ServerConfig;
pub use rate_limit::{
    RateLimitConfig,
    RateLimiter,
};

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<SyncEngine>,
    pub gateway: Arc<FanoutGateway>,
    pub rate_limiter: Arc<RateLimiter>,
}

/// The full routing table. `/health`, `/ready`, and `/metrics` sit outside
/// the rate-limited `/v1` subtree.
pub fn router(state: AppState) -> Router {
    let v1 = Router::new()
        .route("/sessions", post(routes::create_session))
        .route(
            "/sessions/{id}",
            get(routes::get_session).delete(routes::delete_session),
        )
        .route("/sessions/{id}/start", post(routes::start_session))
        .route("/sessions/{id}/switch", post(routes::switch_cycle))
        .route("/sessions/{id}/pause", post(routes::pause_session))
        .route("/sessions/{id}/resume", post(routes::resume_session))
        .route("/sessions/{id}/complete", post(routes::complete_session))
        .route("/sessions/{id}/cancel", post(routes::cancel_session))
        .route("/sessions/{id}/participants", post(routes::add_participant))
        .route(
            "/sessions/{id}/participants/{participant_id}",
            axum::routing::delete(routes::remove_participant),
        )
        .route("/time", get(routes::server_time))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            routes::ip_rate_limit,
        ));

    Router::new()
        .nest("/v1", v1)
        .route("/ws", get(ws::ws_handler))
        .route("/health", get(routes::health))
        .route("/ready", get(routes::ready))
        .route("/metrics", get(routes::metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
