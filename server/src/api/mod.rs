//! API Router and Application State
//!
//! Central routing configuration and shared state.

use axum::{extract::State, routing::get, Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::{
    config::Config,
    engine::WorkerPool,
    voice::{self, RouterRegistry, SignalingService},
    ws,
};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Server configuration
    pub config: Arc<Config>,
    /// Media worker pool
    pub pool: Arc<WorkerPool>,
    /// Room and call signaling
    pub signaling: Arc<SignalingService>,
}

impl AppState {
    /// Create new application state.
    #[must_use]
    pub fn new(config: Config, pool: WorkerPool) -> Self {
        let config = Arc::new(config);
        let pool = Arc::new(pool);
        let registry = Arc::new(RouterRegistry::new(pool.clone()));
        let signaling = SignalingService::new(config.clone(), registry);
        Self {
            config,
            pool,
            signaling,
        }
    }
}

/// Create the main application router.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Health check
        .route("/health", get(health_check))
        // ICE servers and voice status
        .nest("/api/voice", voice::router())
        // WebSocket signaling
        .route("/ws", get(ws::handler))
        // Middleware
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        // State
        .with_state(state)
}

/// Health check response.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Service status
    pub status: String,
    /// Media workers still running
    pub workers_alive: usize,
}

/// Health check endpoint.
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let workers_alive = state
        .pool
        .workers()
        .iter()
        .filter(|worker| !worker.is_closed())
        .count();
    Json(HealthResponse {
        status: if workers_alive == state.pool.workers().len() {
            "ok".into()
        } else {
            "degraded".into()
        },
        workers_alive,
    })
}
