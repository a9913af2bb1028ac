use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::api::handlers::query;
use crate::services::QueryRouter;

#[derive(Clone)]
pub struct AppState {
    pub router: Arc<QueryRouter>,
}

/// Create router with application state
pub fn create_router_with_state(query_router: Arc<QueryRouter>) -> Router {
    let state = AppState {
        router: query_router,
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/api/query", post(query::stream_query))
        .route("/api/query/size", post(query::check_size))
        .route("/api/query/analyze", post(query::analyze_query))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> &'static str {
    "OK"
}
