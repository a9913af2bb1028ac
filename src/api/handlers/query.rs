use axum::{
    body::Body,
    extract::State,
    http::{header, StatusCode},
    response::Response,
    Json,
};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::api::middleware::AppError;
use crate::api::routes::AppState;
use crate::models::{QueryRequest, SizeProjection};

/// Execute a query and stream the result as CSV.
///
/// The response is only built once the first row event has arrived, so
/// every retriable failure still gets a clean JSON error with a proper
/// status; after that the stream is committed and a mid-stream failure
/// terminates the connection abruptly.
pub async fn stream_query(
    State(state): State<AppState>,
    Json(payload): Json<QueryRequest>,
) -> Result<Response, AppError> {
    let query = payload.query.trim();
    if query.is_empty() {
        return Err(AppError::Validation("SQL query cannot be empty".to_string()));
    }

    tracing::info!("routing query: {}", query);

    let token = CancellationToken::new();
    let stream = state.router.route_and_stream(query, token.clone()).await?;
    let backend = stream.backend;

    // The guard lives inside the body stream: when the client disconnects
    // axum drops the body, the guard fires, and the in-flight backend
    // request is cancelled promptly.
    let guard = token.drop_guard();
    let body_stream = stream.into_byte_stream().map(move |chunk| {
        let _ = &guard;
        chunk
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/csv")
        .header("x-data-source", backend.as_str())
        .body(Body::from_stream(body_stream))
        .map_err(|e| AppError::Internal(e.to_string()))
}

/// Dry-run admission check: report the size projection without executing
/// the underlying query.
pub async fn check_size(
    State(state): State<AppState>,
    Json(payload): Json<QueryRequest>,
) -> Result<Json<SizeProjection>, AppError> {
    let query = payload.query.trim();
    if query.is_empty() {
        return Err(AppError::Validation("SQL query cannot be empty".to_string()));
    }

    let projection = state.router.check_size(query).await?;
    Ok(Json(projection))
}

/// Analysis endpoint for collaborators that only need table-existence and
/// server-location answers.
pub async fn analyze_query(
    State(state): State<AppState>,
    Json(payload): Json<QueryRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    let query = payload.query.trim();
    if query.is_empty() {
        return Err(AppError::Validation("SQL query cannot be empty".to_string()));
    }

    let analysis = state.router.analyze(query);
    let body = match state.router.resolve(&analysis).await {
        Ok(candidates) => serde_json::json!({
            "analysis": analysis,
            "candidates": candidates.backends,
        }),
        Err(e) => serde_json::json!({
            "analysis": analysis,
            "candidates": [],
            "resolution_error": e.to_string(),
        }),
    };
    Ok(Json(body))
}
