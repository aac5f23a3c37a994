use crate::config::AppState;
use anyhow::Result;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use strand_core::EngineError;
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};

mod handlers;

/// Start the API server; returns once ctrl-c arrives or `shutdown` fires
pub async fn serve(addr: &str, state: AppState, shutdown: CancellationToken) -> Result<()> {
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("API server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Received ctrl-c, shutting down");
                }
                _ = shutdown.cancelled() => {}
            }
        })
        .await?;

    Ok(())
}

/// Create the API router
fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health_check))
        .route(
            "/api/graphs/{graph_id}",
            put(handlers::put_graph).get(handlers::get_graph),
        )
        .route(
            "/api/executions",
            post(handlers::create_execution).get(handlers::list_executions),
        )
        .route("/api/executions/{execution_id}", get(handlers::get_execution))
        .route(
            "/api/executions/{execution_id}/cancel",
            post(handlers::cancel_execution),
        )
        .route(
            "/api/executions/{execution_id}/nodes/{node_id}/retry",
            post(handlers::retry_node),
        )
        .route(
            "/api/triggers",
            post(handlers::create_trigger).get(handlers::list_triggers),
        )
        .route(
            "/api/triggers/{trigger_id}/enable",
            post(handlers::enable_trigger),
        )
        .route(
            "/api/triggers/{trigger_id}/disable",
            post(handlers::disable_trigger),
        )
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().include_headers(true))
                .on_response(DefaultOnResponse::new().include_headers(true)),
        )
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(state))
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "strand",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// API error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: None,
        }
    }

    pub fn with_details(error: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: Some(details.into()),
        }
    }
}

/// Custom error type for API handlers
pub struct ApiError(anyhow::Error);

impl ApiError {
    fn status(&self) -> StatusCode {
        match self.0.downcast_ref::<EngineError>() {
            Some(EngineError::NotFound(_)) => StatusCode::NOT_FOUND,
            Some(EngineError::Validation(_) | EngineError::InvalidState(_)) => {
                StatusCode::BAD_REQUEST
            }
            Some(EngineError::LeaseConflict { .. }) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let error_msg = self.0.to_string();
        let details = self.0.chain().skip(1).map(|e| e.to_string()).collect::<Vec<_>>().join(": ");

        if status.is_server_error() {
            tracing::error!(error = %error_msg, %details, "Request failed");
        }

        let response = if details.is_empty() {
            ErrorResponse::new(error_msg)
        } else {
            ErrorResponse::with_details(error_msg, details)
        };

        (status, Json(response)).into_response()
    }
}

impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
