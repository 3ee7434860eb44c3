//! HTTP front door for chat clients.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/ask` | Run one message through the pipeline |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! `POST /ask` takes `{ "text", "user_id", "channel_id"?, "is_explicit"? }`
//! (`is_explicit` defaults to `true`) and answers `200` with the response
//! envelope, or `204 No Content` when the pipeline decides to stay silent.
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "user_id must not be empty" } }
//! ```
//!
//! Only malformed requests produce errors. Backend trouble is reported inside
//! a normal envelope (`abstention`, `rate_limited`, …).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted for browser-based clients.

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::config::Config;
use crate::models::Query;
use crate::pipeline::Pipeline;

#[derive(Clone)]
struct AppState {
    pipeline: Arc<Pipeline>,
}

/// Build the pipeline from `config` and serve it on `[server].bind`.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let pipeline = Arc::new(Pipeline::from_config(config).await?);
    run_server_with_pipeline(&config.server.bind, pipeline).await
}

/// Serve an already-built pipeline. Runs until the process is terminated.
pub async fn run_server_with_pipeline(bind_addr: &str, pipeline: Arc<Pipeline>) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    info!(addr = %bind_addr, "ask server listening");
    axum::serve(listener, app(pipeline)).await?;
    Ok(())
}

/// The router, without a listener. Useful for embedding in a larger app.
pub fn app(pipeline: Arc<Pipeline>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/ask", post(handle_ask))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(AppState { pipeline })
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /ask ============

async fn handle_ask(
    State(state): State<AppState>,
    body: Result<Json<Query>, JsonRejection>,
) -> Result<Response, AppError> {
    let Json(query) = body.map_err(|e| bad_request(e.body_text()))?;
    if query.user_id.trim().is_empty() {
        return Err(bad_request("user_id must not be empty"));
    }

    match state.pipeline.process(&query).await {
        Some(envelope) => Ok(Json(envelope).into_response()),
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}
