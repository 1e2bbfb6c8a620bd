//! HTTP surface over [`Handlers`].
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `GET`  | `/deployments` | Every record in the catalog |
//! | `GET`  | `/deployments/{app}/{name}` | One record |
//! | `POST` | `/commands` | Run a command (see [`crate::commands`]) |
//!
//! `POST /commands` takes either a JSON message
//! (`{"type": "upgrade", "message": "immich.server"}`, optionally wrapped in
//! `{"data": ...}`) or a text verb (`{"command": "update all"}`) and answers
//! `{"result": "<summary>"}`.
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "not_found", "message": "immich.server not found" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `command_failed` (500),
//! `internal` (500).

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::Value;
use tower_http::cors::{Any, CorsLayer};

use crate::commands::{dispatch, Command};
use crate::handlers::Handlers;
use crate::models::Deployment;

/// Build the application router. Exposed for embedding and tests.
pub fn router(handlers: Handlers) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/deployments", get(handle_list))
        .route("/deployments/{app}/{name}", get(handle_get))
        .route("/commands", post(handle_command))
        .layer(cors)
        .with_state(handlers)
}

/// Bind to `bind` and serve until the process is stopped.
pub async fn run_server(bind: &str, handlers: Handlers) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!("listening on http://{}", listener.local_addr()?);
    axum::serve(listener, router(handlers)).await?;
    Ok(())
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
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request",
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found",
        message: message.into(),
    }
}

fn internal(err: anyhow::Error) -> AppError {
    tracing::error!(error = format!("{:#}", err), "request failed");
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal",
        message: format!("{:#}", err),
    }
}

/// Command failures: missing records are 404, everything else 500.
fn command_failed(err: anyhow::Error) -> AppError {
    let message = format!("{:#}", err);
    if message.contains("not found") {
        return not_found(message);
    }
    tracing::error!(error = %message, "command failed");
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "command_failed",
        message,
    }
}

// ============ Handlers ============

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

async fn handle_list(State(handlers): State<Handlers>) -> Result<Json<Vec<Deployment>>, AppError> {
    let all = handlers.store().load_all().await.map_err(internal)?;
    Ok(Json(all))
}

async fn handle_get(
    State(handlers): State<Handlers>,
    Path((app, name)): Path<(String, String)>,
) -> Result<Json<Deployment>, AppError> {
    handlers
        .store()
        .load(&app, &name)
        .await
        .map_err(internal)?
        .map(Json)
        .ok_or_else(|| not_found(format!("{}.{} not found", app, name)))
}

async fn handle_command(
    State(handlers): State<Handlers>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, AppError> {
    let command = match body.get("command").and_then(Value::as_str) {
        Some(text) => Command::parse_text(text),
        None => Command::from_json(&body),
    }
    .map_err(|e| bad_request(e.to_string()))?;

    let result = dispatch(&handlers, command)
        .await
        .map_err(command_failed)?;
    Ok(Json(serde_json::json!({ "result": result })))
}
