use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::{
    checker::{self, CheckRequest, CheckResponse},
    probe::{TcpConnector, TokioSleeper},
    scanner::Scanner,
};

#[derive(Clone)]
pub struct AppState {
    scanner: Arc<Scanner<TcpConnector, TokioSleeper>>,
    shutdown: CancellationToken,
}

impl AppState {
    pub fn new(scanner: Scanner<TcpConnector, TokioSleeper>, shutdown: CancellationToken) -> Self {
        Self {
            scanner: Arc::new(scanner),
            shutdown,
        }
    }
}

#[derive(Debug, Serialize)]
struct Health {
    status: &'static str,
}

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/health", get(get_health))
        .route("/check", post(post_check))
        .with_state(state);

    Router::new().nest("/api", api).layer(TraceLayer::new_for_http())
}

/// Serve the check API until `state.shutdown` is cancelled.
pub async fn spawn_server(bind: &str, state: AppState) -> Result<()> {
    let shutdown = state.shutdown.clone();
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(bind = %listener.local_addr()?, "serving check API");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

async fn get_health() -> impl IntoResponse {
    (StatusCode::OK, Json(Health { status: "ok" }))
}

/// Assertion failures are still `200 OK` with `failed: true`; only
/// unusable input is a client error.
async fn post_check(State(app): State<AppState>, Json(req): Json<CheckRequest>) -> impl IntoResponse {
    match checker::run_check(app.scanner.as_ref(), &req, app.shutdown.child_token()).await {
        Ok(resp) => (StatusCode::OK, Json(resp)).into_response(),
        Err(e) => (StatusCode::BAD_REQUEST, Json(CheckResponse::invalid(&e))).into_response(),
    }
}
