//! Axum read API over the article store.

use std::future::Future;
use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use newsetl_storage::RecordStore;
use newsetl_sync::{HealthStatus, RunScheduler};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "newsetl-web";

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn RecordStore>,
    /// Absent when the process serves reads without scheduling runs.
    pub scheduler: Option<Arc<RunScheduler>>,
}

impl AppState {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self {
            store,
            scheduler: None,
        }
    }

    pub fn with_scheduler(mut self, scheduler: Arc<RunScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/articles", get(articles_handler))
        .route("/health", get(health_handler))
        .with_state(Arc::new(state))
}

/// Serve until `shutdown` resolves.
pub async fn serve(
    port: u16,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "read api listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn articles_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.read_all().await {
        Ok(rows) => Json(rows).into_response(),
        Err(err) => {
            error!(error = %err, "reading articles failed");
            server_error()
        }
    }
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    let Some(scheduler) = &state.scheduler else {
        return Json(json!({ "status": "healthy", "scheduler_enabled": false })).into_response();
    };
    let report = scheduler.health_report().await;
    let code = match report.status {
        HealthStatus::Healthy => StatusCode::OK,
        HealthStatus::Degraded => StatusCode::SERVICE_UNAVAILABLE,
    };
    (code, Json(report)).into_response()
}

fn server_error() -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": "server error" })),
    )
        .into_response()
}
