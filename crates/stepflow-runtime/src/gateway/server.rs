use std::sync::Arc;

use axum::extract::rejection::{JsonRejection, PathRejection};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use super::response::ApiError;
use crate::workflow::{EventDispatcher, WorkflowExecutor};
use stepflow_core::config::GatewayConfig;
use stepflow_core::NewEvent;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Shared handler state.
pub struct GatewayState {
    pub dispatcher: EventDispatcher,
    pub executor: Arc<WorkflowExecutor>,
}

/// HTTP ingestion and query API.
pub struct GatewayServer {
    config: GatewayConfig,
    state: Arc<GatewayState>,
}

impl GatewayServer {
    /// Create a new gateway server.
    pub fn new(
        config: GatewayConfig,
        dispatcher: EventDispatcher,
        executor: Arc<WorkflowExecutor>,
    ) -> Self {
        Self {
            config,
            state: Arc::new(GatewayState {
                dispatcher,
                executor,
            }),
        }
    }

    /// Build the Axum router.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(health_handler))
            .route("/events", post(publish_handler))
            .route("/events/{id}/runs", get(event_runs_handler))
            .route("/runs/{id}", get(run_status_handler))
            .with_state(self.state.clone())
            .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
    }

    /// Serve until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), std::io::Error> {
        let addr = self.config.bind_addr();
        let router = self.router();

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!("Gateway server listening on {}", addr);

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await
    }
}

/// Health check handler.
async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// `POST /events`: ingest an event, answering `202 Accepted` with the ack.
async fn publish_handler(
    State(state): State<Arc<GatewayState>>,
    body: Result<Json<NewEvent>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(event) = body.map_err(|e| ApiError::validation(e.body_text()))?;
    let ack = state.dispatcher.publish(event).await?;
    Ok((StatusCode::ACCEPTED, Json(ack)).into_response())
}

async fn run_status_handler(
    State(state): State<Arc<GatewayState>>,
    run_id: Result<Path<Uuid>, PathRejection>,
) -> Result<Response, ApiError> {
    let Path(run_id) = run_id.map_err(|e| ApiError::validation(e.body_text()))?;
    let report = state.executor.status(run_id).await?;
    Ok(Json(report).into_response())
}

async fn event_runs_handler(
    State(state): State<Arc<GatewayState>>,
    Path(event_id): Path<String>,
) -> Result<Response, ApiError> {
    let reports = state.executor.runs_for_event(&event_id).await?;
    Ok(Json(reports).into_response())
}
