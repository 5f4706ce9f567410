//! HTTP surface: `POST /ask` and `GET /health`.

use crate::error::WorkflowError;
use crate::models::{AskRequest, AskResponse};
use crate::orchestrator::Workflow;
use anyhow::{Context, Result};
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Build the router around a shared workflow.
pub fn build_router(workflow: Arc<Workflow>) -> Router {
    Router::new()
        .route("/ask", post(ask))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(workflow)
}

async fn ask(
    State(workflow): State<Arc<Workflow>>,
    payload: Result<Json<AskRequest>, JsonRejection>,
) -> (StatusCode, Json<AskResponse>) {
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => {
            warn!("Rejected /ask body: {}", rejection.body_text());
            return (
                StatusCode::BAD_REQUEST,
                Json(AskResponse::Failure {
                    error: format!("invalid request: {}", rejection.body_text()),
                }),
            );
        }
    };

    match workflow.run(request).await {
        Ok(response) => (
            StatusCode::OK,
            Json(AskResponse::Answer {
                markdown: response.markdown,
            }),
        ),
        Err(e) => (
            status_for(&e),
            Json(AskResponse::Failure {
                error: e.to_string(),
            }),
        ),
    }
}

async fn health() -> Json<Value> {
    Json(json!({"status": "ok", "version": env!("CARGO_PKG_VERSION")}))
}

fn status_for(error: &WorkflowError) -> StatusCode {
    match error {
        WorkflowError::Validation(_) => StatusCode::BAD_REQUEST,
        WorkflowError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Serve until Ctrl+C or SIGTERM.
pub async fn serve(workflow: Arc<Workflow>, bind: &str) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("Failed to bind {}", bind))?;
    info!("Listening on http://{}", bind);

    axum::serve(listener, build_router(workflow))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
