use axum::{
    Json, Router,
    body::{Body, to_bytes},
    extract::{DefaultBodyLimit, State},
    http::{Request, StatusCode, header::CONTENT_TYPE},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::{
    api::{HealthStatus, IngestAccepted},
    error::IngestError,
    transport::SharedRuntime,
};

const METRICS_CONTENT_TYPE: &str = "application/openmetrics-text; version=1.0.0; charset=utf-8";

#[derive(Clone)]
struct AppState {
    runtime: SharedRuntime,
}

pub fn router(runtime: SharedRuntime) -> Router {
    Router::new()
        .route("/v1/logs", post(ingest_logs))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        // The body cap is enforced by the handler so oversized bodies map
        // to 400 rather than 413.
        .layer(DefaultBodyLimit::disable())
        .with_state(AppState { runtime })
}

/// Serves the gateway until `shutdown` fires, then drains open connections.
pub async fn serve(
    runtime: SharedRuntime,
    listener: TcpListener,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, "ingestion gateway listening");
    }
    axum::serve(listener, router(runtime))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

async fn ingest_logs(State(state): State<AppState>, request: Request<Body>) -> Response {
    let span = tracing::info_span!("ingest", project_id = tracing::field::Empty);
    async move {
        match ingest(&state, request).await {
            Ok(()) => (StatusCode::ACCEPTED, Json(IngestAccepted::yes())).into_response(),
            Err(err) => {
                tracing::debug!(status = err.status().as_u16(), error = %err, "ingest rejected");
                err.into_response()
            }
        }
    }
    .instrument(span)
    .await
}

async fn ingest(state: &AppState, request: Request<Body>) -> Result<(), IngestError> {
    let runtime = &state.runtime;
    let limit = runtime.config().max_body_bytes;
    let body = match to_bytes(request.into_body(), limit).await {
        Ok(bytes) => bytes,
        Err(err) => {
            runtime.metrics().ingest_bad_request.inc();
            return Err(IngestError::BadRequest(format!(
                "request body exceeds max body size of {limit} bytes or could not be read: {err}"
            )));
        }
    };
    let parsed = runtime.parse_body(&body)?;
    tracing::Span::current().record("project_id", parsed.project_id.as_str());
    runtime.ingest(parsed).await.map(|_| ())
}

async fn health() -> Json<HealthStatus> {
    Json(HealthStatus {
        status: "ok".to_string(),
    })
}

async fn metrics(State(state): State<AppState>) -> Result<Response, IngestError> {
    let body = state.runtime.metrics_text()?;
    Ok(([(CONTENT_TYPE, METRICS_CONTENT_TYPE)], body).into_response())
}
