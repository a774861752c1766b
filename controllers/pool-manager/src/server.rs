//! HTTP endpoints for probes and metrics.

use crate::error::ControllerError;
use crate::metrics;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::Registry;
use std::net::SocketAddr;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::timeout::{RequestBodyTimeoutLayer, TimeoutLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Builds the router serving `/healthz`, `/readyz` and `/metrics`.
///
/// `read_timeout` bounds reading a request body, `write_timeout` bounds
/// handling the whole request.
pub fn router(registry: Registry, read_timeout: Duration, write_timeout: Duration) -> Router {
    Router::new()
        .route("/healthz", get(ok))
        .route("/readyz", get(ok))
        .route("/metrics", get(render_metrics))
        .with_state(registry)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(TimeoutLayer::new(write_timeout))
                .layer(RequestBodyTimeoutLayer::new(read_timeout)),
        )
}

/// Serves `router` on `addr` until `cancel` fires.
///
/// # Errors
///
/// Returns [`ControllerError::Server`] if the address cannot be bound or the
/// server fails.
pub async fn serve(addr: SocketAddr, router: Router, cancel: CancellationToken) -> Result<(), ControllerError> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    if let Ok(local) = listener.local_addr() {
        info!("Starting http server on http://{local}");
    }
    axum::serve(listener, router)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await?;
    info!("Http server stopped");
    Ok(())
}

async fn ok() -> &'static str {
    "Ok"
}

async fn render_metrics(State(registry): State<Registry>) -> impl IntoResponse {
    match metrics::render(&registry) {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)],
            body,
        ),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
                e.to_string(),
            )
        }
    }
}
