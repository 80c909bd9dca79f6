//! Health and metrics endpoints
//!
//! `/healthz` answers as soon as the process serves; `/readyz` once the
//! `ready` token has been cancelled (rehydration done and, when enabled, the
//! leader lease held); `/metrics` renders the Prometheus registry.

use crate::error::RuntimeError;
use crate::metrics::Metrics;
use axum::extract::State as AxumState;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

#[derive(Debug, Clone)]
struct State {
    ready: CancellationToken,
    metrics: Option<Metrics>,
}

/// Readiness answer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Serving
    Ready,
    /// Still starting
    NotReady,
}

impl IntoResponse for Readiness {
    fn into_response(self) -> Response {
        match self {
            Readiness::Ready => (StatusCode::OK, "ok").into_response(),
            Readiness::NotReady => (StatusCode::SERVICE_UNAVAILABLE, "not ready").into_response(),
        }
    }
}

/// Router serving the health endpoints, plus `/metrics` when `metrics` is set
pub fn router(ready: CancellationToken, metrics: Option<Metrics>) -> Router {
    let state = Arc::new(State { ready, metrics });
    let mut router = Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz));
    if state.metrics.is_some() {
        router = router.route("/metrics", get(render_metrics));
    }
    router.with_state(state).layer(TraceLayer::new_for_http())
}

async fn healthz() -> &'static str {
    "ok"
}

async fn readyz(AxumState(state): AxumState<Arc<State>>) -> Readiness {
    if state.ready.is_cancelled() {
        Readiness::Ready
    } else {
        Readiness::NotReady
    }
}

async fn render_metrics(AxumState(state): AxumState<Arc<State>>) -> Response {
    let Some(metrics) = &state.metrics else {
        return StatusCode::NOT_FOUND.into_response();
    };
    match metrics.encode() {
        Ok(body) => body.into_response(),
        Err(e) => {
            warn!(error = %e, "Failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Serve `router` on `addr` until `cancel` fires
pub async fn serve(addr: SocketAddr, router: Router, cancel: CancellationToken) -> Result<(), RuntimeError> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "HTTP endpoint listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn get_status(addr: SocketAddr, path: &str) -> (u16, String) {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        let status = response
            .split_whitespace()
            .nth(1)
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        (status, response)
    }

    #[tokio::test]
    async fn test_health_and_metrics_endpoints() {
        let ready = CancellationToken::new();
        let cancel = CancellationToken::new();
        let metrics = Metrics::new().unwrap();
        metrics.observe("publicip", "success", std::time::Duration::from_millis(1));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(ready.clone(), Some(metrics));
        let server = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                axum::serve(listener, app)
                    .with_graceful_shutdown(async move { cancel.cancelled().await })
                    .await
            }
        });

        assert_eq!(get_status(addr, "/healthz").await.0, 200);
        assert_eq!(get_status(addr, "/readyz").await.0, 503);
        ready.cancel();
        assert_eq!(get_status(addr, "/readyz").await.0, 200);

        let (status, body) = get_status(addr, "/metrics").await;
        assert_eq!(status, 200);
        assert!(body.contains("reconcile_total"));

        cancel.cancel();
        server.await.unwrap().unwrap();
    }
}
