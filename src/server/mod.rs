//! Operational HTTP surface of a worker process
//!
//! Liveness, readiness and Prometheus metrics. Nothing here accepts work;
//! crawls and scrapes enter through the queue.

pub mod health;

use std::net::SocketAddr;
use std::time::Instant;

use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;

use crate::crawl::SharedStore;
use crate::metrics;
use crate::queue::SharedJobQueue;

pub use health::{ComponentHealth, HealthStatus};

// ============================================================================
// Configuration
// ============================================================================

/// Health server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Serve health and metrics at all
    pub enabled: bool,

    pub bind_address: SocketAddr,

    /// Log every request through the trace layer
    pub enable_request_logging: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: SocketAddr::from(([0, 0, 0, 0], 9090)),
            enable_request_logging: false,
        }
    }
}

/// Errors starting or running the health server
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("server error: {0}")]
    Serve(#[from] std::io::Error),
}

// ============================================================================
// App State
// ============================================================================

/// Handles the probes inspect
#[derive(Clone)]
pub struct AppState {
    pub queue: SharedJobQueue,
    pub store: SharedStore,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(queue: SharedJobQueue, store: SharedStore) -> Self {
        Self {
            queue,
            store,
            start_time: Instant::now(),
        }
    }
}

// ============================================================================
// Router
// ============================================================================

/// Health routes plus `/metrics`
pub fn build_router(state: AppState, config: &ServerConfig) -> Router {
    let router = health::create_health_router(state).route("/metrics", get(metrics_handler));

    if config.enable_request_logging {
        router.layer(TraceLayer::new_for_http())
    } else {
        router
    }
}

async fn metrics_handler() -> impl IntoResponse {
    match metrics::encode_metrics() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

/// Serve until `shutdown` flips to `true`
pub async fn serve(
    state: AppState,
    config: &ServerConfig,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), ServerError> {
    let addr = config.bind_address;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind { addr, source })?;

    tracing::info!(addr = %addr, "Health server listening");

    axum::serve(listener, build_router(state, config))
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await?;

    tracing::info!("Health server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawl::MemoryStore;
    use crate::queue::SqliteJobQueue;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn state() -> AppState {
        AppState::new(
            Arc::new(SqliteJobQueue::in_memory().unwrap()),
            Arc::new(MemoryStore::new()),
        )
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        metrics::init_metrics().unwrap();
        let router = build_router(state(), &ServerConfig::default());

        let response = router
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("crawlq_"));
    }

    #[tokio::test]
    async fn test_serve_stops_on_shutdown() {
        let config = ServerConfig {
            bind_address: SocketAddr::from(([127, 0, 0, 1], 0)),
            ..Default::default()
        };
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move { serve(state(), &config, rx).await });

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
