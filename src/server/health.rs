//! Health check endpoints
//!
//! - `/health/live`: the process is up
//! - `/health/ready`: the queue and the coordination store both answer
//! - `/health`: readiness plus queue depth, version and uptime
//!
//! ```yaml
//! livenessProbe:
//!   httpGet:
//!     path: /health/live
//!     port: 9090
//! readinessProbe:
//!   httpGet:
//!     path: /health/ready
//!     port: 9090
//! ```

use std::time::Instant;

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;

use super::AppState;
use crate::queue::QueueCounts;
use crate::utils::millis;

// ============================================================================
// Health Status Types
// ============================================================================

/// Overall health status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Unhealthy => "unhealthy",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            HealthStatus::Healthy => StatusCode::OK,
            HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

/// Component health check result
#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub name: String,
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub latency_ms: u64,
}

#[derive(Debug, Serialize)]
pub struct LivenessResponse {
    pub status: HealthStatus,
    pub timestamp: String,
}

#[derive(Debug, Serialize)]
pub struct ReadinessResponse {
    pub status: HealthStatus,
    pub timestamp: String,
    pub checks: Vec<ComponentHealth>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub version: String,
    pub uptime_secs: u64,
    pub timestamp: String,
    pub checks: Vec<ComponentHealth>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue: Option<QueueCounts>,
}

// ============================================================================
// Router
// ============================================================================

pub fn create_health_router(state: AppState) -> Router {
    Router::new()
        .route("/health/live", get(liveness_probe))
        .route("/health/ready", get(readiness_probe))
        .route("/health", get(health_check))
        .with_state(state)
}

// ============================================================================
// Checks
// ============================================================================

fn component<E: std::fmt::Display>(
    name: &str,
    started: Instant,
    result: Result<(), E>,
) -> ComponentHealth {
    let latency_ms = millis(started.elapsed());
    match result {
        Ok(()) => ComponentHealth {
            name: name.to_string(),
            status: HealthStatus::Healthy,
            message: None,
            latency_ms,
        },
        Err(e) => ComponentHealth {
            name: name.to_string(),
            status: HealthStatus::Unhealthy,
            message: Some(e.to_string()),
            latency_ms,
        },
    }
}

async fn run_checks(state: &AppState) -> (HealthStatus, Vec<ComponentHealth>) {
    let started = Instant::now();
    let queue = component(
        &format!("queue:{}", state.queue.backend_name()),
        started,
        state.queue.health_check().await,
    );

    let started = Instant::now();
    let store = component(
        &format!("store:{}", state.store.backend_name()),
        started,
        state.store.ping().await,
    );

    let checks = vec![queue, store];
    let status = if checks.iter().all(|c| c.status == HealthStatus::Healthy) {
        HealthStatus::Healthy
    } else {
        HealthStatus::Unhealthy
    };
    (status, checks)
}

// ============================================================================
// Handlers
// ============================================================================

async fn liveness_probe() -> impl IntoResponse {
    let response = LivenessResponse {
        status: HealthStatus::Healthy,
        timestamp: chrono::Utc::now().to_rfc3339(),
    };
    (StatusCode::OK, Json(response))
}

async fn readiness_probe(State(state): State<AppState>) -> impl IntoResponse {
    let (status, checks) = run_checks(&state).await;
    if status != HealthStatus::Healthy {
        tracing::warn!(checks = ?checks, "Readiness check failed");
    }

    let response = ReadinessResponse {
        status,
        timestamp: chrono::Utc::now().to_rfc3339(),
        checks,
    };
    (status.status_code(), Json(response))
}

async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let (status, checks) = run_checks(&state).await;
    let queue = state.queue.counts().await.ok();

    let response = HealthResponse {
        status,
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        checks,
        queue,
    };
    (status.status_code(), Json(response))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawl::MemoryStore;
    use crate::queue::{JobPayload, JobQueue, ScrapeJob, SqliteJobQueue};
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use std::sync::Arc;
    use tower::ServiceExt;
    use uuid::Uuid;

    async fn get_json(state: AppState, path: &str) -> (StatusCode, serde_json::Value) {
        let response = create_health_router(state)
            .oneshot(Request::get(path).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[test]
    fn test_health_status_code() {
        assert_eq!(HealthStatus::Healthy.status_code(), StatusCode::OK);
        assert_eq!(
            HealthStatus::Unhealthy.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(HealthStatus::Unhealthy.as_str(), "unhealthy");
    }

    #[tokio::test]
    async fn test_liveness() {
        let state = AppState::new(
            Arc::new(SqliteJobQueue::in_memory().unwrap()),
            Arc::new(MemoryStore::new()),
        );
        let (status, body) = get_json(state, "/health/live").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
    }

    #[tokio::test]
    async fn test_readiness_checks_both_backends() {
        let state = AppState::new(
            Arc::new(SqliteJobQueue::in_memory().unwrap()),
            Arc::new(MemoryStore::new()),
        );
        let (status, body) = get_json(state, "/health/ready").await;
        assert_eq!(status, StatusCode::OK);

        let names: Vec<&str> = body["checks"]
            .as_array()
            .unwrap()
            .iter()
            .map(|c| c["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["queue:sqlite", "store:memory"]);
    }

    #[tokio::test]
    async fn test_health_reports_queue_depth() {
        let queue = Arc::new(SqliteJobQueue::in_memory().unwrap());
        queue
            .add_job(
                Uuid::new_v4(),
                JobPayload::Scrape(ScrapeJob::standalone("https://example.com")),
            )
            .await
            .unwrap();
        let state = AppState::new(queue, Arc::new(MemoryStore::new()));

        let (status, body) = get_json(state, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["queue"]["queued"], 1);
        assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    }
}
