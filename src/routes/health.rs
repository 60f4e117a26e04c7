//! Health check endpoints for Kubernetes probes and monitoring.

use axum::{Json, extract::State, response::IntoResponse};
use http::StatusCode;
use serde::Serialize;

use crate::{AppState, observability::metrics, runs::RunCounts};

/// Detailed health status response.
#[derive(Debug, Serialize)]
pub struct HealthStatus {
    /// "healthy" or "unhealthy"
    pub status: &'static str,
    pub version: &'static str,
    pub billing_source: ComponentStatus,
    pub runs: RunCounts,
}

/// Status of a single component.
#[derive(Debug, Serialize)]
pub struct ComponentStatus {
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub latency_ms: u64,
}

async fn check_billing_source(state: &AppState) -> ComponentStatus {
    let start = std::time::Instant::now();
    let result = state.pipeline.source().health_check().await;
    let latency_ms = start.elapsed().as_millis() as u64;

    match result {
        Ok(()) => ComponentStatus {
            healthy: true,
            message: None,
            latency_ms,
        },
        Err(e) => {
            tracing::warn!(error = %e, "Billing source health check failed");
            ComponentStatus {
                healthy: false,
                message: Some(e.to_string()),
                latency_ms,
            }
        }
    }
}

/// Full health check: billing table reachability plus run counts.
#[tracing::instrument(name = "health.check", skip(state))]
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let billing_source = check_billing_source(&state).await;
    let healthy = billing_source.healthy;

    let health = HealthStatus {
        status: if healthy { "healthy" } else { "unhealthy" },
        version: env!("CARGO_PKG_VERSION"),
        billing_source,
        runs: state.pipeline.registry().counts(),
    };

    let status_code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status_code, Json(health))
}

/// Kubernetes liveness probe. Always succeeds while the process serves.
#[tracing::instrument(name = "health.liveness")]
pub async fn liveness() -> impl IntoResponse {
    StatusCode::OK
}

/// Kubernetes readiness probe: ready when the billing table is reachable.
#[tracing::instrument(name = "health.readiness", skip(state))]
pub async fn readiness(State(state): State<AppState>) -> impl IntoResponse {
    if check_billing_source(&state).await.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Prometheus metrics endpoint.
#[tracing::instrument(name = "health.metrics")]
pub async fn metrics() -> impl IntoResponse {
    match metrics::render() {
        Some(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        ),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [("content-type", "text/plain")],
            "Metrics not initialized".to_string(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{Router, body::Body};
    use http::Request;
    use serde_json::Value;
    use tower::ServiceExt;

    use super::*;
    use crate::{
        billing::{QueryError, memory::InMemoryBillingSource},
        sheets::memory::InMemorySheetWriter,
        tests::test_state,
    };

    fn app(source: InMemoryBillingSource) -> Router {
        let state = test_state(source, Arc::new(InMemorySheetWriter::new()));
        crate::build_app(&state.config.clone(), state)
    }

    async fn get(app: &Router, uri: &str) -> (StatusCode, Value) {
        let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&body).unwrap_or(Value::Null))
    }

    #[tokio::test]
    async fn test_health_check_healthy() {
        let app = app(InMemoryBillingSource::default());

        let (status, body) = get(&app, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["billing_source"]["healthy"], true);
        assert_eq!(body["runs"]["running"], 0);
        assert!(body["version"].as_str().unwrap().contains('.'));
    }

    #[tokio::test]
    async fn test_liveness_always_ok() {
        let app = app(InMemoryBillingSource::default());
        let (status, _) = get(&app, "/health/live").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_readiness_ok() {
        let app = app(InMemoryBillingSource::default());
        let (status, _) = get(&app, "/health/ready").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_health_check_unhealthy_source() {
        let source = InMemoryBillingSource::default();
        source.fail_health(QueryError::Unavailable("table missing".into()));
        let app = app(source);

        let (status, body) = get(&app, "/health").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["status"], "unhealthy");
        assert!(
            body["billing_source"]["message"]
                .as_str()
                .unwrap()
                .contains("table missing")
        );
    }
}
