//! Optional status endpoint: `/health` and `/metrics`

use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::get;
use key_pool::CredentialPool;
use metrics_exporter_prometheus::PrometheusHandle;

use crate::batch::RunProgress;

/// Shared state for status handlers
#[derive(Clone)]
pub struct AppState {
    pub pool: Arc<CredentialPool>,
    pub progress: Arc<RunProgress>,
    pub prometheus: PrometheusHandle,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Returns 200 while the pool has a credential it is not avoiding, 503 when
/// the pool is empty. Some-but-not-all failed credentials report "degraded".
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let pool = state.pool.status().await;

    let (status_code, status) = if pool.total == 0 {
        (StatusCode::SERVICE_UNAVAILABLE, "unhealthy")
    } else if pool.failed_count > 0 {
        (StatusCode::OK, "degraded")
    } else {
        (StatusCode::OK, "healthy")
    };

    let body = serde_json::json!({
        "status": status,
        "pool": pool,
        "run": state.progress.snapshot(),
    });

    (
        status_code,
        [(header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics in text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}
