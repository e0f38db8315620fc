use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use tracing::warn;

use crate::AppState;
use crate::metrics;

/// Health check endpoint - returns server status
pub async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let metrics = state.metrics.snapshot();

    let (status, sessions, open_conflict_cases) = match state.db.get_stats().await {
        Ok(stats) => ("healthy", stats.sessions, stats.open_conflict_cases),
        Err(e) => {
            warn!("Failed to read database stats: {:#}", e);
            ("degraded", 0, 0)
        }
    };

    Json(metrics::HealthStatus {
        status: status.to_string(),
        active_turns: metrics.turns.active,
        sessions,
        open_conflict_cases,
        uptime_secs: metrics.uptime_secs,
    })
}

/// Metrics endpoint - returns detailed server metrics
pub async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.metrics.snapshot())
}

/// Liveness probe - returns 200 if the server is running
pub async fn health_live_handler() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "alive" }))
}

/// Readiness probe - returns 200 if the server is ready to accept requests
pub async fn health_ready_handler(State(state): State<AppState>) -> Response {
    let db_ok = state.db.pool.acquire().await.is_ok();

    if db_ok {
        Json(serde_json::json!({
            "status": "ready",
            "database": "connected"
        }))
        .into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "database": "disconnected"
            })),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Router, body::Body, http::Request, routing::get};
    use tower::ServiceExt;

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let resp = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    async fn test_router() -> Router {
        let state = crate::test_helpers::test_app_state().await;
        Router::new()
            .route("/health", get(health_handler))
            .route("/health/live", get(health_live_handler))
            .route("/health/ready", get(health_ready_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(state)
    }

    #[tokio::test]
    async fn test_health_is_healthy() {
        let (status, json) = get_json(test_router().await, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["active_turns"], 0);
        assert_eq!(json["sessions"], 0);
    }

    #[tokio::test]
    async fn test_live() {
        let (status, json) = get_json(test_router().await, "/health/live").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "alive");
    }

    #[tokio::test]
    async fn test_ready_with_database() {
        let (status, json) = get_json(test_router().await, "/health/ready").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["database"], "connected");
    }

    #[tokio::test]
    async fn test_metrics_snapshot_shape() {
        let (status, json) = get_json(test_router().await, "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["turns"]["started"], 0);
        assert_eq!(json["markers"]["applied"], 0);
    }
}
