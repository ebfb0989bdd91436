use crate::server::AppState;
use axum::routing::get;
use axum::{Extension, Json};
use chrono::Utc;
use std::sync::Arc;

pub fn router() -> axum::Router {
    axum::Router::new().route("/api/v1/health", get(get_health))
}

#[tracing::instrument(level = "debug", skip_all)]
async fn get_health(Extension(state): Extension<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "checked_at": Utc::now(),
        "worker_id": state.worker_id,
        "store": state.store_backend,
        "model": state.model,
        "tenants": state.tenants.len(),
        "channels": state.channels,
        "uptime_seconds": state.started_at.elapsed().as_secs(),
    }))
}

#[cfg(test)]
mod tests {
    use crate::server::test_support::{runtime, test_app};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    #[tokio::test]
    async fn reports_worker_identity() {
        let runtime = runtime("hi");
        let response = test_app(&runtime)
            .oneshot(Request::get("/api/v1/health").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 16)
            .await
            .expect("body");
        let body: serde_json::Value = serde_json::from_slice(&bytes).expect("json");
        assert_eq!(body["worker_id"], "worker-test");
        assert_eq!(body["store"], "memory");
        assert_eq!(body["tenants"], 1);
    }
}
