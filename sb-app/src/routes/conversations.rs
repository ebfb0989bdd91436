//! Read-only inspection of a conversation's shared state.

use crate::routes::error;
use crate::server::AppState;
use axum::extract::Path;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Extension, Json};
use sb_channels::{ConversationKey, TenantId};
use std::sync::Arc;

pub fn router() -> axum::Router {
    axum::Router::new()
        .route(
            "/api/v1/conversations/{tenant}/{subscriber}/context",
            get(get_context),
        )
        .route(
            "/api/v1/conversations/{tenant}/{subscriber}/pending",
            get(get_pending),
        )
}

fn conversation_key(
    state: &AppState,
    tenant: &str,
    subscriber: &str,
) -> Result<ConversationKey, Response> {
    let Some(profile) = state.tenants.get(&TenantId::new(tenant)) else {
        return Err(error(StatusCode::NOT_FOUND, format!("unknown tenant: {tenant}")));
    };
    profile
        .conversation_key(subscriber)
        .ok_or_else(|| error(StatusCode::BAD_REQUEST, "invalid subscriber"))
}

#[tracing::instrument(level = "debug", skip_all)]
async fn get_context(
    Extension(state): Extension<Arc<AppState>>,
    Path((tenant, subscriber)): Path<(String, String)>,
) -> Response {
    let key = match conversation_key(&state, &tenant, &subscriber) {
        Ok(key) => key,
        Err(response) => return response,
    };
    match state.contexts.get(&key).await {
        Ok(Some(record)) => {
            let processing = state.contexts.is_processing(&key).await.unwrap_or(false);
            Json(serde_json::json!({
                "conversation": key.to_string(),
                "processing": processing,
                "context": record,
            }))
            .into_response()
        }
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({
                "conversation": key.to_string(),
                "status": "idle",
            })),
        )
            .into_response(),
        Err(e) => error(StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
    }
}

#[tracing::instrument(level = "debug", skip_all)]
async fn get_pending(
    Extension(state): Extension<Arc<AppState>>,
    Path((tenant, subscriber)): Path<(String, String)>,
) -> Response {
    let key = match conversation_key(&state, &tenant, &subscriber) {
        Ok(key) => key,
        Err(response) => return response,
    };
    match state.batcher.pending(&key).await {
        Ok(pending) => Json(serde_json::json!({
            "conversation": key.to_string(),
            "pending": pending,
        }))
        .into_response(),
        Err(e) => error(StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use crate::server::test_support::{runtime, test_app};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use sb_channels::ConversationKey;
    use tower::ServiceExt;

    async fn get(runtime: &crate::server::Runtime, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = test_app(runtime)
            .oneshot(Request::get(uri).body(Body::empty()).expect("request"))
            .await
            .expect("response");
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
            .await
            .expect("body");
        (status, serde_json::from_slice(&bytes).expect("json"))
    }

    #[tokio::test]
    async fn idle_conversation_has_no_context() {
        let runtime = runtime("hi");
        let (status, body) = get(
            &runtime,
            "/api/v1/conversations/salon-1/79123456789/context",
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["status"], "idle");

        let (status, _) = get(&runtime, "/api/v1/conversations/nope/79123456789/context").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn shows_running_turn_and_pending_batch() {
        let runtime = runtime("hi");
        let key = ConversationKey::new("salon-1", "79123456789");
        runtime
            .state
            .contexts
            .begin_processing(&key, "book me")
            .await
            .expect("begin");

        let (status, body) = get(
            &runtime,
            "/api/v1/conversations/salon-1/89123456789/context",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["processing"], true);
        assert_eq!(body["context"]["status"], "started");
        assert_eq!(body["context"]["worker_id"], "worker-test");

        let (status, body) = get(
            &runtime,
            "/api/v1/conversations/salon-1/79123456789/pending",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["pending"].is_null());
    }
}
