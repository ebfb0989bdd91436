//! Generic message ingress for channels without a dedicated webhook.

use crate::gateway::{IngestError, IngestOutcome};
use crate::routes::error;
use crate::server::AppState;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Extension, Json};
use chrono::{DateTime, Utc};
use sb_channels::{InboundMessage, InboundMessageKind, TenantId};
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct IngressRequest {
    tenant_id: String,
    #[serde(default = "default_channel")]
    channel: String,
    sender: String,
    text: String,
    #[serde(default)]
    message_id: Option<String>,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    metadata: serde_json::Value,
}

fn default_channel() -> String {
    "http".to_string()
}

pub fn router() -> axum::Router {
    axum::Router::new().route("/api/v1/ingress/messages", post(ingest_message))
}

#[tracing::instrument(level = "info", skip_all, fields(tenant = %req.tenant_id, channel = %req.channel))]
async fn ingest_message(
    Extension(state): Extension<Arc<AppState>>,
    Json(req): Json<IngressRequest>,
) -> Response {
    let inbound = InboundMessage {
        kind: InboundMessageKind::Message,
        message_id: req
            .message_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| ulid::Ulid::new().to_string())
            .into(),
        channel_id: req.channel.trim().into(),
        tenant_id: TenantId::new(req.tenant_id.trim()),
        sender_id: req.sender.trim().into(),
        content: req.text,
        metadata: req.metadata,
        received_at: req.timestamp.unwrap_or_else(Utc::now),
    };

    match state.gateway.ingest(inbound).await {
        Ok(outcome @ IngestOutcome::Accepted(_)) => {
            (StatusCode::ACCEPTED, Json(outcome)).into_response()
        }
        Ok(outcome @ IngestOutcome::Ignored { .. }) => (StatusCode::OK, Json(outcome)).into_response(),
        Err(e @ IngestError::UnknownTenant(_)) => error(StatusCode::NOT_FOUND, e.to_string()),
        Err(e @ IngestError::InvalidSender(_)) => error(StatusCode::BAD_REQUEST, e.to_string()),
        Err(IngestError::Store(e)) => {
            tracing::error!(error = %e, "store unavailable for inbound message");
            error(StatusCode::SERVICE_UNAVAILABLE, e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::server::test_support::{runtime, test_app};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    async fn post(runtime: &crate::server::Runtime, body: serde_json::Value) -> (StatusCode, serde_json::Value) {
        let response = test_app(runtime)
            .oneshot(
                Request::post("/api/v1/ingress/messages")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .expect("request"),
            )
            .await
            .expect("response");
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 16)
            .await
            .expect("body");
        (status, serde_json::from_slice(&bytes).expect("json"))
    }

    #[tokio::test]
    async fn accepts_and_batches_fragments() {
        let runtime = runtime("hi");
        let (status, body) = post(
            &runtime,
            serde_json::json!({ "tenant_id": "salon-1", "sender": "+7 (912) 345-67-89", "text": "hi" }),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["status"], "accepted");
        assert_eq!(body["conversation"], "salon-1:79123456789");
        assert_eq!(body["fragments"], 1);

        let (_, body) = post(
            &runtime,
            serde_json::json!({ "tenant_id": "salon-1", "sender": "89123456789", "text": "haircut?" }),
        )
        .await;
        assert_eq!(body["fragments"], 2);
    }

    #[tokio::test]
    async fn maps_rejections_to_statuses() {
        let runtime = runtime("hi");
        let (status, _) = post(
            &runtime,
            serde_json::json!({ "tenant_id": "nope", "sender": "79123456789", "text": "hi" }),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = post(
            &runtime,
            serde_json::json!({ "tenant_id": "salon-1", "sender": "  ", "text": "hi" }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = post(
            &runtime,
            serde_json::json!({ "tenant_id": "salon-1", "sender": "79123456789", "text": "  " }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ignored");
    }
}
