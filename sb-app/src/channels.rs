//! Enabled channels: outbound adapters per tenant plus the inbound webhook
//! routes that feed the gateway.

use crate::config::SalonbotConfig;
use crate::gateway::{Gateway, IngestError, IngestOutcome};
use crate::outbound::ChannelRegistry;
use crate::tenants::TenantRegistry;
use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use sb_channels::{
    InboundMessage, InboundMessageKind, LogChannelAdapter, TenantId, WhatsAppCloudAdapter,
};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::Arc;

pub const WHATSAPP_WEBHOOK_PATH: &str = "/api/v1/channels/whatsapp/webhook";

/// Outbound adapters for every enabled channel. WhatsApp gets one adapter
/// per tenant phone number.
pub fn build_channel_registry(
    cfg: &SalonbotConfig,
    tenants: &TenantRegistry,
) -> Result<ChannelRegistry> {
    let mut registry = ChannelRegistry::default();

    if cfg.channels.log.enabled {
        registry.register(Arc::new(LogChannelAdapter::new(
            cfg.channels.log.channel_id.clone(),
        )));
    }

    let whatsapp = &cfg.channels.whatsapp;
    if whatsapp.enabled {
        let mut bound = 0usize;
        for (phone_number_id, tenant) in tenants.bindings_for("whatsapp") {
            let mut adapter = WhatsAppCloudAdapter::new(&whatsapp.access_token, phone_number_id)
                .with_context(|| format!("whatsapp adapter for tenant {tenant}"))?;
            if let Some(api_base) = whatsapp.api_base.as_deref() {
                adapter = adapter.with_api_base(api_base);
            }
            registry.register_for_tenant(tenant.clone(), Arc::new(adapter));
            bound += 1;
        }
        if bound == 0 {
            tracing::warn!("whatsapp enabled but no tenant has a whatsapp_phone_number_id");
        }
    }

    tracing::info!(channels = ?registry.channel_ids(), "channels loaded");
    Ok(registry)
}

/// Webhook routes for enabled inbound channels.
pub fn webhook_routers(
    cfg: &SalonbotConfig,
    tenants: Arc<TenantRegistry>,
    gateway: Arc<Gateway>,
) -> Vec<Router> {
    let mut routers = Vec::new();
    let whatsapp = &cfg.channels.whatsapp;
    if whatsapp.enabled {
        routers.push(whatsapp_webhook_router(
            tenants,
            gateway,
            whatsapp.verify_token.clone().unwrap_or_default(),
            whatsapp.app_secret.clone(),
        ));
    }
    routers
}

struct WhatsAppWebhookState {
    tenants: Arc<TenantRegistry>,
    gateway: Arc<Gateway>,
    verify_token: String,
    app_secret: Option<String>,
}

pub fn whatsapp_webhook_router(
    tenants: Arc<TenantRegistry>,
    gateway: Arc<Gateway>,
    verify_token: String,
    app_secret: Option<String>,
) -> Router {
    let state = Arc::new(WhatsAppWebhookState {
        tenants,
        gateway,
        verify_token: verify_token.trim().to_string(),
        app_secret: app_secret
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(ToOwned::to_owned),
    });
    Router::new()
        .route(
            WHATSAPP_WEBHOOK_PATH,
            get(whatsapp_webhook_verify).post(whatsapp_webhook_ingest),
        )
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct WhatsAppVerifyQuery {
    #[serde(rename = "hub.mode")]
    mode: Option<String>,
    #[serde(rename = "hub.verify_token")]
    verify_token: Option<String>,
    #[serde(rename = "hub.challenge")]
    challenge: Option<String>,
}

async fn whatsapp_webhook_verify(
    State(state): State<Arc<WhatsAppWebhookState>>,
    Query(query): Query<WhatsAppVerifyQuery>,
) -> impl IntoResponse {
    let mode = query.mode.as_deref().map(str::trim).unwrap_or_default();
    let token = query
        .verify_token
        .as_deref()
        .map(str::trim)
        .unwrap_or_default();
    if mode.eq_ignore_ascii_case("subscribe")
        && !state.verify_token.is_empty()
        && constant_time_eq(token, &state.verify_token)
    {
        return (StatusCode::OK, query.challenge.unwrap_or_default()).into_response();
    }
    (StatusCode::FORBIDDEN, "verification failed".to_string()).into_response()
}

fn error_response(status: StatusCode, error: impl Into<String>) -> axum::response::Response {
    (
        status,
        Json(serde_json::json!({
            "status": "error",
            "error": error.into(),
        })),
    )
        .into_response()
}

#[tracing::instrument(level = "debug", skip_all)]
async fn whatsapp_webhook_ingest(
    State(state): State<Arc<WhatsAppWebhookState>>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    if let Some(secret) = state.app_secret.as_deref() {
        if !verify_whatsapp_signature(&headers, &body, secret) {
            return error_response(StatusCode::UNAUTHORIZED, "invalid x-hub-signature-256");
        }
    }

    let payload: WhatsAppWebhookPayload = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(error) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                format!("invalid whatsapp webhook payload: {error}"),
            );
        }
    };

    let mut accepted = 0usize;
    let mut ignored = 0usize;
    for entry in payload.entry {
        for change in entry.changes {
            let phone_number_id = change
                .value
                .metadata
                .as_ref()
                .and_then(|metadata| metadata.phone_number_id.as_deref())
                .unwrap_or_default()
                .to_string();
            let Some(tenant) = state.tenants.resolve_binding("whatsapp", &phone_number_id) else {
                tracing::warn!(phone_number_id, messages = change.value.messages.len(), "webhook for unbound phone number");
                ignored += change.value.messages.len();
                continue;
            };
            for message in change.value.messages {
                let Some(inbound) = convert_whatsapp_message(&message, &tenant.id, &phone_number_id)
                else {
                    ignored += 1;
                    continue;
                };
                match state.gateway.ingest(inbound).await {
                    Ok(IngestOutcome::Accepted(_)) => accepted += 1,
                    Ok(IngestOutcome::Ignored { .. }) => ignored += 1,
                    // Let the platform redeliver.
                    Err(IngestError::Store(error)) => {
                        tracing::error!(error = %error, "store unavailable for whatsapp message");
                        return error_response(
                            StatusCode::SERVICE_UNAVAILABLE,
                            format!("store unavailable: {error}"),
                        );
                    }
                    Err(error) => {
                        tracing::warn!(error = %error, "whatsapp message rejected");
                        ignored += 1;
                    }
                }
            }
        }
    }

    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "ok",
            "accepted": accepted,
            "ignored": ignored,
        })),
    )
        .into_response()
}

fn convert_whatsapp_message(
    message: &WhatsAppMessage,
    tenant_id: &TenantId,
    phone_number_id: &str,
) -> Option<InboundMessage> {
    let sender = message.from.trim();
    if sender.is_empty() {
        return None;
    }
    let message_id = if message.id.trim().is_empty() {
        ulid::Ulid::new().to_string()
    } else {
        message.id.clone()
    };

    let (kind, content) = match message.message_type.as_str() {
        "text" => (
            InboundMessageKind::Message,
            message.text.as_ref().map(|text| text.body.trim())?,
        ),
        "reaction" => (
            InboundMessageKind::Reaction,
            message.reaction.as_ref().map(|reaction| reaction.emoji.trim())?,
        ),
        _ => return None,
    };
    if content.is_empty() {
        return None;
    }

    Some(InboundMessage {
        kind,
        message_id: message_id.into(),
        channel_id: "whatsapp".into(),
        tenant_id: tenant_id.clone(),
        sender_id: sender.into(),
        content: content.to_string(),
        metadata: serde_json::json!({
            "provider": "whatsapp_cloud",
            "phone_number_id": phone_number_id,
            "message": message,
        }),
        received_at: Utc::now(),
    })
}

type HmacSha256 = Hmac<Sha256>;

/// Check `X-Hub-Signature-256: sha256=<hex>` against an HMAC of the raw body.
fn verify_whatsapp_signature(headers: &HeaderMap, body: &[u8], app_secret: &str) -> bool {
    let Some(signature) = headers
        .get("x-hub-signature-256")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().strip_prefix("sha256="))
        .and_then(|digest| hex::decode(digest).ok())
    else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(app_secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&signature).is_ok()
}

fn constant_time_eq(left: &str, right: &str) -> bool {
    let (left, right) = (left.as_bytes(), right.as_bytes());
    let mut diff = left.len() ^ right.len();
    for index in 0..left.len().max(right.len()) {
        let l = left.get(index).copied().unwrap_or(0);
        let r = right.get(index).copied().unwrap_or(0);
        diff |= (l ^ r) as usize;
    }
    diff == 0
}

#[derive(Debug, Deserialize)]
struct WhatsAppWebhookPayload {
    #[serde(default)]
    entry: Vec<WhatsAppEntry>,
}

#[derive(Debug, Deserialize)]
struct WhatsAppEntry {
    #[serde(default)]
    changes: Vec<WhatsAppChange>,
}

#[derive(Debug, Deserialize)]
struct WhatsAppChange {
    #[serde(default)]
    value: WhatsAppChangeValue,
}

#[derive(Debug, Default, Deserialize)]
struct WhatsAppChangeValue {
    #[serde(default)]
    metadata: Option<WhatsAppMetadata>,
    #[serde(default)]
    messages: Vec<WhatsAppMessage>,
}

#[derive(Debug, Clone, Deserialize)]
struct WhatsAppMetadata {
    #[serde(default)]
    phone_number_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WhatsAppMessage {
    #[serde(default)]
    id: String,
    #[serde(default)]
    from: String,
    #[serde(rename = "type", default)]
    message_type: String,
    #[serde(default)]
    text: Option<WhatsAppText>,
    #[serde(default)]
    reaction: Option<WhatsAppReaction>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WhatsAppText {
    #[serde(default)]
    body: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WhatsAppReaction {
    #[serde(default)]
    emoji: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::tests::gateway;
    use crate::tenants::fixtures::registry;
    use crate::turn::test_support::ScriptedModel;
    use axum::body::Body;
    use axum::http::{HeaderValue, Request};
    use tower::ServiceExt;

    const SECRET: &str = "app-secret";

    fn router() -> (Router, crate::turn::test_support::Harness) {
        let (gateway, harness, _tx) = gateway(ScriptedModel::replying("Hi"));
        let router = whatsapp_webhook_router(
            Arc::new(registry()),
            gateway,
            "verify-me".to_string(),
            Some(SECRET.to_string()),
        );
        (router, harness)
    }

    fn signed(body: &str) -> Request<Body> {
        Request::post(WHATSAPP_WEBHOOK_PATH)
            .header("content-type", "application/json")
            .header(
                "x-hub-signature-256",
                format!("sha256={}", sign(SECRET.as_bytes(), body.as_bytes())),
            )
            .body(Body::from(body.to_string()))
            .expect("request")
    }

    fn text_payload(phone_number_id: &str, from: &str, body: &str) -> String {
        serde_json::json!({
            "entry": [{
                "changes": [{
                    "value": {
                        "metadata": { "phone_number_id": phone_number_id },
                        "messages": [{
                            "id": "wamid.1",
                            "from": from,
                            "type": "text",
                            "text": { "body": body }
                        }]
                    }
                }]
            }]
        })
        .to_string()
    }

    async fn json_body(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
            .await
            .expect("body");
        serde_json::from_slice(&bytes).expect("json")
    }

    fn sign(secret: &[u8], body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret).expect("hmac key");
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }

    #[test]
    fn signature_matches_known_sha256_vector() {
        let body = b"The quick brown fox jumps over the lazy dog";
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-hub-signature-256",
            HeaderValue::from_static(
                "sha256=f7bc83f430538424b13298e6aa6fb143ef4d59a14946175997479dbc2d1a3cd8",
            ),
        );
        assert!(verify_whatsapp_signature(&headers, body, "key"));
        assert!(!verify_whatsapp_signature(&headers, &body[1..], "key"));
    }

    #[test]
    fn signature_verification_accepts_valid_header() {
        let body = br#"{"hello":"world"}"#;
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-hub-signature-256",
            HeaderValue::from_str(&format!("sha256={}", sign(b"secret", body)))
                .expect("signature header"),
        );
        assert!(verify_whatsapp_signature(&headers, body, "secret"));
        assert!(!verify_whatsapp_signature(&headers, body, "wrong"));
        assert!(!verify_whatsapp_signature(&HeaderMap::new(), body, "secret"));

        let mut malformed = HeaderMap::new();
        malformed.insert("x-hub-signature-256", HeaderValue::from_static("sha256=not-hex"));
        assert!(!verify_whatsapp_signature(&malformed, body, "secret"));
        let mut unprefixed = HeaderMap::new();
        unprefixed.insert(
            "x-hub-signature-256",
            HeaderValue::from_str(&sign(b"secret", body)).expect("signature header"),
        );
        assert!(!verify_whatsapp_signature(&unprefixed, body, "secret"));
    }

    #[test]
    fn converts_text_and_reaction_messages() {
        let tenant = TenantId::new("salon-1");
        let text = WhatsAppMessage {
            id: "wamid.abc".to_string(),
            from: "79123456789".to_string(),
            message_type: "text".to_string(),
            text: Some(WhatsAppText {
                body: " hello ".to_string(),
            }),
            reaction: None,
        };
        let inbound = convert_whatsapp_message(&text, &tenant, "1098765").expect("text converts");
        assert_eq!(inbound.kind, InboundMessageKind::Message);
        assert_eq!(inbound.tenant_id, tenant);
        assert_eq!(inbound.content, "hello");
        assert_eq!(inbound.message_id.as_str(), "wamid.abc");

        let reaction = WhatsAppMessage {
            message_type: "reaction".to_string(),
            text: None,
            reaction: Some(WhatsAppReaction {
                emoji: "🔥".to_string(),
            }),
            ..text.clone()
        };
        let inbound =
            convert_whatsapp_message(&reaction, &tenant, "1098765").expect("reaction converts");
        assert_eq!(inbound.kind, InboundMessageKind::Reaction);

        let image = WhatsAppMessage {
            message_type: "image".to_string(),
            ..text
        };
        assert!(convert_whatsapp_message(&image, &tenant, "1098765").is_none());
    }

    #[test]
    fn constant_time_eq_rejects_different_lengths_and_values() {
        assert!(constant_time_eq("abc", "abc"));
        assert!(!constant_time_eq("abc", "abcd"));
        assert!(!constant_time_eq("abc", "abx"));
    }

    #[tokio::test]
    async fn verification_handshake_checks_token() {
        let (router, _harness) = router();
        let ok = router
            .clone()
            .oneshot(
                Request::get(format!(
                    "{WHATSAPP_WEBHOOK_PATH}?hub.mode=subscribe&hub.verify_token=verify-me&hub.challenge=42"
                ))
                .body(Body::empty())
                .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(ok.status(), StatusCode::OK);
        let challenge = axum::body::to_bytes(ok.into_body(), 1024).await.expect("body");
        assert_eq!(&challenge[..], b"42");

        let denied = router
            .oneshot(
                Request::get(format!(
                    "{WHATSAPP_WEBHOOK_PATH}?hub.mode=subscribe&hub.verify_token=nope&hub.challenge=42"
                ))
                .body(Body::empty())
                .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(denied.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn rejects_bad_signatures_and_payloads() {
        let (router, _harness) = router();
        let mut unsigned = signed(&text_payload("1098765", "79123456789", "hi"));
        unsigned.headers_mut().insert(
            "x-hub-signature-256",
            HeaderValue::from_static("sha256=00"),
        );
        let response = router.clone().oneshot(unsigned).await.expect("response");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = router.oneshot(signed("{not json")).await.expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn routes_messages_to_the_bound_tenant() {
        let (router, harness) = router();
        let response = router
            .clone()
            .oneshot(signed(&text_payload("1098765", "79123456789", "hello")))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["accepted"], 1);
        let pending = harness
            .batcher
            .pending(&harness.key())
            .await
            .expect("pending")
            .expect("batched");
        assert_eq!(pending.fragments, 1);

        let response = router
            .oneshot(signed(&text_payload("555", "79123456789", "hello")))
            .await
            .expect("response");
        let body = json_body(response).await;
        assert_eq!(body["accepted"], 0);
        assert_eq!(body["ignored"], 1);
    }
}
