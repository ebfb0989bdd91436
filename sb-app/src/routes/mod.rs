pub mod conversations;
pub mod health;
pub mod ingress;

use axum::Router;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

pub fn router() -> Router {
    Router::new()
        .merge(health::router())
        .merge(ingress::router())
        .merge(conversations::router())
}

pub(crate) fn error(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        axum::Json(serde_json::json!({
            "status": "error",
            "error": message.into(),
        })),
    )
        .into_response()
}
