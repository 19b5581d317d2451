use std::sync::Arc;

use axum::{extract::Extension, http::StatusCode, response::IntoResponse, Json};

use crate::app::services::AppServices;
use crate::context::PrincipalContext;

pub async fn health() -> StatusCode {
    StatusCode::OK
}

/// 200 when both backing stores answer a ping, 503 otherwise.
pub async fn ready(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    let readiness = services.readiness().await;
    let status = if readiness.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(readiness)).into_response()
}

pub async fn whoami(Extension(principal): Extension<PrincipalContext>) -> impl IntoResponse {
    let session = principal.session();
    Json(serde_json::json!({
        "principal": session.principal,
        "token_id": session.token_id,
        "expires_at": session.expires_at,
    }))
}
