use std::sync::Arc;

use axum::{
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use chrono::Utc;

use crate::app::services::AppServices;
use crate::app::{dto, errors};
use crate::context::RequestOrigin;
use crate::middleware::extract_bearer;

pub fn router() -> Router {
    Router::new()
        .route("/login", post(login))
        .route("/otp", post(request_otp))
        .route("/logout", post(logout))
}

pub async fn login(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(origin): Extension<RequestOrigin>,
    Json(body): Json<dto::LoginRequest>,
) -> axum::response::Response {
    match services
        .auth
        .login(&body.identity, &body.secret, origin.as_str(), Utc::now())
        .await
    {
        Ok(issued) => (
            StatusCode::OK,
            Json(dto::SessionResponse {
                token: issued.token,
                token_id: issued.claims.jti,
                expires_at: issued.claims.exp,
            }),
        )
            .into_response(),
        Err(e) => errors::auth_flow_error_to_response(e),
    }
}

pub async fn request_otp(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(origin): Extension<RequestOrigin>,
    Json(body): Json<dto::OtpRequest>,
) -> axum::response::Response {
    match services
        .auth
        .request_otp(&body.identity, origin.as_str(), Utc::now())
        .await
    {
        // Same answer whether or not the identity exists.
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(e) => errors::auth_flow_error_to_response(e),
    }
}

/// Revoke the presented token. Sits outside the auth middleware so the
/// failure of an already-revoked token is reported by the flow itself.
pub async fn logout(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(origin): Extension<RequestOrigin>,
    headers: HeaderMap,
) -> axum::response::Response {
    let token = match extract_bearer(&headers) {
        Ok(token) => token,
        Err(failure) => {
            if let Err(e) =
                taxguard_infra::auth_flow::record_authentication_failure(&services.audit, &failure, origin.as_str())
                    .await
            {
                tracing::warn!(error = %e, "authentication failure could not be audited");
            }
            return errors::authentication_failure(&failure);
        }
    };

    match services.auth.logout(token, origin.as_str(), Utc::now()).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => errors::auth_flow_error_to_response(e),
    }
}
