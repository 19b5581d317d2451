use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, State},
    http::HeaderMap,
    middleware::Next,
    response::Response,
};
use chrono::Utc;
use tracing::warn;

use taxguard_audit::AuditRecorder;
use taxguard_auth::{AuthenticationFailure, Authenticator};
use taxguard_infra::auth_flow::record_authentication_failure;

use crate::app::errors;
use crate::context::{PrincipalContext, RequestOrigin};

#[derive(Clone)]
pub struct AuthState {
    pub authenticator: Authenticator,
    pub audit: AuditRecorder,
}

/// Attach the peer address as the request's [`RequestOrigin`].
pub async fn origin_middleware(mut req: axum::http::Request<axum::body::Body>, next: Next) -> Response {
    let origin = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| RequestOrigin::new(addr.ip().to_string()))
        .unwrap_or_else(RequestOrigin::unknown);

    req.extensions_mut().insert(origin);
    next.run(req).await
}

/// Reject requests without a valid, unrevoked bearer token.
///
/// Every rejection is audited as an authentication failure.
pub async fn auth_middleware(
    State(state): State<AuthState>,
    mut req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Response {
    let origin = req
        .extensions()
        .get::<RequestOrigin>()
        .cloned()
        .unwrap_or_else(RequestOrigin::unknown);

    let session = match extract_bearer(req.headers()) {
        Ok(token) => state.authenticator.session(token, Utc::now()).await,
        Err(failure) => Err(failure),
    };

    match session {
        Ok(session) => {
            req.extensions_mut().insert(PrincipalContext::new(session));
            next.run(req).await
        }
        Err(failure) => {
            if let Err(e) = record_authentication_failure(&state.audit, &failure, origin.as_str()).await {
                warn!(error = %e, "authentication failure could not be audited");
            }
            errors::authentication_failure(&failure)
        }
    }
}

pub fn extract_bearer(headers: &HeaderMap) -> Result<&str, AuthenticationFailure> {
    let header = headers
        .get(axum::http::header::AUTHORIZATION)
        .ok_or(AuthenticationFailure::MissingToken)?;

    let header = header.to_str().map_err(|_| AuthenticationFailure::MissingToken)?;

    let header = header
        .strip_prefix("Bearer ")
        .ok_or(AuthenticationFailure::MissingToken)?;

    let token = header.trim();
    if token.is_empty() {
        return Err(AuthenticationFailure::MissingToken);
    }

    Ok(token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn bearer_extraction() {
        let mut headers = HeaderMap::new();
        assert_eq!(extract_bearer(&headers), Err(AuthenticationFailure::MissingToken));

        headers.insert(axum::http::header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(extract_bearer(&headers), Err(AuthenticationFailure::MissingToken));

        headers.insert(axum::http::header::AUTHORIZATION, HeaderValue::from_static("Bearer   "));
        assert_eq!(extract_bearer(&headers), Err(AuthenticationFailure::MissingToken));

        headers.insert(axum::http::header::AUTHORIZATION, HeaderValue::from_static("Bearer abc.def"));
        assert_eq!(extract_bearer(&headers), Ok("abc.def"));
    }
}
