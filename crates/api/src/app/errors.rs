use axum::http::{HeaderValue, StatusCode, header};
use axum::response::IntoResponse;
use serde_json::json;

use taxguard_auth::AuthenticationFailure;
use taxguard_infra::{AuthFlowError, DispatchError, RateLimited};
use taxguard_lifecycle::{LifecycleError, TransitionError};

pub fn dispatch_error_to_response(err: DispatchError) -> axum::response::Response {
    match err {
        DispatchError::NotFound => json_error(StatusCode::NOT_FOUND, "not_found", "not found"),
        DispatchError::Forbidden(msg) => json_error(StatusCode::FORBIDDEN, "forbidden", msg),
        DispatchError::Rejected(e) => lifecycle_error_to_response(e),
        DispatchError::Conflict(msg) => json_error(StatusCode::CONFLICT, "conflict", msg),
        DispatchError::Unavailable(_) => json_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "unavailable",
            "datastore unavailable",
        ),
        DispatchError::Audit(_) => json_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "audit_unavailable",
            "the change was applied but could not be recorded",
        ),
    }
}

fn lifecycle_error_to_response(err: LifecycleError) -> axum::response::Response {
    let field = err.field();
    let message = err.to_string();
    match &err {
        LifecycleError::Transition(TransitionError::NoSuchEdge { .. }) => {
            json_error_with_field(StatusCode::CONFLICT, "invalid_transition", message, field)
        }
        LifecycleError::Transition(TransitionError::WrongActor { .. }) => {
            json_error_with_field(StatusCode::FORBIDDEN, "wrong_actor", message, field)
        }
        LifecycleError::Validation(_) => {
            json_error_with_field(StatusCode::UNPROCESSABLE_ENTITY, "validation_failed", message, field)
        }
        LifecycleError::ContentLocked { .. } | LifecycleError::Archived { .. } | LifecycleError::AlreadyInStatus { .. } => {
            json_error_with_field(StatusCode::CONFLICT, err.reason(), message, field)
        }
        LifecycleError::OverrideReasonRequired | LifecycleError::InvalidInput { .. } => {
            json_error_with_field(StatusCode::UNPROCESSABLE_ENTITY, err.reason(), message, field)
        }
    }
}

pub fn auth_flow_error_to_response(err: AuthFlowError) -> axum::response::Response {
    match err {
        AuthFlowError::RateLimited(limited) => rate_limited(&limited),
        AuthFlowError::InvalidCredentials => {
            json_error(StatusCode::UNAUTHORIZED, "invalid_credentials", "invalid credentials")
        }
        AuthFlowError::Unauthenticated(failure) => authentication_failure(&failure),
        AuthFlowError::Unavailable(_) => json_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "unavailable",
            "authentication backend unavailable",
        ),
        AuthFlowError::Audit(_) => json_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "audit_unavailable",
            "the request could not be recorded",
        ),
    }
}

/// 401 carrying only a stable reason code.
pub fn authentication_failure(failure: &AuthenticationFailure) -> axum::response::Response {
    json_error(StatusCode::UNAUTHORIZED, "unauthenticated", failure.reason())
}

pub fn rate_limited(limited: &RateLimited) -> axum::response::Response {
    let mut response = json_error(StatusCode::TOO_MANY_REQUESTS, "rate_limited", limited.to_string());
    if let Ok(value) = HeaderValue::from_str(&limited.retry_after_secs().to_string()) {
        response.headers_mut().insert(header::RETRY_AFTER, value);
    }
    response
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

pub fn json_error_with_field(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
    field: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
            "field": field.into(),
        })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use taxguard_core::{ActorKind, EntityKind};
    use taxguard_infra::rate_limit::{ActionClass, ThrottleCause};
    use taxguard_lifecycle::ValidationFailure;

    #[test]
    fn transition_rejections_keep_their_distinction() {
        let no_edge = DispatchError::Rejected(LifecycleError::Transition(TransitionError::NoSuchEdge {
            entity: EntityKind::Engagement,
            from: "created",
            to: "filed",
        }));
        assert_eq!(dispatch_error_to_response(no_edge).status(), StatusCode::CONFLICT);

        let wrong_actor = DispatchError::Rejected(LifecycleError::Transition(TransitionError::WrongActor {
            entity: EntityKind::Engagement,
            from: "created",
            to: "documents_pending",
            actor: ActorKind::Staff,
        }));
        assert_eq!(dispatch_error_to_response(wrong_actor).status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn validation_failures_are_unprocessable() {
        let err = DispatchError::Rejected(LifecycleError::Validation(ValidationFailure {
            field: "foreignProperties".to_string(),
            flag: "hasForeignProperty".to_string(),
            flag_value: true,
            missing: vec!["foreignProperties".to_string()],
        }));
        assert_eq!(dispatch_error_to_response(err).status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[test]
    fn throttling_sets_retry_after() {
        let response = rate_limited(&RateLimited {
            class: ActionClass::OtpRequest,
            cause: ThrottleCause::Quota(taxguard_infra::rate_limit::Dimension::Identity),
            retry_after: Duration::from_millis(90_500),
        });
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "91");
    }

    #[test]
    fn unavailability_is_503() {
        let err = DispatchError::Unavailable("pool timed out".to_string());
        assert_eq!(dispatch_error_to_response(err).status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
