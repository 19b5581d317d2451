use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use chrono::Utc;

use taxguard_core::EngagementId;
use taxguard_infra::AssignmentChange;
use taxguard_lifecycle::EngagementStatus;

use crate::app::services::AppServices;
use crate::app::{dto, errors};
use crate::context::PrincipalContext;

pub fn router() -> Router {
    Router::new()
        .route("/", post(create_engagement))
        .route("/:id", get(get_engagement))
        .route("/:id/transitions", post(transition_engagement))
        .route("/:id/override", post(override_status))
        .route("/:id/assignments", put(assign_staff))
        .route("/:id/documents", post(super::documents::request_document))
        .route("/:id/tax-form", put(super::tax_forms::save_tax_form))
}

pub async fn create_engagement(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    Json(body): Json<dto::CreateEngagementRequest>,
) -> axum::response::Response {
    match services
        .dispatcher
        .create_engagement(principal.principal(), body.filing_year, Utc::now())
        .await
    {
        Ok(engagement) => (StatusCode::CREATED, Json(engagement)).into_response(),
        Err(e) => errors::dispatch_error_to_response(e),
    }
}

pub async fn get_engagement(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id: EngagementId = match dto::parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.dispatcher.engagement(principal.principal(), id).await {
        Ok(view) => (StatusCode::OK, Json(view)).into_response(),
        Err(e) => errors::dispatch_error_to_response(e),
    }
}

pub async fn transition_engagement(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
    Json(body): Json<dto::TransitionRequest>,
) -> axum::response::Response {
    let id: EngagementId = match dto::parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let to: EngagementStatus = match dto::parse_status(&body.to) {
        Ok(to) => to,
        Err(resp) => return resp,
    };

    match services
        .dispatcher
        .transition_engagement(principal.principal(), id, to, Utc::now())
        .await
    {
        Ok(engagement) => (StatusCode::OK, Json(engagement)).into_response(),
        Err(e) => errors::dispatch_error_to_response(e),
    }
}

/// Super-admin status override; bypasses the table but never the trail.
pub async fn override_status(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
    Json(body): Json<dto::OverrideRequest>,
) -> axum::response::Response {
    let id: EngagementId = match dto::parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let to: EngagementStatus = match dto::parse_status(&body.to) {
        Ok(to) => to,
        Err(resp) => return resp,
    };

    match services
        .dispatcher
        .override_engagement_status(principal.principal(), id, to, &body.reason, Utc::now())
        .await
    {
        Ok(engagement) => (StatusCode::OK, Json(engagement)).into_response(),
        Err(e) => errors::dispatch_error_to_response(e),
    }
}

pub async fn assign_staff(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
    Json(body): Json<dto::AssignmentRequest>,
) -> axum::response::Response {
    let id: EngagementId = match dto::parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let change = AssignmentChange {
        add: body.add,
        remove: body.remove,
    };

    match services
        .dispatcher
        .assign_staff(principal.principal(), id, change, Utc::now())
        .await
    {
        Ok(engagement) => (StatusCode::OK, Json(engagement)).into_response(),
        Err(e) => errors::dispatch_error_to_response(e),
    }
}
