use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;

use taxguard_core::{EngagementId, TaxFormId};
use taxguard_lifecycle::{FormData, TaxFormStatus};

use crate::app::services::AppServices;
use crate::app::{dto, errors};
use crate::context::PrincipalContext;

pub fn router() -> Router {
    Router::new()
        .route("/:id", get(get_tax_form))
        .route("/:id/submit", post(submit_tax_form))
        .route("/:id/transitions", post(transition_tax_form))
}

/// `PUT /engagements/:id/tax-form`: create the draft or replace its content.
pub async fn save_tax_form(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    Path(engagement_id): Path<String>,
    Json(body): Json<FormData>,
) -> axum::response::Response {
    let engagement_id: EngagementId = match dto::parse_id(&engagement_id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services
        .dispatcher
        .save_tax_form(principal.principal(), engagement_id, body, Utc::now())
        .await
    {
        Ok(form) => (StatusCode::OK, Json(form)).into_response(),
        Err(e) => errors::dispatch_error_to_response(e),
    }
}

pub async fn get_tax_form(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id: TaxFormId = match dto::parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.dispatcher.tax_form(principal.principal(), id).await {
        Ok(form) => (StatusCode::OK, Json(form)).into_response(),
        Err(e) => errors::dispatch_error_to_response(e),
    }
}

pub async fn submit_tax_form(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id: TaxFormId = match dto::parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services
        .dispatcher
        .submit_tax_form(principal.principal(), id, Utc::now())
        .await
    {
        Ok(form) => (StatusCode::OK, Json(form)).into_response(),
        Err(e) => errors::dispatch_error_to_response(e),
    }
}

pub async fn transition_tax_form(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
    Json(body): Json<dto::TransitionRequest>,
) -> axum::response::Response {
    let id: TaxFormId = match dto::parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let to: TaxFormStatus = match dto::parse_status(&body.to) {
        Ok(to) => to,
        Err(resp) => return resp,
    };

    match services
        .dispatcher
        .transition_tax_form(principal.principal(), id, to, Utc::now())
        .await
    {
        Ok(form) => (StatusCode::OK, Json(form)).into_response(),
        Err(e) => errors::dispatch_error_to_response(e),
    }
}
