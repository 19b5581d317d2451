use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;

use taxguard_core::{DocumentId, EngagementId};
use taxguard_lifecycle::DocumentStatus;

use crate::app::services::AppServices;
use crate::app::{dto, errors};
use crate::context::PrincipalContext;

pub fn router() -> Router {
    Router::new()
        .route("/:id", get(get_document))
        .route("/:id/upload", post(upload_document))
        .route("/:id/transitions", post(transition_document))
}

/// `POST /engagements/:id/documents`
pub async fn request_document(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    Path(engagement_id): Path<String>,
    Json(body): Json<dto::RequestDocumentRequest>,
) -> axum::response::Response {
    let engagement_id: EngagementId = match dto::parse_id(&engagement_id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services
        .dispatcher
        .request_document(principal.principal(), engagement_id, &body.label, Utc::now())
        .await
    {
        Ok(document) => (StatusCode::CREATED, Json(document)).into_response(),
        Err(e) => errors::dispatch_error_to_response(e),
    }
}

pub async fn get_document(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id: DocumentId = match dto::parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.dispatcher.document(principal.principal(), id).await {
        Ok(document) => (StatusCode::OK, Json(document)).into_response(),
        Err(e) => errors::dispatch_error_to_response(e),
    }
}

/// Upload (or re-upload) content. A re-upload answers with the replacement row.
pub async fn upload_document(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
    Json(body): Json<dto::UploadRequest>,
) -> axum::response::Response {
    let id: DocumentId = match dto::parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services
        .dispatcher
        .upload_document(principal.principal(), id, &body.content_digest, Utc::now())
        .await
    {
        Ok(document) => (StatusCode::OK, Json(document)).into_response(),
        Err(e) => errors::dispatch_error_to_response(e),
    }
}

pub async fn transition_document(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
    Json(body): Json<dto::TransitionRequest>,
) -> axum::response::Response {
    let id: DocumentId = match dto::parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let to: DocumentStatus = match dto::parse_status(&body.to) {
        Ok(to) => to,
        Err(resp) => return resp,
    };

    match services
        .dispatcher
        .transition_document(principal.principal(), id, to, Utc::now())
        .await
    {
        Ok(document) => (StatusCode::OK, Json(document)).into_response(),
        Err(e) => errors::dispatch_error_to_response(e),
    }
}
