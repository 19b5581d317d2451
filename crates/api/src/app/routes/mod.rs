use axum::{Router, routing::get};

pub mod auth;
pub mod documents;
pub mod engagements;
pub mod system;
pub mod tax_forms;

/// Router for all authenticated endpoints.
pub fn router() -> Router {
    Router::new()
        .route("/whoami", get(system::whoami))
        .nest("/engagements", engagements::router())
        .nest("/documents", documents::router())
        .nest("/tax-forms", tax_forms::router())
}
