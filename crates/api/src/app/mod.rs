//! HTTP application wiring (Axum router + service wiring).
//!
//! - `services.rs`: store selection, rate limiter, authenticator, dispatcher
//! - `routes/`: HTTP routes + handlers (one file per resource)
//! - `dto.rs`: request/response DTOs and path/status parsing
//! - `errors.rs`: status mapping and the `{"error", "message"}` body

use std::sync::Arc;

use axum::{Extension, Router, routing::get};
use tower::ServiceBuilder;

use crate::middleware;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

use services::AppServices;

/// Build the full HTTP router (public entrypoint used by `main.rs` and tests).
///
/// Serve it with `into_make_service_with_connect_info::<SocketAddr>()` so the
/// origin dimension sees the peer address.
pub fn build_app(services: Arc<AppServices>) -> Router {
    let auth_state = services.auth_state();

    // Protected routes: require a valid, unrevoked session.
    let protected = routes::router().layer(axum::middleware::from_fn_with_state(
        auth_state,
        middleware::auth_middleware,
    ));

    Router::new()
        .route("/health", get(routes::system::health))
        .route("/ready", get(routes::system::ready))
        .nest("/auth", routes::auth::router())
        .merge(protected)
        .layer(
            ServiceBuilder::new()
                .layer(Extension(services))
                .layer(axum::middleware::from_fn(middleware::origin_middleware)),
        )
}
