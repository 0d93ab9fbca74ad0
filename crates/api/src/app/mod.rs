//! HTTP API application wiring (Axum router + service wiring).
//!
//! - `services.rs`: builds the generation service from config and adapters
//! - `routes/`: HTTP routes + handlers (one file per surface)
//! - `dto.rs`: request/response bodies that are not domain types
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{routing::get, Extension, Router};
use tower::ServiceBuilder;

use crate::middleware;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

/// Build the full HTTP router (public entrypoint used by `main.rs`).
pub fn build_app(services: Arc<services::AppServices>, admin_token: String) -> Router {
    let admin_state = middleware::AdminAuth::new(admin_token);

    // Operator routes: require the admin bearer token.
    let admin = routes::admin::router().layer(axum::middleware::from_fn_with_state(
        admin_state,
        middleware::admin_middleware,
    ));

    Router::new()
        .route("/health", get(routes::system::health))
        .merge(routes::router())
        .nest("/admin", admin)
        .layer(ServiceBuilder::new().layer(Extension(services)))
}
