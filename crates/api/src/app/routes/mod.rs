use axum::{
    routing::{get, post},
    Router,
};

pub mod admin;
pub mod generations;
pub mod system;
pub mod webhooks;

/// Router for the public endpoints (submission, queue status, render callbacks).
pub fn router() -> Router {
    Router::new()
        .route("/generations", post(generations::submit))
        .route("/users/:user_id/queue", get(generations::user_queue))
        .route("/webhooks/render", post(webhooks::render))
}
