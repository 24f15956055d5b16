//! HTTP surface of the receiver
//!
//! Only two routes exist; every other path or method answers 404 with no
//! body.

pub mod health;
pub mod webhook;

use axum::{Router, http::StatusCode, routing};

use crate::SharedState;

pub use health::health;
pub use webhook::{WebhookResponse, handle_webhook};

pub const WEBHOOK_PATH: &str = "/webhook";
pub const HEALTH_PATH: &str = "/webhook/health";

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route(
            WEBHOOK_PATH,
            routing::post(handle_webhook).fallback(not_found),
        )
        .route(HEALTH_PATH, routing::get(health).fallback(not_found))
        .fallback(not_found)
        .with_state(state)
}

async fn not_found() -> StatusCode {
    StatusCode::NOT_FOUND
}
