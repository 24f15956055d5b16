use axum::Json;
use serde_json::{Value, json};

/// Liveness of the receiver itself, not of the deployed app.
pub async fn health() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "deploy-webhook"
    }))
}
