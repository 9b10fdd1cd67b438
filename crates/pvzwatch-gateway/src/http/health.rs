use axum::Json;
use serde_json::{json, Value};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// GET /: service banner.
pub async fn root_handler() -> Json<Value> {
    Json(json!({
        "service": "PvzWatch",
        "version": VERSION,
        "status": "running",
    }))
}

/// GET /health: liveness probe.
pub async fn health_handler() -> Json<Value> {
    Json(json!({ "status": "healthy" }))
}
