use std::sync::Arc;

use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use crate::app::AppState;
use crate::error::ApiError;

/// GET /admin/stats: database metrics.
pub async fn stats(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    let stats = state.store.db_stats()?;
    Ok(Json(json!({ "status": "ok", "stats": stats })))
}

#[derive(Debug, Deserialize)]
pub struct CleanupQuery {
    pub days: Option<u32>,
}

/// POST /admin/cleanup?days: manual TTL sweep, 1 ≤ days ≤ 365.
pub async fn cleanup(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CleanupQuery>,
) -> Result<Json<Value>, ApiError> {
    let days = query.days.unwrap_or(30);
    if !(1..=365).contains(&days) {
        return Err(ApiError::Validation(
            "days must be between 1 and 365".into(),
        ));
    }

    let deleted = state.store.cleanup_old_items(days)?;
    info!(days, deleted, "manual cleanup performed");
    Ok(Json(json!({
        "status": "ok",
        "deleted_count": deleted,
        "message": format!("Удалено записей старше {days} дней: {deleted}"),
    })))
}
