use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, info};
use uuid::Uuid;

use pvzwatch_blacklist::SearchQuery;
use pvzwatch_core::types::{Mode, Task, TaskFilters, TaskStatus};
use pvzwatch_pipeline::{IngestionPipeline, PipelineConfig};
use pvzwatch_telegram::{BotNotifier, UserClient};

use crate::app::AppState;
use crate::error::ApiError;

#[derive(Debug, Deserialize)]
pub struct StartRequest {
    pub user_id: i64,
    pub mode: Mode,
    pub chats: Vec<String>,
    pub filters: TaskFilters,
    pub api_id: Option<i32>,
    pub api_hash: Option<String>,
    pub notification_chat_id: i64,
    pub parse_history_days: Option<u32>,
    pub session_path: Option<String>,
    pub blacklist_session_path: Option<String>,
}

/// POST /workers/start: persist the task, register it, spawn its pipeline.
pub async fn start(
    State(state): State<Arc<AppState>>,
    Json(req): Json<StartRequest>,
) -> Result<Json<Value>, ApiError> {
    if req.chats.is_empty() {
        return Err(ApiError::Validation("chats must not be empty".into()));
    }

    let task_id = Uuid::new_v4();
    let session_path = req
        .session_path
        .clone()
        .unwrap_or_else(|| state.config.session_path.clone());
    let blacklist_session_path = req
        .blacklist_session_path
        .clone()
        .unwrap_or_else(|| state.config.blacklist_session_path.clone());
    let parse_history_days = req
        .parse_history_days
        .unwrap_or(state.config.parse_history_days);

    let task = Task {
        task_id,
        user_id: req.user_id,
        mode: req.mode,
        chats: req.chats.clone(),
        filters: req.filters.clone(),
        notification_chat_id: req.notification_chat_id,
        status: TaskStatus::Pending,
        created_at: Utc::now(),
        stopped_at: None,
        session_path: Some(session_path.clone()),
        blacklist_session_path: Some(blacklist_session_path),
    };
    state.store.create_task(&task).map_err(|e| {
        error!(error = %e, "task create failed");
        ApiError::Internal(e.to_string())
    })?;

    let cancel = state.supervisor.create(task_id, req.mode);
    let client = Arc::new(UserClient::new(
        req.api_id.unwrap_or(state.config.api_id),
        req.api_hash
            .clone()
            .unwrap_or_else(|| state.config.api_hash.clone()),
        session_path,
    ));
    let notifier = Arc::new(BotNotifier::new(
        &state.config.bot_token,
        req.notification_chat_id,
    ));

    let pipeline = IngestionPipeline::new(
        PipelineConfig {
            task_id,
            mode: req.mode,
            chats: req.chats,
            filters: req.filters,
            parse_history_days,
        },
        state.store.clone(),
        state.geo.clone(),
        notifier,
        state.supervisor.clone(),
        client,
        cancel,
    );
    let handle = tokio::spawn(pipeline.run());
    state.supervisor.attach_runtime(task_id, handle);

    info!(%task_id, user_id = req.user_id, "monitoring task started");
    Ok(Json(json!({
        "task_id": task_id,
        "status": "pending",
        "message": "Мониторинг запущен",
        "started_at": Utc::now(),
    })))
}

/// GET /workers/status/{task_id}: live registry snapshot.
pub async fn status(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    let snapshot = state
        .supervisor
        .get(task_id)
        .ok_or_else(|| ApiError::NotFound("Задача не найдена".into()))?;
    Ok(Json(json!({
        "task_id": task_id,
        "status": snapshot.status,
        "mode": snapshot.mode,
        "stats": snapshot.stats,
    })))
}

/// POST /workers/stop/{task_id}.
pub async fn stop(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    if state.supervisor.get(task_id).is_none() {
        return Err(ApiError::NotFound("Задача не найдена".into()));
    }
    state.supervisor.stop(task_id);
    state
        .store
        .update_task_status(task_id, TaskStatus::Stopped, Some(Utc::now()))?;
    Ok(Json(json!({
        "task_id": task_id,
        "status": "stopped",
        "message": "Мониторинг остановлен",
    })))
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub limit: Option<u32>,
}

/// GET /workers/list/{task_id}?limit: recent found items, newest first.
pub async fn list(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<Uuid>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Value>, ApiError> {
    let task = state
        .store
        .get_task(task_id)?
        .ok_or_else(|| ApiError::NotFound("Задача не найдена".into()))?;

    let items = state
        .store
        .list_found_items(task_id, query.limit.unwrap_or(50))?;
    let total = state.store.count_items(task_id)?;

    let items: Vec<Value> = items
        .iter()
        .map(|item| {
            json!({
                "id": item.id,
                "author_username": item.author_username,
                "author_full_name": item.author_full_name,
                "date": item.work_date,
                "price": item.price,
                "shk": item.shk,
                "location": item.location,
                "topic_name": item.topic_name,
                "chat_name": item.chat_name,
                "message_link": item.message_link,
                "found_at": item.found_at,
            })
        })
        .collect();

    Ok(Json(json!({
        "task_id": task_id,
        "mode": task.mode,
        "total": total,
        "items": items,
    })))
}

#[derive(Debug, Deserialize)]
pub struct CheckBlacklistQuery {
    #[allow(dead_code)]
    pub task_id: Option<Uuid>,
}

/// POST /workers/{item_id}/check-blacklist?task_id: probe the blacklist for
/// a previously found item's author.
pub async fn check_blacklist(
    State(state): State<Arc<AppState>>,
    Path(item_id): Path<i64>,
    Query(_query): Query<CheckBlacklistQuery>,
) -> Result<Json<Value>, ApiError> {
    let item = state
        .store
        .get_found_item(item_id)?
        .ok_or_else(|| ApiError::NotFound("Объявление не найдено".into()))?;

    if item.author_username.is_none() && item.author_full_name.is_none() {
        return Ok(Json(json!({
            "item_id": item_id,
            "check_status": "error",
            "result": {
                "found": false,
                "error": "Username и имя автора неизвестны",
            },
        })));
    }

    let session_path = state.store.blacklist_session_for_item(item_id)?;
    let query = SearchQuery {
        username: item.author_username.clone(),
        fio: if item.author_username.is_none() {
            item.author_full_name.clone()
        } else {
            None
        },
        session_path,
        ..Default::default()
    };

    let result = state.blacklist.search(query).await?;
    Ok(Json(json!({
        "item_id": item_id,
        "check_status": "completed",
        "result": result,
    })))
}
