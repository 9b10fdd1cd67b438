use std::sync::Arc;

use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use pvzwatch_blacklist::SearchQuery;
use pvzwatch_core::types::BlacklistChat;

use crate::app::AppState;
use crate::error::ApiError;

#[derive(Debug, Deserialize)]
pub struct CheckQuery {
    pub username: Option<String>,
    pub fio: Option<String>,
    pub days: Option<i64>,
    pub blacklist_session_path: Option<String>,
}

/// POST /blacklist/check?username: ad-hoc blacklist probe.
pub async fn check(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CheckQuery>,
) -> Result<Json<Value>, ApiError> {
    let mut search = SearchQuery {
        username: query.username,
        fio: query.fio,
        session_path: query.blacklist_session_path,
        ..Default::default()
    };
    if let Some(days) = query.days {
        search.days = days;
    }
    let outcome = state.blacklist.search(search).await?;
    Ok(Json(serde_json::to_value(outcome).map_err(|e| {
        ApiError::Internal(e.to_string())
    })?))
}

/// GET /blacklist/chats: full registry listing.
pub async fn chats(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    let chats = state.store.list_blacklist_chats(false)?;
    let total = chats.len();
    let active = chats.iter().filter(|c| c.is_active).count();
    Ok(Json(json!({
        "chats": chats,
        "total": total,
        "active": active,
    })))
}

#[derive(Debug, Deserialize)]
pub struct SyncEntry {
    pub chat_username: String,
    pub chat_title: Option<String>,
    pub topic_id: Option<i64>,
    pub topic_name: Option<String>,
}

/// POST /blacklist/chats/sync: full registry replacement.
pub async fn sync(
    State(state): State<Arc<AppState>>,
    Json(entries): Json<Vec<SyncEntry>>,
) -> Result<Json<Value>, ApiError> {
    let chats: Vec<BlacklistChat> = entries
        .into_iter()
        .map(|e| BlacklistChat {
            chat_username: e.chat_username,
            chat_title: e.chat_title,
            topic_id: e.topic_id,
            topic_name: e.topic_name,
            is_active: true,
            added_at: None,
        })
        .collect();
    let synced = state.store.sync_blacklist_chats(&chats)?;
    Ok(Json(json!({ "status": "ok", "synced": synced })))
}

#[derive(Debug, Deserialize)]
pub struct AddQuery {
    pub chat_username: String,
    pub chat_title: Option<String>,
    pub topic_id: Option<i64>,
    pub topic_name: Option<String>,
}

/// POST /blacklist/chats/add: add or re-activate a registry entry.
pub async fn add(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AddQuery>,
) -> Result<Json<Value>, ApiError> {
    state.store.add_blacklist_chat(
        &query.chat_username,
        query.chat_title.as_deref(),
        query.topic_id,
        query.topic_name.as_deref(),
    )?;
    Ok(Json(json!({
        "status": "ok",
        "message": format!("Чат {} добавлен", query.chat_username),
    })))
}

#[derive(Debug, Deserialize)]
pub struct RemoveQuery {
    pub chat_username: String,
    pub topic_id: Option<i64>,
}

/// POST /blacklist/chats/remove: soft delete.
pub async fn remove(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RemoveQuery>,
) -> Result<Json<Value>, ApiError> {
    let removed = state
        .store
        .remove_blacklist_chat(&query.chat_username, query.topic_id)?;
    if !removed {
        return Err(ApiError::NotFound(format!(
            "Чат {} не найден",
            query.chat_username
        )));
    }
    Ok(Json(json!({
        "status": "ok",
        "message": format!("Чат {} деактивирован", query.chat_username),
    })))
}

#[derive(Debug, Deserialize)]
pub struct TopicsQuery {
    pub chat_username: String,
    pub blacklist_session_path: Option<String>,
}

/// GET /blacklist/chats/topics: discover a chat's forum topics over the
/// blacklist session.
pub async fn topics(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TopicsQuery>,
) -> Result<Json<Value>, ApiError> {
    let (chat, topics) = state
        .blacklist
        .discover_topics(&query.chat_username, query.blacklist_session_path)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    let mut listed: Vec<Value> = topics
        .iter()
        .map(|(id, name)| json!({ "id": id, "name": name }))
        .collect();
    listed.sort_by_key(|t| t["id"].as_i64());

    Ok(Json(json!({
        "is_forum": !topics.is_empty(),
        "chat_title": chat.title,
        "topics": listed,
    })))
}
