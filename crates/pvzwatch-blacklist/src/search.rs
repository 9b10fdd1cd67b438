use chrono::{Duration, Utc};
use futures_util::StreamExt;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use tracing::{debug, info, warn};

use pvzwatch_core::types::BlacklistChat;
use pvzwatch_store::Store;
use pvzwatch_telegram::{IncomingMessage, MtClient, UserClient};

use crate::error::{Result, SearchError};

/// The stored hit keeps at most this many characters of the source message.
const HIT_TEXT_LIMIT: usize = 500;

static RE_ID: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)ID[:\s]*(\d+)").unwrap());
static RE_NICK: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)Ник[:\s]*(@\w+)").unwrap());
static RE_FIO: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)ФИО[:\s]*([А-ЯЁа-яё\s]+?)(?:\n|$)").unwrap());
static RE_PHONE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)Тел[:\s]*([+\d\s*-]+)").unwrap());

/// What to look for. At least one of `username` / `fio` must be set.
#[derive(Debug, Clone)]
pub struct SearchQuery {
    pub username: Option<String>,
    pub fio: Option<String>,
    pub days: i64,
    pub session_path: Option<String>,
}

impl Default for SearchQuery {
    fn default() -> Self {
        Self {
            username: None,
            fio: None,
            days: 365,
            session_path: None,
        }
    }
}

/// Structured fields pulled out of the matched blacklist report.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExtractedInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub found: bool,
    pub match_type: String,
    pub match_value: String,
    pub chat: String,
    pub message_link: String,
    pub message_id: i64,
    pub message_date: String,
    pub extracted_info: ExtractedInfo,
    pub message_text: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchMiss {
    pub found: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    pub messages_checked: u64,
    pub chats_checked: Vec<String>,
    pub steps_done: Vec<String>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum SearchOutcome {
    Found(Box<SearchHit>),
    NotFound(SearchMiss),
}

/// One search phase; tried in order, first hit wins.
enum Phase {
    Username(String),
    UserId(i64),
    Fio(Vec<String>),
}

impl Phase {
    fn name(&self) -> &'static str {
        match self {
            Phase::Username(_) => "username",
            Phase::UserId(_) => "user_id",
            Phase::Fio(_) => "fio",
        }
    }

    /// Returns the matched value when the text matches this phase.
    fn matches(&self, text: &str) -> Option<String> {
        match self {
            Phase::Username(needle) => {
                let lower = text.to_lowercase();
                lower.contains(&needle.to_lowercase()).then(|| needle.clone())
            }
            Phase::UserId(id) => {
                for caps in RE_ID.captures_iter(text) {
                    if caps[1].parse::<i64>().ok() == Some(*id) {
                        return Some(id.to_string());
                    }
                }
                None
            }
            Phase::Fio(tokens) => {
                let lower = text.to_lowercase();
                tokens
                    .iter()
                    .all(|t| lower.contains(t.as_str()))
                    .then(|| tokens.join(" "))
            }
        }
    }
}

/// On-demand searcher over the registered blacklist corpus.
///
/// The session is opened per call and closed before returning; the async
/// mutex keeps two searches from ever touching the same session file
/// concurrently.
pub struct BlacklistSearch {
    api_id: i32,
    api_hash: String,
    default_session: String,
    store: Store,
    guard: tokio::sync::Mutex<()>,
}

impl BlacklistSearch {
    pub fn new(api_id: i32, api_hash: impl Into<String>, default_session: impl Into<String>, store: Store) -> Self {
        Self {
            api_id,
            api_hash: api_hash.into(),
            default_session: default_session.into(),
            store,
            guard: tokio::sync::Mutex::new(()),
        }
    }

    pub async fn search(&self, query: SearchQuery) -> Result<SearchOutcome> {
        if query.username.is_none() && query.fio.is_none() {
            return Err(SearchError::EmptyQuery);
        }

        let chats = self.store.list_blacklist_chats(true)?;
        if chats.is_empty() {
            return Err(SearchError::NoChats);
        }

        let _guard = self.guard.lock().await;
        let session = query
            .session_path
            .clone()
            .unwrap_or_else(|| self.default_session.clone());
        info!(
            username = query.username.as_deref().unwrap_or("-"),
            fio = query.fio.as_deref().unwrap_or("-"),
            chats = chats.len(),
            session = %session,
            "blacklist search started"
        );

        let client = UserClient::new(self.api_id, self.api_hash.clone(), session);
        client.connect().await?;
        let outcome = self.run_phases(&client, &query, &chats).await;
        client.disconnect().await;
        outcome
    }

    /// Resolve a chat and enumerate its forum topics on the blacklist
    /// session. Shares the session guard with `search`, so the two never
    /// open the same file concurrently.
    pub async fn discover_topics(
        &self,
        chat_username: &str,
        session_path: Option<String>,
    ) -> Result<(pvzwatch_telegram::ChatRef, std::collections::HashMap<i64, String>)> {
        let _guard = self.guard.lock().await;
        let session = session_path.unwrap_or_else(|| self.default_session.clone());
        let client = UserClient::new(self.api_id, self.api_hash.clone(), session);
        client.connect().await?;
        let result = async {
            let chat = client.get_chat(chat_username).await?;
            let topics = client.forum_topics(chat_username).await?;
            Ok((chat, topics))
        }
        .await;
        client.disconnect().await;
        result
    }

    /// The three sequential phases over the active registry entries.
    async fn run_phases(
        &self,
        client: &dyn MtClient,
        query: &SearchQuery,
        chats: &[BlacklistChat],
    ) -> Result<SearchOutcome> {
        let since = Utc::now() - Duration::days(query.days);
        let username = query.username.as_deref().map(normalize_username);

        let mut phases: Vec<Phase> = Vec::new();
        if let Some(u) = &username {
            phases.push(Phase::Username(u.clone()));
            // The id phase only exists when the session can resolve the name.
            match client.get_chat(u.trim_start_matches('@')).await {
                Ok(peer) if !peer.is_channel => phases.push(Phase::UserId(peer.id)),
                Ok(_) => debug!(username = %u, "resolved to a chat, id phase skipped"),
                Err(e) => debug!(username = %u, error = %e, "username did not resolve"),
            }
        }
        if let Some(fio) = &query.fio {
            let tokens: Vec<String> = fio
                .split_whitespace()
                .filter(|t| t.chars().count() >= 2)
                .map(|t| t.to_lowercase())
                .collect();
            if !tokens.is_empty() {
                phases.push(Phase::Fio(tokens));
            }
        }

        let mut messages_checked: u64 = 0;
        let mut chats_checked: Vec<String> = Vec::new();
        let mut steps_done: Vec<String> = Vec::new();

        for phase in &phases {
            steps_done.push(phase.name().to_string());
            for entry in chats {
                let (handle, topic_id) = normalize_entry(entry);
                if !chats_checked.contains(&handle) {
                    chats_checked.push(handle.clone());
                }

                let hit = self
                    .scan_entry(client, &handle, topic_id, since, phase, &mut messages_checked)
                    .await;
                if let Some(message) = hit {
                    info!(
                        phase = phase.name(),
                        chat = %handle,
                        message_id = message.id,
                        "blacklist hit"
                    );
                    let value = phase.matches(&message.text).unwrap_or_default();
                    return Ok(SearchOutcome::Found(Box::new(build_hit(
                        phase.name(),
                        value,
                        &message,
                        &handle,
                        topic_id,
                    ))));
                }
            }
        }

        info!(
            messages_checked,
            chats = chats_checked.len(),
            "blacklist search found nothing"
        );
        Ok(SearchOutcome::NotFound(SearchMiss {
            found: false,
            username,
            messages_checked,
            chats_checked,
            steps_done,
            message: "В черном списке не найден".to_string(),
        }))
    }

    /// Scan one registry entry (whole chat or a single topic) within the
    /// time bound. Stream errors skip the entry rather than abort the search.
    async fn scan_entry(
        &self,
        client: &dyn MtClient,
        handle: &str,
        topic_id: Option<i64>,
        since: chrono::DateTime<Utc>,
        phase: &Phase,
        messages_checked: &mut u64,
    ) -> Option<IncomingMessage> {
        let mut stream = match topic_id {
            Some(topic) => client.topic_history(handle.to_string(), topic, since),
            None => client.history(handle.to_string(), since),
        };

        while let Some(next) = stream.next().await {
            match next {
                Ok(message) => {
                    *messages_checked += 1;
                    if *messages_checked % 500 == 0 {
                        debug!(checked = *messages_checked, "blacklist scan progress");
                    }
                    if phase.matches(&message.text).is_some() {
                        return Some(message);
                    }
                }
                Err(e) => {
                    warn!(chat = %handle, error = %e, "blacklist chat unavailable, skipping");
                    break;
                }
            }
        }
        None
    }
}

/// `@username`, lowercased.
fn normalize_username(raw: &str) -> String {
    let trimmed = raw.trim().to_lowercase();
    if trimmed.starts_with('@') {
        trimmed
    } else {
        format!("@{trimmed}")
    }
}

/// Legacy registry rows sometimes carry `@chat/123` in the username column;
/// split that into the handle and an implicit topic id.
fn normalize_entry(entry: &BlacklistChat) -> (String, Option<i64>) {
    if let Some((base, topic_raw)) = entry.chat_username.split_once('/') {
        if let Ok(topic) = topic_raw.trim().parse::<i64>() {
            return (base.trim().to_string(), entry.topic_id.or(Some(topic)));
        }
    }
    (entry.chat_username.clone(), entry.topic_id)
}

fn build_hit(
    match_type: &str,
    match_value: String,
    message: &IncomingMessage,
    chat: &str,
    topic_id: Option<i64>,
) -> SearchHit {
    let slug = chat.trim_start_matches('@');
    let message_link = match topic_id {
        Some(topic) => format!("https://t.me/{slug}/{topic}/{}", message.id),
        None => format!("https://t.me/{slug}/{}", message.id),
    };

    SearchHit {
        found: true,
        match_type: match_type.to_string(),
        match_value,
        chat: chat.to_string(),
        message_link,
        message_id: message.id,
        message_date: message.date.to_rfc3339(),
        extracted_info: extract_info(&message.text),
        message_text: message.text.chars().take(HIT_TEXT_LIMIT).collect(),
    }
}

/// Pull the structured fields out of a blacklist report.
fn extract_info(text: &str) -> ExtractedInfo {
    let mut info = ExtractedInfo::default();

    if let Some(caps) = RE_ID.captures(text) {
        info.user_id = caps[1].parse().ok();
    }
    if let Some(caps) = RE_NICK.captures(text) {
        info.username = Some(caps[1].to_string());
    }
    if let Some(caps) = RE_FIO.captures(text) {
        info.full_name = Some(caps[1].trim().to_string());
    }
    if let Some(caps) = RE_PHONE.captures(text) {
        info.phone = Some(caps[1].trim().to_string());
    }

    let lower = text.to_lowercase();
    if lower.contains("работодатель") {
        info.role = Some("employer".to_string());
    } else if lower.contains("сотрудник") || lower.contains("работник") {
        info.role = Some("worker".to_string());
    }

    info
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use futures_util::stream::{self, BoxStream};
    use pvzwatch_telegram::{ChatRef, ClientError};
    use std::collections::HashMap;

    type ClientResult<T> = std::result::Result<T, ClientError>;

    const REPORT: &str = "Чёрный список\nНик: @scammer_77\nID: 123456\nФИО: Иванов Иван Иванович\nТел: +7 999 123-45-67\nРаботодатель не оплатил смену";

    #[test]
    fn extract_info_pulls_all_fields() {
        let info = extract_info(REPORT);
        assert_eq!(info.user_id, Some(123456));
        assert_eq!(info.username.as_deref(), Some("@scammer_77"));
        assert_eq!(info.full_name.as_deref(), Some("Иванов Иван Иванович"));
        assert_eq!(info.phone.as_deref(), Some("+7 999 123-45-67"));
        assert_eq!(info.role.as_deref(), Some("employer"));
    }

    #[test]
    fn role_worker_keywords() {
        assert_eq!(
            extract_info("сотрудник пропал со смены").role.as_deref(),
            Some("worker")
        );
        assert!(extract_info("ничего интересного").role.is_none());
    }

    #[test]
    fn username_phase_is_case_insensitive_substring() {
        let phase = Phase::Username("@Scammer_77".to_string());
        assert!(phase.matches(REPORT).is_some());
        assert!(phase.matches("чистый текст").is_none());
    }

    #[test]
    fn user_id_phase_requires_exact_id() {
        assert!(Phase::UserId(123456).matches(REPORT).is_some());
        assert!(Phase::UserId(999).matches(REPORT).is_none());
    }

    #[test]
    fn fio_phase_needs_every_token() {
        let phase = Phase::Fio(vec!["иванов".to_string(), "иван".to_string()]);
        assert!(phase.matches(REPORT).is_some());
        let missing = Phase::Fio(vec!["иванов".to_string(), "пётр".to_string()]);
        assert!(missing.matches(REPORT).is_none());
    }

    #[test]
    fn legacy_entry_with_inline_topic_is_normalized() {
        let entry = BlacklistChat {
            chat_username: "@blacklist_pvz/129".to_string(),
            chat_title: None,
            topic_id: None,
            topic_name: None,
            is_active: true,
            added_at: None,
        };
        assert_eq!(
            normalize_entry(&entry),
            ("@blacklist_pvz".to_string(), Some(129))
        );
    }

    #[test]
    fn hit_link_is_topic_aware() {
        let message = IncomingMessage {
            chat_id: 1,
            chat_username: Some("@blacklist_pvz".to_string()),
            chat_title: None,
            id: 42,
            text: REPORT.to_string(),
            date: Utc::now(),
            author_id: None,
            author_username: None,
            author_full_name: None,
            reply_to_top_id: None,
            reply_to_msg_id: None,
        };
        let hit = build_hit("username", "@scammer_77".into(), &message, "@blacklist_pvz", Some(129));
        assert_eq!(hit.message_link, "https://t.me/blacklist_pvz/129/42");
        let hit = build_hit("username", "@scammer_77".into(), &message, "@blacklist_pvz", None);
        assert_eq!(hit.message_link, "https://t.me/blacklist_pvz/42");
    }

    // --- end-to-end over a fake client ------------------------------------

    struct FakeClient {
        /// handle → messages, newest first.
        history: HashMap<String, Vec<IncomingMessage>>,
    }

    fn msg(id: i64, text: &str) -> IncomingMessage {
        IncomingMessage {
            chat_id: 9,
            chat_username: Some("@blacklist_pvz".to_string()),
            chat_title: None,
            id,
            text: text.to_string(),
            date: Utc::now(),
            author_id: None,
            author_username: None,
            author_full_name: None,
            reply_to_top_id: None,
            reply_to_msg_id: None,
        }
    }

    #[async_trait]
    impl MtClient for FakeClient {
        async fn connect(&self) -> ClientResult<()> {
            Ok(())
        }
        async fn disconnect(&self) {}
        async fn check_connection(&self) -> bool {
            true
        }
        async fn preload_dialogs(&self) -> ClientResult<()> {
            Ok(())
        }
        async fn get_chat(&self, handle: &str) -> ClientResult<ChatRef> {
            if handle == "scammer_77" {
                Ok(ChatRef {
                    id: 123456,
                    title: None,
                    username: Some(handle.to_string()),
                    is_channel: false,
                })
            } else {
                Err(ClientError::ChatNotFound(handle.to_string()))
            }
        }
        async fn forum_topics(&self, _handle: &str) -> ClientResult<HashMap<i64, String>> {
            Ok(HashMap::new())
        }
        fn history(
            &self,
            handle: String,
            _since: chrono::DateTime<Utc>,
        ) -> BoxStream<'_, ClientResult<IncomingMessage>> {
            let messages = self.history.get(&handle).cloned().unwrap_or_default();
            Box::pin(stream::iter(messages.into_iter().map(Ok)))
        }
        fn topic_history(
            &self,
            handle: String,
            _topic_id: i64,
            since: chrono::DateTime<Utc>,
        ) -> BoxStream<'_, ClientResult<IncomingMessage>> {
            self.history(handle, since)
        }
        async fn recent_messages(
            &self,
            _handle: &str,
            _limit: usize,
        ) -> ClientResult<Vec<IncomingMessage>> {
            Ok(Vec::new())
        }
        fn watch(&self, _handles: &[String]) {}
        async fn next_message(&self) -> ClientResult<IncomingMessage> {
            Err(ClientError::NotConnected)
        }
    }

    fn searcher_with_chat() -> (BlacklistSearch, Store) {
        let store = Store::open_in_memory().unwrap();
        store
            .add_blacklist_chat("@blacklist_pvz", None, None, None)
            .unwrap();
        (
            BlacklistSearch::new(0, "hash", "blacklist_session", store.clone()),
            store,
        )
    }

    #[tokio::test]
    async fn finds_by_username_substring() {
        let (searcher, store) = searcher_with_chat();
        let chats = store.list_blacklist_chats(true).unwrap();
        let client = FakeClient {
            history: HashMap::from([(
                "@blacklist_pvz".to_string(),
                vec![msg(1, "ничего"), msg(2, REPORT)],
            )]),
        };
        let query = SearchQuery {
            username: Some("scammer_77".to_string()),
            ..Default::default()
        };
        let outcome = searcher.run_phases(&client, &query, &chats).await.unwrap();
        let SearchOutcome::Found(hit) = outcome else {
            panic!("expected a hit");
        };
        assert_eq!(hit.match_type, "username");
        assert_eq!(hit.message_id, 2);
        assert_eq!(hit.extracted_info.user_id, Some(123456));
    }

    #[tokio::test]
    async fn falls_through_to_user_id_phase() {
        // The text never mentions the @username, only "ID: 123456".
        let (searcher, store) = searcher_with_chat();
        let chats = store.list_blacklist_chats(true).unwrap();
        let client = FakeClient {
            history: HashMap::from([(
                "@blacklist_pvz".to_string(),
                vec![msg(1, "Кидала. ID: 123456. Сотрудник.")],
            )]),
        };
        let query = SearchQuery {
            username: Some("@scammer_77".to_string()),
            ..Default::default()
        };
        let outcome = searcher.run_phases(&client, &query, &chats).await.unwrap();
        let SearchOutcome::Found(hit) = outcome else {
            panic!("expected a hit");
        };
        assert_eq!(hit.match_type, "user_id");
        assert_eq!(hit.match_value, "123456");
    }

    #[tokio::test]
    async fn miss_reports_counters_and_steps() {
        let (searcher, store) = searcher_with_chat();
        let chats = store.list_blacklist_chats(true).unwrap();
        let client = FakeClient {
            history: HashMap::from([(
                "@blacklist_pvz".to_string(),
                vec![msg(1, "ничего"), msg(2, "тоже ничего")],
            )]),
        };
        let query = SearchQuery {
            username: Some("ghost".to_string()),
            fio: Some("Петров Пётр".to_string()),
            ..Default::default()
        };
        let outcome = searcher.run_phases(&client, &query, &chats).await.unwrap();
        let SearchOutcome::NotFound(miss) = outcome else {
            panic!("expected a miss");
        };
        assert!(!miss.found);
        // username phase + fio phase scanned the chat (id phase skipped:
        // the fake cannot resolve "ghost")
        assert_eq!(miss.steps_done, vec!["username", "fio"]);
        assert_eq!(miss.messages_checked, 4);
        assert_eq!(miss.chats_checked, vec!["@blacklist_pvz"]);
    }

    #[tokio::test]
    async fn empty_query_is_rejected() {
        let (searcher, _store) = searcher_with_chat();
        assert!(matches!(
            searcher.search(SearchQuery::default()).await,
            Err(SearchError::EmptyQuery)
        ));
    }

    #[tokio::test]
    async fn no_registered_chats_is_an_error() {
        let store = Store::open_in_memory().unwrap();
        let searcher = BlacklistSearch::new(0, "hash", "s", store);
        let query = SearchQuery {
            username: Some("x".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            searcher.search(query).await,
            Err(SearchError::NoChats)
        ));
    }
}
