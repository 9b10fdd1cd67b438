use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::StreamExt;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use pvzwatch_core::config::{
    CONNECTION_CHECK_SECS, RECONNECT_DELAY_SECS, RECONNECT_RETRY_SECS,
};
use pvzwatch_core::types::{CityFilter, CityTag, FoundItem, Mode, TaskFilters, TaskStatus};
use pvzwatch_extract::{content_hash, extract, ItemFilter};
use pvzwatch_geo::GeoFilter;
use pvzwatch_store::{Store, DEDUP_WINDOW_HOURS};
use pvzwatch_telegram::{ClientError, IncomingMessage, MtClient, Notify};

use crate::error::{PipelineError, Result};
use crate::chatspec::ChatPlan;
use crate::supervisor::Supervisor;

/// The in-memory `(chat_id, message_id)` set is cleared wholesale past this
/// size. Safe: the durable `(task_id, permalink)` constraint is the real
/// source of truth, the set only saves redundant processing of the
/// realtime/polling overlap.
const SEEN_CAP: usize = 10_000;

/// How many tail messages the polling fallback inspects per chat.
const POLL_TAIL: usize = 5;

/// Last-resort topic naming from the message text ("МСК - Ozon",
/// "СПБ -> WB", "#мск_озон") when the topic cache has no entry.
static TOPIC_NAME_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)\b(мск|спб)\s*[-—>→]+\s*([\w]+)",
        r"(?i)#(мск|спб)_([\w]+)",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

/// Static description of one monitoring job.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub task_id: Uuid,
    pub mode: Mode,
    pub chats: Vec<String>,
    pub filters: TaskFilters,
    pub parse_history_days: u32,
}

/// Owns one task's lifetime: history backfill, realtime subscription with a
/// polling fallback, reconnects, and the per-message filter chain.
pub struct IngestionPipeline {
    cfg: PipelineConfig,
    plan: ChatPlan,
    item_filter: ItemFilter,
    store: Store,
    geo: Arc<GeoFilter>,
    notifier: Arc<dyn Notify>,
    supervisor: Arc<Supervisor>,
    client: Arc<dyn MtClient>,
    cancel: CancellationToken,
    seen: HashSet<(i64, i64)>,
    last_seen: HashMap<i64, i64>,
    topics: HashMap<String, HashMap<i64, String>>,
}

impl IngestionPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: PipelineConfig,
        store: Store,
        geo: Arc<GeoFilter>,
        notifier: Arc<dyn Notify>,
        supervisor: Arc<Supervisor>,
        client: Arc<dyn MtClient>,
        cancel: CancellationToken,
    ) -> Self {
        let plan = ChatPlan::parse(&cfg.chats);
        let item_filter = ItemFilter::new(cfg.filters.clone());
        Self {
            cfg,
            plan,
            item_filter,
            store,
            geo,
            notifier,
            supervisor,
            client,
            cancel,
            seen: HashSet::new(),
            last_seen: HashMap::new(),
            topics: HashMap::new(),
        }
    }

    /// Drive the task to completion. Terminal status handling:
    /// auth_error on a revoked session (the user is told), failed on any
    /// other fatal error, stopped on cooperative cancellation.
    pub async fn run(mut self) {
        let task_id = self.cfg.task_id;
        let outcome = self.run_inner().await;

        let final_status = match outcome {
            Ok(()) => TaskStatus::Stopped,
            Err(PipelineError::Client(ClientError::AuthExpired)) => {
                error!(%task_id, "session authorization expired");
                self.notifier
                    .send_text(
                        "⚠️ Сессия Telegram недействительна. Мониторинг остановлен — перезапустите задачу после повторной авторизации.",
                    )
                    .await;
                TaskStatus::AuthError
            }
            Err(e) => {
                error!(%task_id, error = %e, "pipeline failed");
                TaskStatus::Failed
            }
        };

        self.client.disconnect().await;
        self.supervisor.update_status(task_id, final_status);
        if let Err(e) = self
            .store
            .update_task_status(task_id, final_status, Some(Utc::now()))
        {
            error!(%task_id, error = %e, "terminal status write failed");
        }
        info!(%task_id, status = %final_status, "pipeline finished");
    }

    async fn run_inner(&mut self) -> Result<()> {
        let task_id = self.cfg.task_id;
        let client = self.client.clone();
        let cancel = self.cancel.clone();

        client.connect().await?;
        client.preload_dialogs().await?;

        // Forum-topic cache per base chat; a plain chat yields an empty map.
        for chat in self.plan.base_handles().to_vec() {
            if cancel.is_cancelled() {
                return Ok(());
            }
            match client.forum_topics(&chat).await {
                Ok(topics) if !topics.is_empty() => {
                    debug!(chat = %chat, topics = topics.len(), "topic cache filled");
                    self.topics.insert(chat.clone(), topics);
                }
                Ok(_) => {}
                Err(ClientError::AuthExpired) => return Err(ClientError::AuthExpired.into()),
                Err(e) => warn!(chat = %chat, error = %e, "forum topics unavailable"),
            }
        }

        self.supervisor.update_status(task_id, TaskStatus::Running);
        self.store
            .update_task_status(task_id, TaskStatus::Running, None)?;

        // History backfill, oldest task chats first, newest messages first.
        let since = Utc::now() - chrono::Duration::days(i64::from(self.cfg.parse_history_days));
        info!(%task_id, days = self.cfg.parse_history_days, "history backfill started");
        for chat in self.plan.base_handles().to_vec() {
            if cancel.is_cancelled() {
                return Ok(());
            }
            let mut stream = client.history(chat.clone(), since);
            while let Some(next) = stream.next().await {
                if cancel.is_cancelled() {
                    return Ok(());
                }
                match next {
                    Ok(message) => {
                        if let Err(e) = self.process(&message, &chat).await {
                            warn!(chat = %chat, error = %e, "message skipped");
                        }
                    }
                    Err(ClientError::AuthExpired) => return Err(ClientError::AuthExpired.into()),
                    Err(e) => {
                        warn!(chat = %chat, error = %e, "history stream aborted");
                        break;
                    }
                }
            }
        }

        // Realtime subscription over the same chat set.
        let handles = self.plan.base_handles().to_vec();
        client.watch(&handles);
        info!(%task_id, chats = handles.len(), "realtime monitoring started");

        // Wait loop: realtime messages, a 30 s connection check with the
        // polling fallback, and the cancellation signal.
        let mut tick = tokio::time::interval(Duration::from_secs(CONNECTION_CHECK_SECS));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(%task_id, "cancellation received");
                    return Ok(());
                }
                next = client.next_message() => match next {
                    Ok(message) => {
                        let chat = message.chat_handle();
                        if let Err(e) = self.process(&message, &chat).await {
                            warn!(chat = %chat, error = %e, "message skipped");
                        }
                    }
                    Err(ClientError::AuthExpired) => return Err(ClientError::AuthExpired.into()),
                    Err(e) => {
                        warn!(error = %e, "realtime stream error");
                        sleep(Duration::from_secs(1)).await;
                    }
                },
                _ = tick.tick() => {
                    if !client.check_connection().await {
                        warn!(%task_id, "connection lost, reconnecting");
                        client.disconnect().await;
                        sleep(Duration::from_secs(RECONNECT_DELAY_SECS)).await;
                        match client.connect().await {
                            Ok(()) => {
                                let _ = client.preload_dialogs().await;
                                client.watch(&handles);
                                info!(%task_id, "reconnected");
                            }
                            Err(ClientError::AuthExpired) => {
                                return Err(ClientError::AuthExpired.into())
                            }
                            Err(e) => {
                                warn!(%task_id, error = %e, "reconnect failed");
                                sleep(Duration::from_secs(RECONNECT_RETRY_SECS)).await;
                            }
                        }
                    }
                    self.poll_recent(&client).await;
                }
            }
        }
    }

    /// Polling fallback: inspect each chat's recent tail and route anything
    /// newer than the last seen id through the normal processing path.
    async fn poll_recent(&mut self, client: &Arc<dyn MtClient>) {
        for chat in self.plan.base_handles().to_vec() {
            let messages = match client.recent_messages(&chat, POLL_TAIL).await {
                Ok(messages) => messages,
                Err(e) => {
                    debug!(chat = %chat, error = %e, "polling fallback skipped");
                    continue;
                }
            };
            for message in messages {
                let watermark = self.last_seen.get(&message.chat_id).copied().unwrap_or(0);
                if message.id <= watermark {
                    continue;
                }
                debug!(chat = %chat, id = message.id, "polling fallback caught a message");
                if let Err(e) = self.process(&message, &chat).await {
                    warn!(chat = %chat, error = %e, "message skipped");
                }
            }
        }
    }

    /// The per-message filter chain. Short-circuits on the first failed gate;
    /// errors are per-message and never kill the pipeline.
    async fn process(&mut self, message: &IncomingMessage, chat_name: &str) -> Result<()> {
        // 1. In-memory dedup of the realtime/polling overlap.
        let key = (message.chat_id, message.id);
        if self.seen.contains(&key) {
            return Ok(());
        }
        if self.seen.len() >= SEEN_CAP {
            self.seen.clear();
        }
        self.seen.insert(key);

        // 2. Watermark for the polling fallback.
        let watermark = self.last_seen.entry(message.chat_id).or_insert(0);
        *watermark = (*watermark).max(message.id);

        // 3. Topic gate.
        let actual_topic = message.reply_to_top_id.or(message.reply_to_msg_id);
        if !self.plan.topic_allowed(chat_name, actual_topic) {
            return Ok(());
        }

        // 4. Only messages that reached the extractor count as scanned.
        self.supervisor.add_stats(self.cfg.task_id, 1, 0, 0);

        // 5–6. Extraction and mode gate.
        let Some(extracted) = extract(&message.text, message.date) else {
            return Ok(());
        };
        if extracted.kind != self.cfg.mode {
            return Ok(());
        }

        // 7. City gate: an explicit topic/chat tag wins over text geo.
        let tag = self.plan.city_tag(chat_name, actual_topic);
        match tag {
            Some(tag) => {
                if !tag.passes(self.cfg.filters.city_filter) {
                    return Ok(());
                }
            }
            None => match self.cfg.filters.city_filter {
                CityFilter::Msk => {
                    if !self.geo.should_take_for_moscow(&message.text) {
                        return Ok(());
                    }
                }
                CityFilter::Spb => {
                    if !self.geo.should_take_for_spb(&message.text) {
                        return Ok(());
                    }
                }
                CityFilter::All => {}
            },
        }

        // 8. Business filter (date window, price window, шк predicate).
        if !self.item_filter.matches(&extracted) {
            return Ok(());
        }
        // The filter guarantees a price from here on.
        let Some(price) = extracted.price else {
            return Ok(());
        };

        // 9. Topic resolution for the stored row: a restricted chat keeps the
        // gated topic as-is; elsewhere a reply id only counts as a topic when
        // the topic cache knows it.
        let topic_cache = self.topics.get(chat_name);
        let topic_id = if self.plan.is_topic_restricted(chat_name) {
            actual_topic
        } else {
            actual_topic
                .filter(|t| topic_cache.map(|c| c.contains_key(t)).unwrap_or(false))
        };
        let topic_name = topic_id
            .and_then(|t| topic_cache.and_then(|c| c.get(&t).cloned()))
            .or_else(|| topic_name_from_text(&message.text));

        // 10. Level-2 dedup before building the row (the store re-checks).
        if let Some(author) = &message.author_username {
            if self.store.check_author_duplicate(
                author,
                extracted.date,
                price,
                self.cfg.task_id,
                DEDUP_WINDOW_HOURS,
            )? {
                debug!(author = %author, "author duplicate dropped");
                return Ok(());
            }
        }

        // 11. Topic-aware permalink.
        let chat_slug = chat_name.trim_start_matches('@');
        let message_link = match topic_id {
            Some(topic) => format!("https://t.me/{chat_slug}/{topic}/{}", message.id),
            None => format!("https://t.me/{chat_slug}/{}", message.id),
        };

        // 12. Build and persist.
        let city = tag.map(|t| {
            match t {
                CityTag::Msk => "МСК",
                CityTag::Spb => "СПБ",
            }
            .to_string()
        });
        let item = FoundItem {
            id: None,
            task_id: self.cfg.task_id,
            mode: self.cfg.mode,
            author_username: message.author_username.clone(),
            author_full_name: message.author_full_name.clone(),
            author_id: message.author_id,
            work_date: extracted.date,
            price,
            shk: extracted.shk.clone(),
            location: extracted.location.clone(),
            city,
            metro_station: None,
            district: None,
            message_text: message.text.clone(),
            message_link: message_link.clone(),
            chat_name: chat_name.to_string(),
            topic_id,
            topic_name,
            message_date: message.date,
            found_at: Utc::now(),
            notified: false,
            content_hash: Some(content_hash(
                Some(price),
                extracted.location.as_deref(),
                &message.text,
            )),
        };

        let Some(item_id) = self.store.add_found_item(&item)? else {
            return Ok(());
        };

        // 13–14. Count, notify, mark.
        self.supervisor.add_stats(self.cfg.task_id, 0, 1, 0);
        info!(task_id = %self.cfg.task_id, link = %message_link, "new item found");

        if self.notifier.send(&item, item_id).await {
            self.store.mark_notified(item_id)?;
            self.supervisor.add_stats(self.cfg.task_id, 0, 0, 1);
        }

        Ok(())
    }
}

/// Fallback topic naming from the message text itself.
fn topic_name_from_text(text: &str) -> Option<String> {
    for re in TOPIC_NAME_PATTERNS.iter() {
        if let Some(m) = re.find(text) {
            return Some(m.as_str().trim().to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use futures_util::stream::{self, BoxStream};
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    use pvzwatch_core::types::Task;
    use pvzwatch_telegram::ChatRef;

    type ClientResult<T> = std::result::Result<T, ClientError>;

    struct FakeClient {
        history: Mutex<HashMap<String, Vec<IncomingMessage>>>,
        recent: Mutex<HashMap<String, Vec<IncomingMessage>>>,
        topics: HashMap<String, HashMap<i64, String>>,
        realtime: tokio::sync::Mutex<mpsc::UnboundedReceiver<IncomingMessage>>,
    }

    impl FakeClient {
        fn new() -> (Arc<Self>, mpsc::UnboundedSender<IncomingMessage>) {
            let (tx, rx) = mpsc::unbounded_channel();
            (
                Arc::new(Self {
                    history: Mutex::new(HashMap::new()),
                    recent: Mutex::new(HashMap::new()),
                    topics: HashMap::new(),
                    realtime: tokio::sync::Mutex::new(rx),
                }),
                tx,
            )
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
            Ok(ChatRef {
                id: 1,
                title: Some(handle.to_string()),
                username: Some(handle.trim_start_matches('@').to_string()),
                is_channel: true,
            })
        }
        async fn forum_topics(
            &self,
            handle: &str,
        ) -> ClientResult<HashMap<i64, String>> {
            Ok(self.topics.get(handle).cloned().unwrap_or_default())
        }
        fn history(
            &self,
            handle: String,
            _since: chrono::DateTime<Utc>,
        ) -> BoxStream<'_, ClientResult<IncomingMessage>> {
            let messages = self
                .history
                .lock()
                .unwrap()
                .get(&handle)
                .cloned()
                .unwrap_or_default();
            Box::pin(stream::iter(messages.into_iter().map(Ok)))
        }
        fn topic_history(
            &self,
            _handle: String,
            _topic_id: i64,
            _since: chrono::DateTime<Utc>,
        ) -> BoxStream<'_, ClientResult<IncomingMessage>> {
            Box::pin(stream::empty())
        }
        async fn recent_messages(
            &self,
            handle: &str,
            _limit: usize,
        ) -> ClientResult<Vec<IncomingMessage>> {
            Ok(self
                .recent
                .lock()
                .unwrap()
                .get(handle)
                .cloned()
                .unwrap_or_default())
        }
        fn watch(&self, _handles: &[String]) {}
        async fn next_message(&self) -> ClientResult<IncomingMessage> {
            self.realtime
                .lock()
                .await
                .recv()
                .await
                .ok_or(ClientError::NotConnected)
        }
    }

    struct FakeNotifier {
        sent: Mutex<Vec<i64>>,
    }

    #[async_trait]
    impl Notify for FakeNotifier {
        async fn send(&self, _item: &FoundItem, item_id: i64) -> bool {
            self.sent.lock().unwrap().push(item_id);
            true
        }
        async fn send_text(&self, _text: &str) -> bool {
            true
        }
    }

    fn message(chat_id: i64, id: i64, text: &str, topic: Option<i64>) -> IncomingMessage {
        IncomingMessage {
            chat_id,
            chat_username: Some("@pvz_chat".to_string()),
            chat_title: None,
            id,
            text: text.to_string(),
            date: Utc::now(),
            author_id: Some(10),
            author_username: Some("ivan".to_string()),
            author_full_name: Some("Ivan".to_string()),
            reply_to_top_id: topic,
            reply_to_msg_id: None,
        }
    }

    fn filters() -> TaskFilters {
        let today = Utc::now().date_naive();
        TaskFilters {
            date_from: today - chrono::Duration::days(1),
            date_to: today + chrono::Duration::days(30),
            min_price: 1000,
            max_price: 5000,
            shk_filter: "любое".to_string(),
            city_filter: CityFilter::All,
        }
    }

    struct Fixture {
        pipeline: IngestionPipeline,
        store: Store,
        supervisor: Arc<Supervisor>,
        task_id: Uuid,
        notifier: Arc<FakeNotifier>,
    }

    fn fixture(chats: &[&str], mode: Mode, city: CityFilter) -> Fixture {
        let store = Store::open_in_memory().unwrap();
        let supervisor = Arc::new(Supervisor::new());
        let task_id = Uuid::new_v4();
        let mut task_filters = filters();
        task_filters.city_filter = city;

        store
            .create_task(&Task {
                task_id,
                user_id: 1,
                mode,
                chats: chats.iter().map(|s| s.to_string()).collect(),
                filters: task_filters.clone(),
                notification_chat_id: -1,
                status: TaskStatus::Pending,
                created_at: Utc::now(),
                stopped_at: None,
                session_path: None,
                blacklist_session_path: None,
            })
            .unwrap();

        let cancel = supervisor.create(task_id, mode);
        let (client, _tx) = FakeClient::new();
        let notifier = Arc::new(FakeNotifier {
            sent: Mutex::new(Vec::new()),
        });
        let pipeline = IngestionPipeline::new(
            PipelineConfig {
                task_id,
                mode,
                chats: chats.iter().map(|s| s.to_string()).collect(),
                filters: task_filters,
                parse_history_days: 3,
            },
            store.clone(),
            Arc::new(GeoFilter::new()),
            notifier.clone(),
            supervisor.clone(),
            client,
            cancel,
        );
        Fixture {
            pipeline,
            store,
            supervisor,
            task_id,
            notifier,
        }
    }

    const WORKER_TEXT: &str = "Выйду завтра, 3000";

    #[tokio::test]
    async fn accepted_message_is_stored_and_notified() {
        let mut fx = fixture(&["@pvz_chat"], Mode::Worker, CityFilter::All);
        fx.pipeline
            .process(&message(1, 100, WORKER_TEXT, None), "@pvz_chat")
            .await
            .unwrap();

        assert_eq!(fx.store.count_items(fx.task_id).unwrap(), 1);
        assert_eq!(fx.store.count_notified(fx.task_id).unwrap(), 1);
        assert_eq!(fx.notifier.sent.lock().unwrap().len(), 1);

        let stats = fx.supervisor.stats(fx.task_id).unwrap();
        assert_eq!(stats.total_messages_scanned, 1);
        assert_eq!(stats.items_found, 1);
        assert_eq!(stats.notifications_sent, 1);
    }

    #[tokio::test]
    async fn realtime_polling_overlap_processes_once() {
        // The same (chat_id, message_id) arriving twice: once via realtime,
        // once via the polling fallback: survives exactly once.
        let mut fx = fixture(&["@pvz_chat"], Mode::Worker, CityFilter::All);
        let msg = message(1, 100, WORKER_TEXT, None);

        fx.pipeline.process(&msg, "@pvz_chat").await.unwrap();
        fx.pipeline.process(&msg, "@pvz_chat").await.unwrap();

        assert_eq!(fx.store.count_items(fx.task_id).unwrap(), 1);
        // the second delivery never reached the extractor
        assert_eq!(
            fx.supervisor.stats(fx.task_id).unwrap().total_messages_scanned,
            1
        );
    }

    #[tokio::test]
    async fn topic_gate_drops_before_the_extractor() {
        let mut fx = fixture(&["@pvz_chat/55"], Mode::Worker, CityFilter::All);

        fx.pipeline
            .process(&message(1, 100, WORKER_TEXT, Some(66)), "@pvz_chat")
            .await
            .unwrap();
        assert_eq!(fx.store.count_items(fx.task_id).unwrap(), 0);
        assert_eq!(
            fx.supervisor.stats(fx.task_id).unwrap().total_messages_scanned,
            0
        );

        fx.pipeline
            .process(&message(1, 101, WORKER_TEXT, Some(55)), "@pvz_chat")
            .await
            .unwrap();
        assert_eq!(fx.store.count_items(fx.task_id).unwrap(), 1);
    }

    #[tokio::test]
    async fn untopiced_message_is_dropped_in_a_restricted_chat() {
        let mut fx = fixture(&["@pvz_chat/55"], Mode::Worker, CityFilter::All);
        fx.pipeline
            .process(&message(1, 100, WORKER_TEXT, None), "@pvz_chat")
            .await
            .unwrap();
        assert_eq!(fx.store.count_items(fx.task_id).unwrap(), 0);
    }

    #[tokio::test]
    async fn mode_mismatch_is_dropped() {
        let mut fx = fixture(&["@pvz_chat"], Mode::Employer, CityFilter::All);
        fx.pipeline
            .process(&message(1, 100, WORKER_TEXT, None), "@pvz_chat")
            .await
            .unwrap();
        assert_eq!(fx.store.count_items(fx.task_id).unwrap(), 0);
        // it did reach the extractor though
        assert_eq!(
            fx.supervisor.stats(fx.task_id).unwrap().total_messages_scanned,
            1
        );
    }

    #[tokio::test]
    async fn explicit_topic_tag_overrides_text_geo() {
        // Topic 55 is labelled МСК; an SPb-filtered task drops it even
        // though the text has no geo signal at all.
        let mut fx = fixture(&["@pvz_chat/55#МСК"], Mode::Worker, CityFilter::Spb);
        fx.pipeline
            .process(&message(1, 100, WORKER_TEXT, Some(55)), "@pvz_chat")
            .await
            .unwrap();
        assert_eq!(fx.store.count_items(fx.task_id).unwrap(), 0);

        // The same topic passes a Moscow-filtered task.
        let mut fx = fixture(&["@pvz_chat/55#МСК"], Mode::Worker, CityFilter::Msk);
        fx.pipeline
            .process(&message(1, 100, WORKER_TEXT, Some(55)), "@pvz_chat")
            .await
            .unwrap();
        assert_eq!(fx.store.count_items(fx.task_id).unwrap(), 1);
    }

    #[tokio::test]
    async fn text_geo_gates_untagged_chats() {
        let mut fx = fixture(&["@pvz_chat"], Mode::Worker, CityFilter::Msk);
        fx.pipeline
            .process(
                &message(1, 100, "Выйду завтра в Питере, 3000", None),
                "@pvz_chat",
            )
            .await
            .unwrap();
        assert_eq!(fx.store.count_items(fx.task_id).unwrap(), 0);

        fx.pipeline
            .process(&message(1, 101, WORKER_TEXT, None), "@pvz_chat")
            .await
            .unwrap();
        assert_eq!(fx.store.count_items(fx.task_id).unwrap(), 1);
    }

    #[tokio::test]
    async fn business_filter_rejects_out_of_range_price() {
        let mut fx = fixture(&["@pvz_chat"], Mode::Worker, CityFilter::All);
        fx.pipeline
            .process(&message(1, 100, "Выйду завтра, 9000", None), "@pvz_chat")
            .await
            .unwrap();
        assert_eq!(fx.store.count_items(fx.task_id).unwrap(), 0);
    }

    #[tokio::test]
    async fn permalink_is_topic_aware() {
        let mut fx = fixture(&["@pvz_chat/55"], Mode::Worker, CityFilter::All);
        fx.pipeline
            .process(&message(1, 100, WORKER_TEXT, Some(55)), "@pvz_chat")
            .await
            .unwrap();
        let items = fx.store.list_found_items(fx.task_id, 10).unwrap();
        assert_eq!(items[0].message_link, "https://t.me/pvz_chat/55/100");
        assert_eq!(items[0].topic_id, Some(55));
    }

    #[tokio::test]
    async fn work_date_is_extracted_not_message_date() {
        let mut fx = fixture(&["@pvz_chat"], Mode::Worker, CityFilter::All);
        fx.pipeline
            .process(&message(1, 100, WORKER_TEXT, None), "@pvz_chat")
            .await
            .unwrap();
        let items = fx.store.list_found_items(fx.task_id, 10).unwrap();
        let tomorrow = Utc::now().date_naive() + chrono::Duration::days(1);
        assert_eq!(items[0].work_date, tomorrow);
    }

    #[tokio::test]
    async fn run_loop_processes_history_and_realtime_then_stops() {
        let store = Store::open_in_memory().unwrap();
        let supervisor = Arc::new(Supervisor::new());
        let task_id = Uuid::new_v4();
        let task_filters = filters();

        store
            .create_task(&Task {
                task_id,
                user_id: 1,
                mode: Mode::Worker,
                chats: vec!["@pvz_chat".to_string()],
                filters: task_filters.clone(),
                notification_chat_id: -1,
                status: TaskStatus::Pending,
                created_at: Utc::now(),
                stopped_at: None,
                session_path: None,
                blacklist_session_path: None,
            })
            .unwrap();

        let cancel = supervisor.create(task_id, Mode::Worker);
        let (client, tx) = FakeClient::new();
        client.history.lock().unwrap().insert(
            "@pvz_chat".to_string(),
            vec![message(1, 50, "Выйду завтра, 2500", None)],
        );
        let notifier = Arc::new(FakeNotifier {
            sent: Mutex::new(Vec::new()),
        });

        let pipeline = IngestionPipeline::new(
            PipelineConfig {
                task_id,
                mode: Mode::Worker,
                chats: vec!["@pvz_chat".to_string()],
                filters: task_filters,
                parse_history_days: 3,
            },
            store.clone(),
            Arc::new(GeoFilter::new()),
            notifier,
            supervisor.clone(),
            client.clone(),
            cancel,
        );
        let handle = tokio::spawn(pipeline.run());
        supervisor.attach_runtime(task_id, handle);

        // history lands first
        wait_for(|| store.count_items(task_id).unwrap() == 1).await;
        assert_eq!(supervisor.get(task_id).unwrap().status, TaskStatus::Running);

        // then a realtime message (different author key: other price)
        tx.send(message(1, 51, "Выйду завтра, 2800", None)).unwrap();
        wait_for(|| store.count_items(task_id).unwrap() == 2).await;

        // stop is final: the loop exits and nothing else is persisted
        assert!(supervisor.stop(task_id));
        tokio::time::sleep(Duration::from_millis(50)).await;
        let _ = tx.send(message(1, 52, "Выйду завтра, 2900", None));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(store.count_items(task_id).unwrap(), 2);
        assert_eq!(supervisor.get(task_id).unwrap().status, TaskStatus::Stopped);
    }

    async fn wait_for(mut cond: impl FnMut() -> bool) {
        for _ in 0..100 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("condition not reached in time");
    }

    #[test]
    fn topic_name_fallback_patterns() {
        assert_eq!(
            topic_name_from_text("МСК - Ozon, смена на завтра").as_deref(),
            Some("МСК - Ozon")
        );
        assert_eq!(
            topic_name_from_text("#спб_вб ищу смену").as_deref(),
            Some("#спб_вб")
        );
        assert!(topic_name_from_text("обычный текст").is_none());
    }

    #[test]
    fn seen_set_clears_wholesale_at_cap() {
        let mut fx = fixture(&["@pvz_chat"], Mode::Worker, CityFilter::All);
        for i in 0..SEEN_CAP {
            fx.pipeline.seen.insert((9, i as i64));
        }
        // next insert path clears the set first
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        rt.block_on(async {
            fx.pipeline
                .process(&message(1, 100, WORKER_TEXT, None), "@pvz_chat")
                .await
                .unwrap();
        });
        assert_eq!(fx.pipeline.seen.len(), 1);
    }
}
