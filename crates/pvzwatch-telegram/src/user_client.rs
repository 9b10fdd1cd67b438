use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use async_stream::try_stream;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;
use grammers_client::types::{Chat, Message};
use grammers_client::{Client, Config, InitParams, InvocationError, Update};
use grammers_session::Session;
use grammers_tl_types as tl;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::client::MtClient;
use crate::error::{ClientError, Result};
use crate::types::{ChatRef, IncomingMessage};

/// Page size for the forum-topics and topic-replies RPCs.
const RPC_PAGE_SIZE: i32 = 100;

/// RPC error names that mean the session is gone for good.
const AUTH_ERRORS: &[&str] = &[
    "AUTH_KEY_UNREGISTERED",
    "AUTH_KEY_INVALID",
    "SESSION_REVOKED",
    "SESSION_EXPIRED",
    "USER_DEACTIVATED",
];

/// grammers-backed MTProto user client.
///
/// One instance owns one session file. All RPC paths sleep out flood-wait
/// signals and retry, so callers only ever see terminal errors.
pub struct UserClient {
    api_id: i32,
    api_hash: String,
    session_path: String,
    client: Mutex<Option<Client>>,
    /// Resolved peers by lowercased handle; avoids re-resolving on every page.
    peers: Mutex<HashMap<String, Chat>>,
    /// Lowercased handles (no `@`) accepted by `next_message`.
    watched: Mutex<HashSet<String>>,
}

impl UserClient {
    pub fn new(api_id: i32, api_hash: impl Into<String>, session_path: impl Into<String>) -> Self {
        Self {
            api_id,
            api_hash: api_hash.into(),
            session_path: session_path.into(),
            client: Mutex::new(None),
            peers: Mutex::new(HashMap::new()),
            watched: Mutex::new(HashSet::new()),
        }
    }

    fn handle(&self) -> Result<Client> {
        self.client
            .lock()
            .unwrap()
            .clone()
            .ok_or(ClientError::NotConnected)
    }

    async fn resolve_chat(&self, client: &Client, handle: &str) -> Result<Chat> {
        let key = handle_key(handle);
        if let Some(chat) = self.peers.lock().unwrap().get(&key) {
            return Ok(chat.clone());
        }
        let chat = loop {
            match client.resolve_username(&key).await {
                Ok(Some(chat)) => break chat,
                Ok(None) => return Err(ClientError::ChatNotFound(handle.to_string())),
                Err(e) => flood_or_bail(e).await?,
            }
        };
        self.peers.lock().unwrap().insert(key, chat.clone());
        Ok(chat)
    }
}

#[async_trait]
impl MtClient for UserClient {
    async fn connect(&self) -> Result<()> {
        let session = Session::load_file_or_create(&self.session_path)
            .map_err(|e| ClientError::Session(e.to_string()))?;

        let client = Client::connect(Config {
            session,
            api_id: self.api_id,
            api_hash: self.api_hash.clone(),
            params: InitParams::default(),
        })
        .await
        .map_err(|e| ClientError::Connect(e.to_string()))?;

        let authorized = client
            .is_authorized()
            .await
            .map_err(|e| ClientError::Network(e.to_string()))?;
        if !authorized {
            return Err(ClientError::AuthExpired);
        }

        info!(session = %self.session_path, "mtproto client connected");
        *self.client.lock().unwrap() = Some(client);
        Ok(())
    }

    async fn disconnect(&self) {
        let client = self.client.lock().unwrap().take();
        if let Some(client) = client {
            if let Err(e) = client.session().save_to_file(&self.session_path) {
                warn!(session = %self.session_path, error = %e, "session save failed");
            }
            info!(session = %self.session_path, "mtproto client stopped");
        }
        self.peers.lock().unwrap().clear();
    }

    async fn check_connection(&self) -> bool {
        match self.handle() {
            Ok(client) => client.is_authorized().await.is_ok(),
            Err(_) => false,
        }
    }

    async fn preload_dialogs(&self) -> Result<()> {
        let client = self.handle()?;
        let mut dialogs = client.iter_dialogs();
        let mut count = 0usize;
        loop {
            match dialogs.next().await {
                Ok(Some(_)) => count += 1,
                Ok(None) => break,
                Err(e) => flood_or_bail(e).await?,
            }
        }
        debug!(count, "dialogs preloaded");
        Ok(())
    }

    async fn get_chat(&self, handle: &str) -> Result<ChatRef> {
        let client = self.handle()?;
        let chat = self.resolve_chat(&client, handle).await?;
        Ok(chat_ref(&chat))
    }

    async fn forum_topics(&self, handle: &str) -> Result<HashMap<i64, String>> {
        let client = self.handle()?;
        let chat = self.resolve_chat(&client, handle).await?;
        let packed = chat.pack();
        if !chat_ref(&chat).is_channel {
            debug!(handle, "not a channel, no forum topics");
            return Ok(HashMap::new());
        }

        let request = tl::functions::channels::GetForumTopics {
            channel: tl::types::InputChannel {
                channel_id: packed.id,
                access_hash: packed.access_hash.unwrap_or(0),
            }
            .into(),
            q: None,
            offset_date: 0,
            offset_id: 0,
            offset_topic: 0,
            limit: RPC_PAGE_SIZE,
        };

        let result = loop {
            match client.invoke(&request).await {
                Ok(r) => break r,
                Err(e) => {
                    if is_rpc(&e, "CHANNEL_FORUM_MISSING") {
                        debug!(handle, "chat is not a forum");
                        return Ok(HashMap::new());
                    }
                    flood_or_bail(e).await?;
                }
            }
        };

        let tl::enums::messages::ForumTopics::ForumTopics(data) = result;
        let mut topics = HashMap::new();
        for topic in data.topics {
            if let tl::enums::ForumTopic::ForumTopic(t) = topic {
                topics.insert(i64::from(t.id), t.title);
            }
        }
        info!(handle, count = topics.len(), "forum topics loaded");
        Ok(topics)
    }

    fn history(
        &self,
        handle: String,
        since: DateTime<Utc>,
    ) -> BoxStream<'_, Result<IncomingMessage>> {
        Box::pin(try_stream! {
            let client = self.handle()?;
            let chat = self.resolve_chat(&client, &handle).await?;
            let canonical = canonical_handle(&chat, &handle);
            let mut iter = client.iter_messages(chat.pack());
            loop {
                let next = loop {
                    match iter.next().await {
                        Ok(n) => break n,
                        Err(e) => flood_or_bail(e).await?,
                    }
                };
                let Some(message) = next else { break };
                if message.date() < since {
                    break;
                }
                if message.text().is_empty() {
                    continue;
                }
                yield incoming(&message, Some(&canonical));
            }
        })
    }

    fn topic_history(
        &self,
        handle: String,
        topic_id: i64,
        since: DateTime<Utc>,
    ) -> BoxStream<'_, Result<IncomingMessage>> {
        Box::pin(try_stream! {
            let client = self.handle()?;
            let chat = self.resolve_chat(&client, &handle).await?;
            let canonical = canonical_handle(&chat, &handle);
            let packed = chat.pack();
            let peer: tl::enums::InputPeer = tl::types::InputPeerChannel {
                channel_id: packed.id,
                access_hash: packed.access_hash.unwrap_or(0),
            }
            .into();

            let mut offset_id = 0i32;
            'pages: loop {
                let request = tl::functions::messages::GetReplies {
                    peer: peer.clone(),
                    msg_id: topic_id as i32,
                    offset_id,
                    offset_date: 0,
                    add_offset: 0,
                    limit: RPC_PAGE_SIZE,
                    max_id: 0,
                    min_id: 0,
                    hash: 0,
                };
                let result = loop {
                    match client.invoke(&request).await {
                        Ok(r) => break r,
                        Err(e) => flood_or_bail(e).await?,
                    }
                };

                let messages = match result {
                    tl::enums::messages::Messages::Messages(m) => m.messages,
                    tl::enums::messages::Messages::Slice(m) => m.messages,
                    tl::enums::messages::Messages::ChannelMessages(m) => m.messages,
                    tl::enums::messages::Messages::NotModified(_) => break,
                };
                if messages.is_empty() {
                    break;
                }

                let page_len = messages.len();
                for raw in messages {
                    // Advance pagination past service/empty messages too.
                    offset_id = match &raw {
                        tl::enums::Message::Message(m) => m.id,
                        tl::enums::Message::Service(m) => m.id,
                        tl::enums::Message::Empty(m) => m.id,
                    };
                    let tl::enums::Message::Message(m) = raw else {
                        continue;
                    };
                    let date = DateTime::<Utc>::from_timestamp(i64::from(m.date), 0)
                        .unwrap_or_else(Utc::now);
                    if date < since {
                        break 'pages;
                    }
                    if m.message.is_empty() {
                        continue;
                    }
                    yield incoming_raw(&m, &canonical, date);
                }

                if page_len < RPC_PAGE_SIZE as usize {
                    break;
                }
            }
        })
    }

    async fn recent_messages(&self, handle: &str, limit: usize) -> Result<Vec<IncomingMessage>> {
        let client = self.handle()?;
        let chat = self.resolve_chat(&client, handle).await?;
        let canonical = canonical_handle(&chat, handle);
        let mut iter = client.iter_messages(chat.pack()).limit(limit);
        let mut messages = Vec::new();
        loop {
            match iter.next().await {
                Ok(Some(message)) => {
                    if !message.text().is_empty() {
                        messages.push(incoming(&message, Some(&canonical)));
                    }
                }
                Ok(None) => break,
                Err(e) => flood_or_bail(e).await?,
            }
        }
        Ok(messages)
    }

    fn watch(&self, handles: &[String]) {
        let set: HashSet<String> = handles.iter().map(|h| handle_key(h)).collect();
        info!(chats = set.len(), "realtime watch set installed");
        *self.watched.lock().unwrap() = set;
    }

    async fn next_message(&self) -> Result<IncomingMessage> {
        let client = self.handle()?;
        loop {
            let update = client
                .next_update()
                .await
                .map_err(|e| ClientError::Network(e.to_string()))?;
            let Update::NewMessage(message) = update else {
                continue;
            };
            if message.text().is_empty() {
                continue;
            }
            let chat = message.chat();
            let watched = {
                let set = self.watched.lock().unwrap();
                chat.username()
                    .map(|u| set.contains(&u.to_lowercase()))
                    .unwrap_or(false)
            };
            if !watched {
                continue;
            }
            return Ok(incoming(&message, None));
        }
    }
}

// --- helpers ---------------------------------------------------------------

fn handle_key(handle: &str) -> String {
    handle.trim().trim_start_matches('@').to_lowercase()
}

/// Prefer the resolved `@username`; fall back to whatever the caller used.
fn canonical_handle(chat: &Chat, fallback: &str) -> String {
    match chat.username() {
        Some(u) => format!("@{u}"),
        None => fallback.to_string(),
    }
}

fn chat_ref(chat: &Chat) -> ChatRef {
    ChatRef {
        id: chat.id(),
        title: chat.name().map(str::to_owned),
        username: chat.username().map(str::to_owned),
        is_channel: matches!(chat, Chat::Channel(_)),
    }
}

/// Normalize a high-level message into the transport-free shape.
fn incoming(message: &Message, chat_handle: Option<&str>) -> IncomingMessage {
    let chat = message.chat();
    let sender = message.sender();
    let (reply_to_top_id, reply_to_msg_id) = reply_ids(message.raw.reply_to.as_ref());

    IncomingMessage {
        chat_id: chat.id(),
        chat_username: chat
            .username()
            .map(|u| format!("@{u}"))
            .or_else(|| chat_handle.map(str::to_owned)),
        chat_title: chat.name().map(str::to_owned),
        id: i64::from(message.id()),
        text: message.text().to_string(),
        date: message.date(),
        author_id: sender.as_ref().map(|s| s.id()),
        author_username: sender
            .as_ref()
            .and_then(|s| s.username())
            .map(str::to_owned),
        author_full_name: sender.as_ref().and_then(|s| s.name()).map(str::to_owned),
        reply_to_top_id,
        reply_to_msg_id,
    }
}

/// Normalize a raw TL message (the replies RPC yields these).
fn incoming_raw(m: &tl::types::Message, chat_handle: &str, date: DateTime<Utc>) -> IncomingMessage {
    let author_id = match &m.from_id {
        Some(tl::enums::Peer::User(u)) => Some(u.user_id),
        _ => None,
    };
    let (reply_to_top_id, reply_to_msg_id) = reply_ids(m.reply_to.as_ref());

    IncomingMessage {
        chat_id: 0,
        chat_username: Some(chat_handle.to_string()),
        chat_title: None,
        id: i64::from(m.id),
        text: m.message.clone(),
        date,
        author_id,
        author_username: None,
        author_full_name: None,
        reply_to_top_id,
        reply_to_msg_id,
    }
}

fn reply_ids(header: Option<&tl::enums::MessageReplyHeader>) -> (Option<i64>, Option<i64>) {
    match header {
        Some(tl::enums::MessageReplyHeader::MessageReplyHeader(h)) => (
            h.reply_to_top_id.map(i64::from),
            h.reply_to_msg_id.map(i64::from),
        ),
        _ => (None, None),
    }
}

fn is_rpc(err: &InvocationError, name: &str) -> bool {
    matches!(err, InvocationError::Rpc(rpc) if rpc.name == name)
}

/// Sleep out a flood-wait and return, or convert the error and bail.
async fn flood_or_bail(err: InvocationError) -> Result<()> {
    if let InvocationError::Rpc(rpc) = &err {
        if rpc.name == "FLOOD_WAIT" {
            let seconds = rpc.value.unwrap_or(1);
            warn!(seconds, "flood wait, sleeping");
            sleep(Duration::from_secs(u64::from(seconds))).await;
            return Ok(());
        }
        if AUTH_ERRORS.contains(&rpc.name.as_str()) {
            return Err(ClientError::AuthExpired);
        }
        return Err(ClientError::Rpc(rpc.to_string()));
    }
    Err(ClientError::Network(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_key_strips_at_and_case() {
        assert_eq!(handle_key("@PVZ_Zamena"), "pvz_zamena");
        assert_eq!(handle_key(" pvz "), "pvz");
    }
}
