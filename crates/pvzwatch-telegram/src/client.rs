use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;

use crate::error::Result;
use crate::types::{ChatRef, IncomingMessage};

/// One user-session MTProto client.
///
/// The trait is the seam between the ingestion pipeline / blacklist search
/// and the wire: production uses [`crate::UserClient`], tests plug in fakes.
/// Every implementation must honor flood-wait signals internally: callers
/// never see them.
#[async_trait]
pub trait MtClient: Send + Sync {
    /// Connect using the configured session file.
    ///
    /// Fails with [`crate::ClientError::AuthExpired`] when the session was
    /// revoked server-side.
    async fn connect(&self) -> Result<()>;

    /// Idempotent; saves the session file best-effort.
    async fn disconnect(&self);

    /// Cheap liveness probe for the reconnect loop.
    async fn check_connection(&self) -> bool;

    /// Enumerate initial dialogs to populate the peer cache; prevents
    /// "peer id invalid" on the first resolve after a fresh session load.
    async fn preload_dialogs(&self) -> Result<()>;

    async fn get_chat(&self, handle: &str) -> Result<ChatRef>;

    /// `topic_id → title` for a forum supergroup; an empty map for a regular
    /// chat (which is not an error).
    async fn forum_topics(&self, handle: &str) -> Result<HashMap<i64, String>>;

    /// Chat history, newest first, until the message timestamp drops below
    /// `since`. Service messages (no text) are skipped.
    fn history(
        &self,
        handle: String,
        since: DateTime<Utc>,
    ) -> BoxStream<'_, Result<IncomingMessage>>;

    /// History of one forum topic via the replies RPC, newest first, bounded
    /// by `since`.
    fn topic_history(
        &self,
        handle: String,
        topic_id: i64,
        since: DateTime<Utc>,
    ) -> BoxStream<'_, Result<IncomingMessage>>;

    /// The few most recent messages of a chat: the polling fallback that
    /// survives silent realtime subscription drops.
    async fn recent_messages(&self, handle: &str, limit: usize) -> Result<Vec<IncomingMessage>>;

    /// Restrict [`Self::next_message`] to this chat set (handles with or
    /// without the leading `@`).
    fn watch(&self, handles: &[String]);

    /// Block until the next realtime text message from a watched chat.
    async fn next_message(&self) -> Result<IncomingMessage>;
}
