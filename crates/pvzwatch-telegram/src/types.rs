use chrono::{DateTime, Utc};

/// A resolved chat, enough to build links and decide forum handling.
#[derive(Debug, Clone)]
pub struct ChatRef {
    pub id: i64,
    pub title: Option<String>,
    pub username: Option<String>,
    pub is_channel: bool,
}

/// One text message, normalized away from the transport types.
///
/// `reply_to_top_id` is the forum-topic root when the server provides it;
/// `reply_to_msg_id` is the plain reply target. The pipeline derives the
/// actual topic as `reply_to_top_id ?? reply_to_msg_id`.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub chat_id: i64,
    /// Canonical `@handle` when the chat is public.
    pub chat_username: Option<String>,
    pub chat_title: Option<String>,
    pub id: i64,
    pub text: String,
    pub date: DateTime<Utc>,
    pub author_id: Option<i64>,
    pub author_username: Option<String>,
    pub author_full_name: Option<String>,
    pub reply_to_top_id: Option<i64>,
    pub reply_to_msg_id: Option<i64>,
}

impl IncomingMessage {
    /// The chat handle used for routing: `@username` when public, otherwise
    /// the title, otherwise the raw id.
    pub fn chat_handle(&self) -> String {
        if let Some(u) = &self.chat_username {
            u.clone()
        } else if let Some(t) = &self.chat_title {
            t.clone()
        } else {
            self.chat_id.to_string()
        }
    }
}
