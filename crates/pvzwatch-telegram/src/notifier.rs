use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::types::{InlineKeyboardButton, InlineKeyboardMarkup, LinkPreviewOptions};
use tracing::{error, info};
use url::Url;

use pvzwatch_core::types::{FoundItem, Mode};

/// Delivery of one found item to the user's notification channel.
///
/// Best-effort by contract: implementations report success as `bool` and
/// never propagate transport errors into the pipeline.
#[async_trait]
pub trait Notify: Send + Sync {
    async fn send(&self, item: &FoundItem, item_id: i64) -> bool;

    /// Plain service message (e.g. "session expired, restart the task").
    async fn send_text(&self, text: &str) -> bool;
}

/// Telegram's message limit is 4096 characters; the quoted source text is
/// clipped so the summary lines always fit.
const QUOTE_LIMIT: usize = 3000;

/// Bot-API notifier: plain-text summary plus inline buttons whose callback
/// payloads (`check_blacklist:<id>` / `ignore:<id>`) are handled by the
/// external bot host.
pub struct BotNotifier {
    bot: Bot,
    chat_id: ChatId,
}

impl BotNotifier {
    pub fn new(bot_token: &str, chat_id: i64) -> Self {
        Self {
            bot: Bot::new(bot_token),
            chat_id: ChatId(chat_id),
        }
    }
}

#[async_trait]
impl Notify for BotNotifier {
    async fn send(&self, item: &FoundItem, item_id: i64) -> bool {
        let text = format_notification(item);
        let keyboard = build_keyboard(item, item_id);

        let result = self
            .bot
            .send_message(self.chat_id, text)
            .reply_markup(keyboard)
            .link_preview_options(LinkPreviewOptions {
                is_disabled: true,
                url: None,
                prefer_small_media: false,
                prefer_large_media: false,
                show_above_text: false,
            })
            .await;

        match result {
            Ok(_) => {
                info!(item_id, "notification sent");
                true
            }
            Err(e) => {
                error!(item_id, error = %e, "notification failed");
                false
            }
        }
    }

    async fn send_text(&self, text: &str) -> bool {
        match self.bot.send_message(self.chat_id, text).await {
            Ok(_) => true,
            Err(e) => {
                error!(error = %e, "service message failed");
                false
            }
        }
    }
}

/// Plain-text notification body: header, key fields, author, chat, link and
/// the full original text.
pub fn format_notification(item: &FoundItem) -> String {
    let header = match item.mode {
        Mode::Worker => "👷 Новый работник!",
        Mode::Employer => "🏢 Новая вакансия!",
    };
    let price_label = match item.mode {
        Mode::Worker => "💰 Цена:",
        Mode::Employer => "💰 Оплата:",
    };

    let mut lines = vec![header.to_string(), String::new()];
    lines.push(format!("📅 Дата: {}", item.work_date));
    lines.push(format!("{price_label} {} руб/смену", item.price));

    if let Some(shk) = &item.shk {
        lines.push(format!("📦 ШК: {shk}"));
    }
    if let Some(topic) = &item.topic_name {
        lines.push(format!("🧵 Топик: {topic}"));
    }
    if let Some(location) = &item.location {
        lines.push(format!("📍 Локация: {location}"));
    }
    let mut place = Vec::new();
    if let Some(city) = &item.city {
        place.push(format!("Город: {city}"));
    }
    if let Some(metro) = &item.metro_station {
        place.push(format!("Метро: {metro}"));
    }
    if let Some(district) = &item.district {
        place.push(format!("Район: {district}"));
    }
    if !place.is_empty() {
        lines.push(format!("🏙 {}", place.join(" / ")));
    }

    let mut author = Vec::new();
    if let Some(username) = &item.author_username {
        author.push(format!("@{username}"));
    }
    if let Some(full_name) = &item.author_full_name {
        author.push(format!("({full_name})"));
    }
    if !author.is_empty() {
        lines.push(format!("👤 {}", author.join(" ")));
    }

    lines.push(format!("💬 Чат: {}", item.chat_name));
    lines.push(format!("🔗 {}", item.message_link));
    lines.push(String::new());
    lines.push("📝 Полный текст:".to_string());
    lines.push(format!("\"{}\"", clip(&item.message_text, QUOTE_LIMIT)));

    lines.join("\n")
}

/// Clip to `limit` characters on a char boundary, marking the cut.
fn clip(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let mut clipped: String = text.chars().take(limit).collect();
    clipped.push('…');
    clipped
}

/// A direct link to the author: public profile when the username is known,
/// the `tg://user` deep link when only the numeric id is.
fn author_url(item: &FoundItem) -> Option<Url> {
    if let Some(username) = &item.author_username {
        return Url::parse(&format!("https://t.me/{username}")).ok();
    }
    if let Some(id) = item.author_id {
        return Url::parse(&format!("tg://user?id={id}")).ok();
    }
    None
}

/// Worker items get the blacklist-check button; employer items a contact
/// link. Both get "ignore".
fn build_keyboard(item: &FoundItem, item_id: i64) -> InlineKeyboardMarkup {
    let ignore = InlineKeyboardButton::callback("Игнорировать", format!("ignore:{item_id}"));

    let mut rows: Vec<Vec<InlineKeyboardButton>> = Vec::new();
    match item.mode {
        Mode::Worker => {
            rows.push(vec![InlineKeyboardButton::callback(
                "Отправить на проверку в ЧС",
                format!("check_blacklist:{item_id}"),
            )]);
            if let Some(url) = author_url(item) {
                rows.push(vec![InlineKeyboardButton::url("Написать автору", url)]);
            }
        }
        Mode::Employer => {
            let contact = author_url(item)
                .or_else(|| Url::parse(&item.message_link).ok());
            if let Some(url) = contact {
                rows.push(vec![InlineKeyboardButton::url("Связаться", url)]);
            }
        }
    }
    rows.push(vec![ignore]);
    InlineKeyboardMarkup::new(rows)
}
