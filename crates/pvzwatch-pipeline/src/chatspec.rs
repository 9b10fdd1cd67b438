use std::collections::{HashMap, HashSet};

use tracing::warn;

use pvzwatch_core::types::{canonical_chat_username, CityTag};

/// Parsed chat specification of one task.
///
/// Entry syntax: `@chat`, `@chat/<topic_id>`, `@chat#CITY`,
/// `@chat/<topic_id>#CITY`, CITY ∈ {МСК, СПБ}. An unknown CITY tag is
/// dropped silently (the chat is kept); a non-numeric topic segment is
/// dropped too, leaving the bare chat.
#[derive(Debug, Clone, Default)]
pub struct ChatPlan {
    /// Base handles in request order, first occurrence wins.
    order: Vec<String>,
    /// Empty or absent set ⇒ every topic accepted.
    allowed_topics: HashMap<String, HashSet<i64>>,
    topic_city: HashMap<String, HashMap<i64, CityTag>>,
    chat_city: HashMap<String, CityTag>,
}

impl ChatPlan {
    pub fn parse(entries: &[String]) -> Self {
        let mut plan = ChatPlan::default();

        for raw in entries {
            let entry = raw.trim();
            if entry.is_empty() {
                continue;
            }

            // Peel the optional #CITY suffix.
            let (path, tag) = match entry.split_once('#') {
                Some((path, city)) => match city.trim().parse::<CityTag>() {
                    Ok(tag) => (path.trim(), Some(tag)),
                    Err(_) => {
                        warn!(entry, city, "unknown city tag dropped");
                        (path.trim(), None)
                    }
                },
                None => (entry, None),
            };

            // Peel the optional /topic_id segment.
            let (base, topic) = match path.split_once('/') {
                Some((base, topic_raw)) => match topic_raw.trim().parse::<i64>() {
                    Ok(id) => (base.trim(), Some(id)),
                    Err(_) => {
                        // Non-forum chats written as @chat/xyz fall back to
                        // the whole chat.
                        warn!(entry, "non-numeric topic segment dropped");
                        (base.trim(), None)
                    }
                },
                None => (path, None),
            };
            if base.is_empty() {
                continue;
            }

            let chat = canonical_chat_username(base);
            if !plan.order.contains(&chat) {
                plan.order.push(chat.clone());
            }

            match topic {
                Some(topic_id) => {
                    plan.allowed_topics
                        .entry(chat.clone())
                        .or_default()
                        .insert(topic_id);
                    if let Some(tag) = tag {
                        plan.topic_city
                            .entry(chat)
                            .or_default()
                            .insert(topic_id, tag);
                    }
                }
                None => {
                    if let Some(tag) = tag {
                        plan.chat_city.insert(chat, tag);
                    }
                }
            }
        }

        plan
    }

    /// Base chat handles in the order they were specified.
    pub fn base_handles(&self) -> &[String] {
        &self.order
    }

    /// Topic gate: with a non-empty allowed set, only listed topics pass -
    /// including messages with no topic at all, which are dropped.
    pub fn topic_allowed(&self, chat: &str, topic: Option<i64>) -> bool {
        match self.allowed_topics.get(chat) {
            None => true,
            Some(set) if set.is_empty() => true,
            Some(set) => topic.map(|t| set.contains(&t)).unwrap_or(false),
        }
    }

    /// Explicit city label for a message: per-topic tag first, then the
    /// whole-chat override.
    pub fn city_tag(&self, chat: &str, topic: Option<i64>) -> Option<CityTag> {
        if let Some(topic_id) = topic {
            if let Some(tag) = self.topic_city.get(chat).and_then(|m| m.get(&topic_id)) {
                return Some(*tag);
            }
        }
        self.chat_city.get(chat).copied()
    }

    /// Does this chat restrict topics at all?
    pub fn is_topic_restricted(&self, chat: &str) -> bool {
        self.allowed_topics
            .get(chat)
            .map(|s| !s.is_empty())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(entries: &[&str]) -> ChatPlan {
        ChatPlan::parse(&entries.iter().map(|s| s.to_string()).collect::<Vec<_>>())
    }

    #[test]
    fn bare_chat_accepts_every_topic() {
        let p = plan(&["@pvz_workers"]);
        assert_eq!(p.base_handles(), ["@pvz_workers"]);
        assert!(p.topic_allowed("@pvz_workers", None));
        assert!(p.topic_allowed("@pvz_workers", Some(7)));
        assert!(p.city_tag("@pvz_workers", Some(7)).is_none());
    }

    #[test]
    fn topic_entry_restricts_to_listed_topics() {
        let p = plan(&["@pvz_zamena/55", "@pvz_zamena/56"]);
        assert_eq!(p.base_handles(), ["@pvz_zamena"]);
        assert!(p.topic_allowed("@pvz_zamena", Some(55)));
        assert!(p.topic_allowed("@pvz_zamena", Some(56)));
        assert!(!p.topic_allowed("@pvz_zamena", Some(57)));
        assert!(!p.topic_allowed("@pvz_zamena", None));
    }

    #[test]
    fn city_tags_per_topic_and_per_chat() {
        let p = plan(&["@zamena/55#МСК", "@zamena/56#СПБ", "@msk_only#МСК"]);
        assert_eq!(p.city_tag("@zamena", Some(55)), Some(CityTag::Msk));
        assert_eq!(p.city_tag("@zamena", Some(56)), Some(CityTag::Spb));
        assert_eq!(p.city_tag("@zamena", Some(57)), None);
        assert_eq!(p.city_tag("@msk_only", None), Some(CityTag::Msk));
        assert_eq!(p.city_tag("@msk_only", Some(1)), Some(CityTag::Msk));
    }

    #[test]
    fn unknown_city_tag_keeps_the_chat() {
        let p = plan(&["@chat#ЕКБ"]);
        assert_eq!(p.base_handles(), ["@chat"]);
        assert!(p.city_tag("@chat", None).is_none());
    }

    #[test]
    fn non_numeric_topic_falls_back_to_whole_chat() {
        let p = plan(&["@chat/general"]);
        assert_eq!(p.base_handles(), ["@chat"]);
        assert!(p.topic_allowed("@chat", Some(5)));
        assert!(!p.is_topic_restricted("@chat"));
    }

    #[test]
    fn handles_are_canonicalized() {
        let p = plan(&["PVZ_Chat/10"]);
        assert_eq!(p.base_handles(), ["@pvz_chat"]);
        assert!(p.topic_allowed("@pvz_chat", Some(10)));
    }
}
