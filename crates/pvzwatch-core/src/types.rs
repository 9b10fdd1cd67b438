use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Which side of the shift marketplace a task (or a classified message)
/// belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Worker,
    Employer,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Worker => write!(f, "worker"),
            Mode::Employer => write!(f, "employer"),
        }
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "worker" => Ok(Mode::Worker),
            "employer" => Ok(Mode::Employer),
            other => Err(format!("unknown mode: {other}")),
        }
    }
}

/// City restriction on a task. `All` disables city gating entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum CityFilter {
    #[serde(rename = "МСК")]
    Msk,
    #[serde(rename = "СПБ")]
    Spb,
    #[serde(rename = "ALL")]
    #[default]
    All,
}

impl fmt::Display for CityFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CityFilter::Msk => write!(f, "МСК"),
            CityFilter::Spb => write!(f, "СПБ"),
            CityFilter::All => write!(f, "ALL"),
        }
    }
}

impl FromStr for CityFilter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "МСК" | "мск" | "MSK" => Ok(CityFilter::Msk),
            "СПБ" | "спб" | "SPB" => Ok(CityFilter::Spb),
            "ALL" | "all" => Ok(CityFilter::All),
            other => Err(format!("unknown city filter: {other}")),
        }
    }
}

/// A per-topic or per-chat city label from the chat specification
/// (`@chat#МСК`, `@chat/17#СПБ`). Unlike [`CityFilter`] there is no `All`:
/// an absent tag means "no label".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CityTag {
    Msk,
    Spb,
}

impl CityTag {
    /// Does a message carrying this tag pass the given task filter?
    pub fn passes(self, filter: CityFilter) -> bool {
        match (self, filter) {
            (_, CityFilter::All) => true,
            (CityTag::Msk, CityFilter::Msk) => true,
            (CityTag::Spb, CityFilter::Spb) => true,
            _ => false,
        }
    }
}

impl FromStr for CityTag {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "МСК" | "мск" | "MSK" => Ok(CityTag::Msk),
            "СПБ" | "спб" | "SPB" => Ok(CityTag::Spb),
            other => Err(format!("unknown city tag: {other}")),
        }
    }
}

/// Task lifecycle: pending → running → (stopped | auth_error | failed).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Stopped,
    AuthError,
    Failed,
}

impl TaskStatus {
    /// Terminal statuses are eligible for the 24 h in-memory sweep.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Stopped | TaskStatus::AuthError | TaskStatus::Failed
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Stopped => "stopped",
            TaskStatus::AuthError => "auth_error",
            TaskStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "stopped" => Ok(TaskStatus::Stopped),
            "auth_error" => Ok(TaskStatus::AuthError),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// The business filter attached to a task.
///
/// `shk_filter` is compared case-insensitively against the extracted barcode
/// tag; the literal value "любое" accepts everything.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskFilters {
    pub date_from: NaiveDate,
    pub date_to: NaiveDate,
    pub min_price: i64,
    pub max_price: i64,
    pub shk_filter: String,
    #[serde(default)]
    pub city_filter: CityFilter,
}

/// A user-scoped, long-running monitoring job over a fixed chat set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: Uuid,
    pub user_id: i64,
    pub mode: Mode,
    /// Raw chat specification entries (`@chat`, `@chat/17`, `@chat#МСК`, …).
    pub chats: Vec<String>,
    pub filters: TaskFilters,
    pub notification_chat_id: i64,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub session_path: Option<String>,
    pub blacklist_session_path: Option<String>,
}

/// One accepted posting, as persisted.
///
/// Never mutated after insert except the `notified` flag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FoundItem {
    pub id: Option<i64>,
    pub task_id: Uuid,
    pub mode: Mode,
    pub author_username: Option<String>,
    pub author_full_name: Option<String>,
    /// Stable numeric Telegram id, survives renames.
    pub author_id: Option<i64>,
    /// The date the work is offered/sought (not the message date).
    pub work_date: NaiveDate,
    pub price: i64,
    /// Barcode-volume tag: a number, a range "A-B", or мало/много/средне.
    pub shk: Option<String>,
    pub location: Option<String>,
    pub city: Option<String>,
    pub metro_station: Option<String>,
    pub district: Option<String>,
    pub message_text: String,
    pub message_link: String,
    pub chat_name: String,
    pub topic_id: Option<i64>,
    pub topic_name: Option<String>,
    /// Source clock.
    pub message_date: DateTime<Utc>,
    /// Local ingest clock; drives the TTL sweep and the dedup windows.
    pub found_at: DateTime<Utc>,
    pub notified: bool,
    pub content_hash: Option<String>,
}

/// Live counters for a running task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStats {
    pub total_messages_scanned: u64,
    pub items_found: u64,
    pub notifications_sent: u64,
    pub last_update: DateTime<Utc>,
}

/// A registered blacklist source: a whole chat (`topic_id = None`) or a
/// single forum topic within it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlacklistChat {
    /// Canonical form: lowercased, `@`-prefixed.
    pub chat_username: String,
    pub chat_title: Option<String>,
    pub topic_id: Option<i64>,
    pub topic_name: Option<String>,
    pub is_active: bool,
    pub added_at: Option<String>,
}

/// Normalize a chat username to the canonical registry form.
pub fn canonical_chat_username(raw: &str) -> String {
    let lower = raw.trim().to_lowercase();
    if lower.starts_with('@') {
        lower
    } else {
        format!("@{lower}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trip() {
        for s in [
            TaskStatus::Pending,
            TaskStatus::Running,
            TaskStatus::Stopped,
            TaskStatus::AuthError,
            TaskStatus::Failed,
        ] {
            assert_eq!(s.to_string().parse::<TaskStatus>().unwrap(), s);
        }
    }

    #[test]
    fn city_filter_serde_uses_cyrillic_labels() {
        let json = serde_json::to_string(&CityFilter::Msk).unwrap();
        assert_eq!(json, "\"МСК\"");
        let back: CityFilter = serde_json::from_str("\"СПБ\"").unwrap();
        assert_eq!(back, CityFilter::Spb);
    }

    #[test]
    fn city_tag_passes_matrix() {
        assert!(CityTag::Msk.passes(CityFilter::All));
        assert!(CityTag::Msk.passes(CityFilter::Msk));
        assert!(!CityTag::Msk.passes(CityFilter::Spb));
        assert!(CityTag::Spb.passes(CityFilter::Spb));
        assert!(!CityTag::Spb.passes(CityFilter::Msk));
    }

    #[test]
    fn canonical_username_prefixes_and_lowercases() {
        assert_eq!(canonical_chat_username("Blacklist_PVZ"), "@blacklist_pvz");
        assert_eq!(canonical_chat_username("@already"), "@already");
    }
}
