use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Default history window when a start request does not specify one.
pub const DEFAULT_PARSE_HISTORY_DAYS: u32 = 3;
/// How often the wait loop verifies the realtime connection (seconds).
pub const CONNECTION_CHECK_SECS: u64 = 30;
/// Sleep between a disconnect and the reconnect attempt (seconds).
pub const RECONNECT_DELAY_SECS: u64 = 2;
/// Sleep after a failed reconnect before trying again (seconds).
pub const RECONNECT_RETRY_SECS: u64 = 10;
/// Found items older than this many days are swept by the cleanup loop.
pub const ITEM_TTL_DAYS: u32 = 30;
/// Terminal in-memory task entries older than this are swept (hours).
pub const TASK_TTL_HOURS: i64 = 24;

/// Environment keys recognized by [`WatchConfig::load`].
const ENV_KEYS: &[&str] = &[
    "API_ID",
    "API_HASH",
    "BOT_TOKEN",
    "HOST",
    "PORT",
    "DB_PATH",
    "LOG_PATH",
    "SESSION_PATH",
    "BLACKLIST_SESSION_PATH",
    "PARSE_HISTORY_DAYS",
    "BLACKLIST_CHAT",
];

/// Top-level config (pvzwatch.toml + plain env overrides).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchConfig {
    /// Telegram API credentials for the MTProto user sessions.
    #[serde(default)]
    pub api_id: i32,
    #[serde(default)]
    pub api_hash: String,
    /// Bot API token used by the notifier.
    #[serde(default)]
    pub bot_token: String,

    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_db_path")]
    pub db_path: String,
    /// When set, tracing also writes to a daily-rolled file at this path.
    #[serde(default)]
    pub log_path: Option<String>,

    /// Default parser session file; a start request may override per task.
    #[serde(default = "default_session_path")]
    pub session_path: String,
    /// Dedicated session for blacklist searches: never shared with a parser.
    #[serde(default = "default_blacklist_session_path")]
    pub blacklist_session_path: String,

    #[serde(default = "default_parse_history_days")]
    pub parse_history_days: u32,

    /// Seeded into the blacklist chat registry on first startup.
    #[serde(default = "default_blacklist_chat")]
    pub blacklist_chat: String,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            api_id: 0,
            api_hash: String::new(),
            bot_token: String::new(),
            host: default_host(),
            port: default_port(),
            db_path: default_db_path(),
            log_path: None,
            session_path: default_session_path(),
            blacklist_session_path: default_blacklist_session_path(),
            parse_history_days: default_parse_history_days(),
            blacklist_chat: default_blacklist_chat(),
        }
    }
}

impl WatchConfig {
    /// Load config from a TOML file with plain env var overrides
    /// (API_ID, API_HASH, BOT_TOKEN, HOST, PORT, DB_PATH, LOG_PATH,
    /// SESSION_PATH, BLACKLIST_SESSION_PATH, PARSE_HISTORY_DAYS,
    /// BLACKLIST_CHAT).
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path.unwrap_or("pvzwatch.toml");

        let config: WatchConfig = Figment::new()
            .merge(Toml::file(path))
            .merge(
                Env::raw()
                    .only(ENV_KEYS)
                    .map(|key| key.as_str().to_lowercase().into()),
            )
            .extract()
            .map_err(|e| crate::error::CoreError::Config(e.to_string()))?;

        Ok(config)
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8002
}
fn default_db_path() -> String {
    "pvzwatch.db".to_string()
}
fn default_session_path() -> String {
    "workers_session".to_string()
}
fn default_blacklist_session_path() -> String {
    "blacklist_session".to_string()
}
fn default_parse_history_days() -> u32 {
    DEFAULT_PARSE_HISTORY_DAYS
}
fn default_blacklist_chat() -> String {
    "@Blacklist_pvz".to_string()
}
