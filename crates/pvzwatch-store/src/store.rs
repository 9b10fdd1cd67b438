use std::str::FromStr;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, NaiveDate, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use pvzwatch_core::types::{
    canonical_chat_username, BlacklistChat, FoundItem, Task, TaskStatus,
};

use crate::db::init_db;
use crate::error::{Result, StoreError};

/// Both dedup checks look back this far.
pub const DEDUP_WINDOW_HOURS: i64 = 24;

/// Aggregate database metrics for `/admin/stats`.
#[derive(Debug, Clone, Serialize)]
pub struct DbStats {
    pub tasks_count: i64,
    pub found_items_count: i64,
    pub blacklist_cache_count: i64,
    pub blacklist_chats_count: i64,
    pub oldest_found_item: Option<String>,
    pub newest_found_item: Option<String>,
}

/// Handle to the single-file SQLite store.
///
/// Cheap to clone; writers serialise on the inner mutex, which also covers
/// SQLite's own locking for the multi-statement add-item path.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (or create) the database file and bring the schema up to date.
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        init_db(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        init_db(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    // --- tasks -------------------------------------------------------------

    /// Insert a new task row. Fails if the id is already present.
    pub fn create_task(&self, task: &Task) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let result = conn.execute(
            "INSERT INTO tasks
             (task_id, user_id, mode, chats, filters, notification_chat_id,
              status, created_at, stopped_at, session_path, blacklist_session_path)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)",
            rusqlite::params![
                task.task_id.to_string(),
                task.user_id,
                task.mode.to_string(),
                serde_json::to_string(&task.chats)?,
                serde_json::to_string(&task.filters)?,
                task.notification_chat_id,
                task.status.to_string(),
                task.created_at.to_rfc3339(),
                task.stopped_at.map(|t| t.to_rfc3339()),
                task.session_path,
                task.blacklist_session_path,
            ],
        );
        match result {
            Ok(_) => {
                info!(task_id = %task.task_id, "task created");
                Ok(())
            }
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(StoreError::TaskExists { id: task.task_id })
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn get_task(&self, task_id: Uuid) -> Result<Option<Task>> {
        let conn = self.conn.lock().unwrap();
        let raw = conn
            .query_row(
                "SELECT task_id, user_id, mode, chats, filters, notification_chat_id,
                        status, created_at, stopped_at, session_path, blacklist_session_path
                 FROM tasks WHERE task_id = ?1",
                [task_id.to_string()],
                raw_task,
            )
            .optional()?;
        raw.map(task_from_raw).transpose()
    }

    pub fn tasks_by_status(&self, status: TaskStatus) -> Result<Vec<Task>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT task_id, user_id, mode, chats, filters, notification_chat_id,
                    status, created_at, stopped_at, session_path, blacklist_session_path
             FROM tasks WHERE status = ?1",
        )?;
        let rows: Vec<RawTask> = stmt
            .query_map([status.to_string()], raw_task)?
            .collect::<rusqlite::Result<_>>()?;
        rows.into_iter().map(task_from_raw).collect()
    }

    /// Idempotent last-writer-wins status update.
    pub fn update_task_status(
        &self,
        task_id: Uuid,
        status: TaskStatus,
        stopped_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        match stopped_at {
            Some(at) => conn.execute(
                "UPDATE tasks SET status = ?1, stopped_at = ?2 WHERE task_id = ?3",
                rusqlite::params![status.to_string(), at.to_rfc3339(), task_id.to_string()],
            )?,
            None => conn.execute(
                "UPDATE tasks SET status = ?1 WHERE task_id = ?2",
                rusqlite::params![status.to_string(), task_id.to_string()],
            )?,
        };
        info!(task_id = %task_id, status = %status, "task status updated");
        Ok(())
    }

    // --- found items & dedup -----------------------------------------------

    /// Level-1 check: a row with this content hash, this task and the *same*
    /// work date inside the window is a duplicate. Same hash with a different
    /// work date is an updated announcement, not a duplicate.
    pub fn check_content_duplicate(
        &self,
        content_hash: &str,
        work_date: NaiveDate,
        task_id: Uuid,
        hours_window: i64,
    ) -> Result<bool> {
        let threshold = (Utc::now() - Duration::hours(hours_window)).to_rfc3339();
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(
            "SELECT date FROM found_items
             WHERE content_hash = ?1 AND task_id = ?2 AND found_at > ?3",
        )?;
        let dates: Vec<String> = stmt
            .query_map(
                rusqlite::params![content_hash, task_id.to_string(), threshold],
                |row| row.get(0),
            )?
            .collect::<rusqlite::Result<_>>()?;
        Ok(dates.iter().any(|d| d == &work_date.to_string()))
    }

    /// Level-2 check on (author, work date, price). A null author means the
    /// check cannot apply and the item passes.
    pub fn check_author_duplicate(
        &self,
        author_username: &str,
        work_date: NaiveDate,
        price: i64,
        task_id: Uuid,
        hours_window: i64,
    ) -> Result<bool> {
        let threshold = (Utc::now() - Duration::hours(hours_window)).to_rfc3339();
        let conn = self.conn.lock().unwrap();
        let hit: Option<i64> = conn
            .query_row(
                "SELECT id FROM found_items
                 WHERE author_username = ?1 AND date = ?2 AND price = ?3
                   AND task_id = ?4 AND found_at > ?5
                 LIMIT 1",
                rusqlite::params![
                    author_username,
                    work_date.to_string(),
                    price,
                    task_id.to_string(),
                    threshold
                ],
                |row| row.get(0),
            )
            .optional()?;
        Ok(hit.is_some())
    }

    /// Insert an accepted item, running both dedup checks first.
    ///
    /// Returns `None` when the item is rejected as a duplicate: by either
    /// check or by the `(task_id, message_link)` unique constraint.
    pub fn add_found_item(&self, item: &FoundItem) -> Result<Option<i64>> {
        if let Some(hash) = &item.content_hash {
            if self.check_content_duplicate(hash, item.work_date, item.task_id, DEDUP_WINDOW_HOURS)?
            {
                debug!(hash = %&hash[..8.min(hash.len())], date = %item.work_date, "content duplicate rejected");
                return Ok(None);
            }
        }
        if let Some(author) = &item.author_username {
            if self.check_author_duplicate(
                author,
                item.work_date,
                item.price,
                item.task_id,
                DEDUP_WINDOW_HOURS,
            )? {
                debug!(author, date = %item.work_date, price = item.price, "author duplicate rejected");
                return Ok(None);
            }
        }

        let conn = self.conn.lock().unwrap();
        let result = conn.execute(
            "INSERT INTO found_items
             (task_id, mode, author_username, author_full_name, author_id,
              date, price, shk, location, city, metro_station, district,
              message_text, message_link, chat_name, topic_id, topic_name,
              message_date, found_at, notified, content_hash)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20,?21)",
            rusqlite::params![
                item.task_id.to_string(),
                item.mode.to_string(),
                item.author_username,
                item.author_full_name,
                item.author_id,
                item.work_date.to_string(),
                item.price,
                item.shk,
                item.location,
                item.city,
                item.metro_station,
                item.district,
                item.message_text,
                item.message_link,
                item.chat_name,
                item.topic_id,
                item.topic_name,
                item.message_date.to_rfc3339(),
                item.found_at.to_rfc3339(),
                item.notified,
                item.content_hash,
            ],
        );
        match result {
            Ok(_) => {
                let id = conn.last_insert_rowid();
                info!(id, link = %item.message_link, "found item stored");
                Ok(Some(id))
            }
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                debug!(link = %item.message_link, "permalink duplicate rejected");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Newest first.
    pub fn list_found_items(&self, task_id: Uuid, limit: u32) -> Result<Vec<FoundItem>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {ITEM_COLUMNS} FROM found_items
             WHERE task_id = ?1 ORDER BY found_at DESC LIMIT ?2"
        ))?;
        let rows: Vec<RawItem> = stmt
            .query_map(rusqlite::params![task_id.to_string(), limit], raw_item)?
            .collect::<rusqlite::Result<_>>()?;
        rows.into_iter().map(item_from_raw).collect()
    }

    pub fn get_found_item(&self, item_id: i64) -> Result<Option<FoundItem>> {
        let conn = self.conn.lock().unwrap();
        let raw = conn
            .query_row(
                &format!("SELECT {ITEM_COLUMNS} FROM found_items WHERE id = ?1"),
                [item_id],
                raw_item,
            )
            .optional()?;
        raw.map(item_from_raw).transpose()
    }

    pub fn mark_notified(&self, item_id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("UPDATE found_items SET notified = 1 WHERE id = ?1", [item_id])?;
        Ok(())
    }

    pub fn count_items(&self, task_id: Uuid) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM found_items WHERE task_id = ?1",
            [task_id.to_string()],
            |row| row.get(0),
        )?)
    }

    pub fn count_notified(&self, task_id: Uuid) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM found_items WHERE task_id = ?1 AND notified = 1",
            [task_id.to_string()],
            |row| row.get(0),
        )?)
    }

    /// Recover the blacklist session path of the task that found an item.
    pub fn blacklist_session_for_item(&self, item_id: i64) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        Ok(conn
            .query_row(
                "SELECT t.blacklist_session_path
                 FROM found_items fi JOIN tasks t ON fi.task_id = t.task_id
                 WHERE fi.id = ?1",
                [item_id],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()?
            .flatten())
    }

    // --- blacklist chat registry -------------------------------------------

    pub fn list_blacklist_chats(&self, active_only: bool) -> Result<Vec<BlacklistChat>> {
        let conn = self.conn.lock().unwrap();
        let sql = if active_only {
            "SELECT chat_username, chat_title, topic_id, topic_name, is_active, added_at
             FROM blacklist_chats WHERE is_active = 1 ORDER BY added_at"
        } else {
            "SELECT chat_username, chat_title, topic_id, topic_name, is_active, added_at
             FROM blacklist_chats ORDER BY added_at"
        };
        let mut stmt = conn.prepare(sql)?;
        let chats = stmt
            .query_map([], |row| {
                Ok(BlacklistChat {
                    chat_username: row.get(0)?,
                    chat_title: row.get(1)?,
                    topic_id: row.get(2)?,
                    topic_name: row.get(3)?,
                    is_active: row.get(4)?,
                    added_at: row.get(5)?,
                })
            })?
            .collect::<rusqlite::Result<_>>()?;
        Ok(chats)
    }

    /// Full registry replacement. Returns the number of entries written.
    pub fn sync_blacklist_chats(&self, chats: &[BlacklistChat]) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM blacklist_chats", [])?;
        let now = Utc::now().to_rfc3339();
        let mut count = 0;
        for entry in chats {
            let username = canonical_chat_username(&entry.chat_username);
            conn.execute(
                "INSERT OR IGNORE INTO blacklist_chats
                 (chat_username, chat_title, added_at, is_active, topic_id, topic_name)
                 VALUES (?1, ?2, ?3, 1, ?4, ?5)",
                rusqlite::params![username, entry.chat_title, now, entry.topic_id, entry.topic_name],
            )?;
            count += 1;
        }
        info!(count, "blacklist chats synced");
        Ok(count)
    }

    /// Add a registry entry, or re-activate it when it already exists.
    pub fn add_blacklist_chat(
        &self,
        chat_username: &str,
        chat_title: Option<&str>,
        topic_id: Option<i64>,
        topic_name: Option<&str>,
    ) -> Result<bool> {
        let username = canonical_chat_username(chat_username);
        let conn = self.conn.lock().unwrap();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO blacklist_chats
             (chat_username, chat_title, added_at, is_active, topic_id, topic_name)
             VALUES (?1, ?2, ?3, 1, ?4, ?5)",
            rusqlite::params![username, chat_title, Utc::now().to_rfc3339(), topic_id, topic_name],
        )?;
        if inserted == 0 {
            match topic_id {
                Some(t) => conn.execute(
                    "UPDATE blacklist_chats SET is_active = 1
                     WHERE chat_username = ?1 AND topic_id = ?2",
                    rusqlite::params![username, t],
                )?,
                None => conn.execute(
                    "UPDATE blacklist_chats SET is_active = 1
                     WHERE chat_username = ?1 AND topic_id IS NULL",
                    [&username],
                )?,
            };
            info!(chat = %username, "blacklist chat re-activated");
        } else {
            info!(chat = %username, ?topic_id, "blacklist chat added");
        }
        Ok(true)
    }

    /// Soft delete. Returns false when no matching row exists.
    pub fn remove_blacklist_chat(&self, chat_username: &str, topic_id: Option<i64>) -> Result<bool> {
        let username = canonical_chat_username(chat_username);
        let conn = self.conn.lock().unwrap();
        let changed = match topic_id {
            Some(t) => conn.execute(
                "UPDATE blacklist_chats SET is_active = 0
                 WHERE chat_username = ?1 AND topic_id = ?2",
                rusqlite::params![username, t],
            )?,
            None => conn.execute(
                "UPDATE blacklist_chats SET is_active = 0
                 WHERE chat_username = ?1 AND topic_id IS NULL",
                [&username],
            )?,
        };
        if changed > 0 {
            info!(chat = %username, "blacklist chat deactivated");
        }
        Ok(changed > 0)
    }

    /// Seed the default blacklist chat on first startup.
    pub fn seed_blacklist_chat(&self, chat_username: &str, chat_title: Option<&str>) -> Result<()> {
        let username = canonical_chat_username(chat_username);
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR IGNORE INTO blacklist_chats
             (chat_username, chat_title, added_at, is_active)
             VALUES (?1, ?2, ?3, 1)",
            rusqlite::params![username, chat_title, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    // --- cleanup & stats ---------------------------------------------------

    /// Delete found items older than `days`. Returns the number removed.
    pub fn cleanup_old_items(&self, days: u32) -> Result<usize> {
        let threshold = (Utc::now() - Duration::days(i64::from(days))).to_rfc3339();
        let conn = self.conn.lock().unwrap();
        let deleted = conn.execute("DELETE FROM found_items WHERE found_at < ?1", [&threshold])?;
        if deleted > 0 {
            info!(deleted, days, "old found items removed");
        } else {
            debug!(days, "no found items older than the TTL");
        }
        Ok(deleted)
    }

    pub fn db_stats(&self) -> Result<DbStats> {
        let conn = self.conn.lock().unwrap();
        let count = |table: &str| -> rusqlite::Result<i64> {
            conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
        };
        Ok(DbStats {
            tasks_count: count("tasks")?,
            found_items_count: count("found_items")?,
            blacklist_cache_count: count("blacklist_cache")?,
            blacklist_chats_count: count("blacklist_chats")?,
            oldest_found_item: conn.query_row(
                "SELECT MIN(found_at) FROM found_items",
                [],
                |row| row.get(0),
            )?,
            newest_found_item: conn.query_row(
                "SELECT MAX(found_at) FROM found_items",
                [],
                |row| row.get(0),
            )?,
        })
    }
}

// --- row mapping -----------------------------------------------------------

const ITEM_COLUMNS: &str = "id, task_id, mode, author_username, author_full_name, author_id, \
     date, price, shk, location, city, metro_station, district, message_text, \
     message_link, chat_name, topic_id, topic_name, message_date, found_at, \
     notified, content_hash";

type RawTask = (
    String,         // task_id
    i64,            // user_id
    String,         // mode
    String,         // chats JSON
    String,         // filters JSON
    i64,            // notification_chat_id
    String,         // status
    String,         // created_at
    Option<String>, // stopped_at
    Option<String>, // session_path
    Option<String>, // blacklist_session_path
);

fn raw_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawTask> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
        row.get(10)?,
    ))
}

fn task_from_raw(raw: RawTask) -> Result<Task> {
    let (
        task_id,
        user_id,
        mode,
        chats,
        filters,
        notification_chat_id,
        status,
        created_at,
        stopped_at,
        session_path,
        blacklist_session_path,
    ) = raw;
    Ok(Task {
        task_id: Uuid::parse_str(&task_id).map_err(|e| StoreError::Invalid(e.to_string()))?,
        user_id,
        mode: mode.parse().map_err(StoreError::Invalid)?,
        chats: serde_json::from_str(&chats)?,
        filters: serde_json::from_str(&filters)?,
        notification_chat_id,
        status: status.parse().map_err(StoreError::Invalid)?,
        created_at: parse_ts(&created_at)?,
        stopped_at: stopped_at.as_deref().map(parse_ts).transpose()?,
        session_path,
        blacklist_session_path,
    })
}

#[allow(clippy::type_complexity)]
type RawItem = (
    i64,                                            // id
    String,                                         // task_id
    String,                                         // mode
    Option<String>,                                 // author_username
    Option<String>,                                 // author_full_name
    Option<i64>,                                    // author_id
    String,                                         // date
    i64,                                            // price
    Option<String>,                                 // shk
    Option<String>,                                 // location
    (Option<String>, Option<String>, Option<String>), // city, metro, district
    String,                                         // message_text
    String,                                         // message_link
    String,                                         // chat_name
    Option<i64>,                                    // topic_id
    Option<String>,                                 // topic_name
    String,                                         // message_date
    String,                                         // found_at
    bool,                                           // notified
    Option<String>,                                 // content_hash
);

fn raw_item(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawItem> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
        (row.get(10)?, row.get(11)?, row.get(12)?),
        row.get(13)?,
        row.get(14)?,
        row.get(15)?,
        row.get(16)?,
        row.get(17)?,
        row.get(18)?,
        row.get(19)?,
        row.get(20)?,
        row.get(21)?,
    ))
}

fn item_from_raw(raw: RawItem) -> Result<FoundItem> {
    let (
        id,
        task_id,
        mode,
        author_username,
        author_full_name,
        author_id,
        date,
        price,
        shk,
        location,
        (city, metro_station, district),
        message_text,
        message_link,
        chat_name,
        topic_id,
        topic_name,
        message_date,
        found_at,
        notified,
        content_hash,
    ) = raw;
    Ok(FoundItem {
        id: Some(id),
        task_id: Uuid::parse_str(&task_id).map_err(|e| StoreError::Invalid(e.to_string()))?,
        mode: mode.parse().map_err(StoreError::Invalid)?,
        author_username,
        author_full_name,
        author_id,
        work_date: NaiveDate::from_str(&date).map_err(|e| StoreError::Invalid(e.to_string()))?,
        price,
        shk,
        location,
        city,
        metro_station,
        district,
        message_text,
        message_link,
        chat_name,
        topic_id,
        topic_name,
        message_date: parse_ts(&message_date)?,
        found_at: parse_ts(&found_at)?,
        notified,
        content_hash,
    })
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Invalid(format!("bad timestamp {raw}: {e}")))
}
