use rusqlite::Connection;
use tracing::{info, warn};

/// Initialise the schema and apply pending additive migrations.
///
/// Safe to call on every startup: table creation uses `IF NOT EXISTS`, the
/// column ADDs ignore "duplicate column" failures, and the two table
/// rebuilds first inspect the live schema.
pub fn init_db(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS tasks (
            task_id                 TEXT PRIMARY KEY,
            user_id                 INTEGER NOT NULL,
            mode                    TEXT NOT NULL,
            chats                   TEXT NOT NULL,
            filters                 TEXT NOT NULL,
            notification_chat_id    INTEGER NOT NULL,
            status                  TEXT NOT NULL,
            created_at              TEXT NOT NULL,
            stopped_at              TEXT,
            session_path            TEXT,
            blacklist_session_path  TEXT
        );

        CREATE TABLE IF NOT EXISTS found_items (
            id               INTEGER PRIMARY KEY AUTOINCREMENT,
            task_id          TEXT NOT NULL,
            mode             TEXT NOT NULL,
            author_username  TEXT,
            author_full_name TEXT,
            date             TEXT NOT NULL,
            price            INTEGER NOT NULL,
            shk              TEXT,
            location         TEXT,
            message_text     TEXT NOT NULL,
            message_link     TEXT NOT NULL,
            chat_name        TEXT NOT NULL,
            message_date     TEXT NOT NULL,
            found_at         TEXT NOT NULL,
            notified         BOOLEAN DEFAULT 0,
            content_hash     TEXT,
            topic_id         INTEGER,
            topic_name       TEXT,
            city             TEXT,
            metro_station    TEXT,
            district         TEXT,
            author_id        INTEGER,
            UNIQUE(task_id, message_link)
        );

        CREATE TABLE IF NOT EXISTS blacklist_cache (
            id               INTEGER PRIMARY KEY AUTOINCREMENT,
            telegram_user_id INTEGER NOT NULL UNIQUE,
            username         TEXT,
            full_name        TEXT,
            phone            TEXT,
            role             TEXT,
            message_link     TEXT NOT NULL,
            message_id       INTEGER,
            parsed_at        TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_blacklist_user_id
            ON blacklist_cache(telegram_user_id);

        CREATE TABLE IF NOT EXISTS blacklist_chats (
            id            INTEGER PRIMARY KEY AUTOINCREMENT,
            chat_username TEXT NOT NULL,
            chat_title    TEXT,
            added_at      TEXT NOT NULL,
            is_active     BOOLEAN DEFAULT 1,
            topic_id      INTEGER,
            topic_name    TEXT
        );",
    )?;

    // Additive columns for databases created before these fields existed.
    // A failure here means the column is already present.
    for ddl in [
        "ALTER TABLE found_items ADD COLUMN topic_id INTEGER",
        "ALTER TABLE found_items ADD COLUMN topic_name TEXT",
        "ALTER TABLE found_items ADD COLUMN city TEXT",
        "ALTER TABLE found_items ADD COLUMN metro_station TEXT",
        "ALTER TABLE found_items ADD COLUMN district TEXT",
        "ALTER TABLE found_items ADD COLUMN author_id INTEGER",
        "ALTER TABLE tasks ADD COLUMN session_path TEXT",
        "ALTER TABLE tasks ADD COLUMN blacklist_session_path TEXT",
    ] {
        let _ = conn.execute(ddl, []);
    }

    migrate_found_items_unique(conn)?;
    migrate_blacklist_chats_topics(conn)?;

    conn.execute_batch(
        "CREATE INDEX IF NOT EXISTS idx_content_hash
            ON found_items(content_hash, found_at);
         CREATE UNIQUE INDEX IF NOT EXISTS idx_blacklist_chats_unique
            ON blacklist_chats(chat_username, COALESCE(topic_id, -1));",
    )?;

    info!("database schema initialised");
    Ok(())
}

/// Old databases carried `UNIQUE(message_link)`: a second task monitoring
/// the same chats then never saw an item the first task had already found.
/// SQLite cannot alter a constraint in place, so the table is rebuilt.
fn migrate_found_items_unique(conn: &Connection) -> rusqlite::Result<()> {
    let sql: Option<String> = conn
        .query_row(
            "SELECT sql FROM sqlite_master WHERE type='table' AND name='found_items'",
            [],
            |row| row.get(0),
        )
        .unwrap_or(None);

    let needs_rebuild = match sql {
        Some(ref s) => !s.contains("UNIQUE(task_id, message_link)"),
        None => false,
    };
    if !needs_rebuild {
        return Ok(());
    }

    warn!("migrating found_items to UNIQUE(task_id, message_link)");
    conn.execute_batch(
        "BEGIN;
        CREATE TABLE found_items_new (
            id               INTEGER PRIMARY KEY AUTOINCREMENT,
            task_id          TEXT NOT NULL,
            mode             TEXT NOT NULL,
            author_username  TEXT,
            author_full_name TEXT,
            date             TEXT NOT NULL,
            price            INTEGER NOT NULL,
            shk              TEXT,
            location         TEXT,
            message_text     TEXT NOT NULL,
            message_link     TEXT NOT NULL,
            chat_name        TEXT NOT NULL,
            message_date     TEXT NOT NULL,
            found_at         TEXT NOT NULL,
            notified         BOOLEAN DEFAULT 0,
            content_hash     TEXT,
            topic_id         INTEGER,
            topic_name       TEXT,
            city             TEXT,
            metro_station    TEXT,
            district         TEXT,
            author_id        INTEGER,
            UNIQUE(task_id, message_link)
        );
        INSERT INTO found_items_new (
            id, task_id, mode, author_username, author_full_name, date, price,
            shk, location, message_text, message_link, chat_name, message_date,
            found_at, notified, content_hash, topic_id, topic_name, city,
            metro_station, district, author_id)
        SELECT
            id, task_id, mode, author_username, author_full_name, date, price,
            shk, location, message_text, message_link, chat_name, message_date,
            found_at, notified, content_hash, topic_id, topic_name, city,
            metro_station, district, author_id
        FROM found_items;
        DROP TABLE found_items;
        ALTER TABLE found_items_new RENAME TO found_items;
        COMMIT;",
    )
}

/// Old `blacklist_chats` had `UNIQUE(chat_username)` and no topic columns;
/// the constraint cannot be dropped, so the table is rebuilt once.
fn migrate_blacklist_chats_topics(conn: &Connection) -> rusqlite::Result<()> {
    let mut stmt = conn.prepare("PRAGMA table_info(blacklist_chats)")?;
    let columns: Vec<String> = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .filter_map(|r| r.ok())
        .collect();
    drop(stmt);

    if columns.iter().any(|c| c == "topic_id") {
        return Ok(());
    }

    warn!("migrating blacklist_chats to per-topic entries");
    conn.execute_batch(
        "BEGIN;
        CREATE TABLE blacklist_chats_new (
            id            INTEGER PRIMARY KEY AUTOINCREMENT,
            chat_username TEXT NOT NULL,
            chat_title    TEXT,
            added_at      TEXT NOT NULL,
            is_active     BOOLEAN DEFAULT 1,
            topic_id      INTEGER,
            topic_name    TEXT
        );
        INSERT INTO blacklist_chats_new (id, chat_username, chat_title, added_at, is_active)
            SELECT id, chat_username, chat_title, added_at, is_active FROM blacklist_chats;
        DROP TABLE blacklist_chats;
        ALTER TABLE blacklist_chats_new RENAME TO blacklist_chats;
        COMMIT;",
    )
}
