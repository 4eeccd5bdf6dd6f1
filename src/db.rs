//! SQLite metadata store: connection pool and schema.

use chrono::{DateTime, TimeZone, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS accounts (
        user_id     INTEGER PRIMARY KEY,
        quota_bytes INTEGER NOT NULL,
        used_bytes  INTEGER NOT NULL DEFAULT 0,
        updated_at  INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS trash (
        id            INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id       INTEGER NOT NULL,
        original_name TEXT    NOT NULL,
        original_path TEXT    NOT NULL,
        trash_name    TEXT    NOT NULL,
        file_size     INTEGER NOT NULL,
        is_folder     INTEGER NOT NULL,
        deleted_at    INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS trash_user_deleted ON trash (user_id, deleted_at)",
    r#"
    CREATE TABLE IF NOT EXISTS file_versions (
        id             INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id        INTEGER NOT NULL,
        file_path      TEXT    NOT NULL,
        file_name      TEXT    NOT NULL,
        version_number INTEGER NOT NULL,
        version_path   TEXT    NOT NULL,
        file_size      INTEGER NOT NULL,
        created_at     INTEGER NOT NULL,
        UNIQUE (user_id, file_path, version_number)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS version_counters (
        user_id     INTEGER NOT NULL,
        file_path   TEXT    NOT NULL,
        last_number INTEGER NOT NULL,
        PRIMARY KEY (user_id, file_path)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS favorites (
        id         INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id    INTEGER NOT NULL,
        item_path  TEXT    NOT NULL,
        item_name  TEXT    NOT NULL,
        is_folder  INTEGER NOT NULL,
        created_at INTEGER NOT NULL,
        UNIQUE (user_id, item_path)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS activity_logs (
        id         INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id    INTEGER NOT NULL,
        action     TEXT    NOT NULL,
        item_name  TEXT,
        item_path  TEXT,
        details    TEXT,
        created_at INTEGER NOT NULL
    )
    "#,
];

/// Opens the pool, creating the database file when missing.
pub async fn connect(database_url: &str) -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));
    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(options)
        .await?;
    init_schema(&pool).await?;
    Ok(pool)
}

pub async fn init_schema(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}

pub fn now_ts() -> i64 {
    Utc::now().timestamp()
}

pub fn to_datetime(ts: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(ts, 0).single().unwrap_or_default()
}

/// Single-connection in-memory database for tests.
#[cfg(test)]
pub async fn memory_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .expect("open in-memory sqlite");
    init_schema(&pool).await.expect("schema");
    pool
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn schema_is_idempotent() {
        let pool = memory_pool().await;
        init_schema(&pool).await.expect("second init");
        let tables: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
        )
        .fetch_one(&pool)
        .await
        .expect("count tables");
        assert_eq!(tables, 6);
    }

    #[test]
    fn timestamps_round_trip_to_datetime() {
        let ts = 1_700_000_000;
        assert_eq!(to_datetime(ts).timestamp(), ts);
    }
}
