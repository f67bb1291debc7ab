//! # SQLite persistence
//!
//! One `SqliteStore` implements every repository port. Timestamps are stored
//! as INTEGER unix milliseconds so range predicates compare numerically.

mod images;
mod posts;
mod tokens;

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use domains::RepoError;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use tracing::info;

pub use images::SqliteAllocation;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS images (
        sha1         TEXT PRIMARY KEY NOT NULL,
        size         INTEGER NOT NULL CHECK (size > 0),
        file_type    TEXT NOT NULL,
        thumb_type   TEXT NOT NULL,
        has_video    INTEGER NOT NULL,
        has_audio    INTEGER NOT NULL,
        length       INTEGER NOT NULL,
        title        TEXT NOT NULL,
        md5          TEXT,
        artist       TEXT,
        src_width    INTEGER NOT NULL,
        src_height   INTEGER NOT NULL,
        thumb_width  INTEGER NOT NULL,
        thumb_height INTEGER NOT NULL,
        created_at   INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS image_tokens (
        token      TEXT PRIMARY KEY NOT NULL,
        sha1       TEXT NOT NULL REFERENCES images (sha1) ON DELETE CASCADE,
        expires_at INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS image_tokens_sha1 ON image_tokens (sha1)",
    "CREATE TABLE IF NOT EXISTS post_tokens (
        token      TEXT PRIMARY KEY NOT NULL,
        ip         TEXT NOT NULL,
        expires_at INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS post_tokens_ip ON post_tokens (ip)",
    "CREATE TABLE IF NOT EXISTS sessions (
        token      TEXT PRIMARY KEY NOT NULL,
        user_id    TEXT NOT NULL,
        expires_at INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS sessions_user ON sessions (user_id)",
    "CREATE TABLE IF NOT EXISTS posts (
        id         INTEGER PRIMARY KEY AUTOINCREMENT,
        op         INTEGER NOT NULL,
        ip         TEXT,
        body       TEXT NOT NULL,
        commands   BLOB NOT NULL,
        created_at INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS posts_ip ON posts (ip, created_at)",
    "CREATE TABLE IF NOT EXISTS post_files (
        post_id  INTEGER NOT NULL REFERENCES posts (id) ON DELETE CASCADE,
        position INTEGER NOT NULL,
        sha1     TEXT NOT NULL REFERENCES images (sha1),
        PRIMARY KEY (post_id, position)
    )",
    "CREATE INDEX IF NOT EXISTS post_files_sha1 ON post_files (sha1)",
    "CREATE TABLE IF NOT EXISTS bans (
        ip         TEXT PRIMARY KEY NOT NULL,
        reason     TEXT NOT NULL,
        expires_at INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS idols (
        id      TEXT PRIMARY KEY NOT NULL,
        preview TEXT REFERENCES images (sha1)
    )",
];

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Opens (creating if missing) the database at `url` and applies the
    /// schema. In-memory databases are per connection, so they always get a
    /// single-connection pool.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, RepoError> {
        let in_memory = url.contains(":memory:") || url.contains("mode=memory");
        let opts = SqliteConnectOptions::from_str(url)
            .map_err(backend)?
            .create_if_missing(true)
            .journal_mode(if in_memory {
                SqliteJournalMode::Memory
            } else {
                SqliteJournalMode::Wal
            })
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { max_connections.max(1) })
            .connect_with(opts)
            .await
            .map_err(backend)?;

        let store = Self { pool };
        store.migrate().await?;
        info!(url, "database ready");
        Ok(store)
    }

    pub async fn in_memory() -> Result<Self, RepoError> {
        Self::connect("sqlite::memory:", 1).await
    }

    async fn migrate(&self) -> Result<(), RepoError> {
        for stmt in SCHEMA {
            sqlx::query(stmt).execute(&self.pool).await.map_err(map_err)?;
        }
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn backend<E: std::fmt::Display>(e: E) -> RepoError {
    RepoError::Backend(e.to_string())
}

pub(crate) fn map_err(e: sqlx::Error) -> RepoError {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => RepoError::Conflict,
        sqlx::Error::Database(db) if db.is_foreign_key_violation() => {
            RepoError::NotFound("referenced row".into())
        }
        sqlx::Error::RowNotFound => RepoError::NotFound("row".into()),
        _ => backend(e),
    }
}

pub(crate) fn to_millis(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> Result<DateTime<Utc>, RepoError> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| RepoError::Backend(format!("timestamp out of range: {ms}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn schema_is_idempotent() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.migrate().await.unwrap();
        let tables: Vec<String> =
            sqlx::query_scalar("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
                .fetch_all(store.pool())
                .await
                .unwrap();
        for t in ["bans", "idols", "image_tokens", "images", "post_files", "post_tokens", "posts", "sessions"] {
            assert!(tables.iter().any(|n| n == t), "missing table {t}");
        }
    }

    #[tokio::test]
    async fn file_database_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("cutechan.db").display());
        SqliteStore::connect(&url, 4).await.unwrap();
        assert!(dir.path().join("cutechan.db").exists());
    }
}
