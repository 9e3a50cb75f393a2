use anyhow::Result;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    SqlitePool,
};
use std::str::FromStr;
use std::time::Duration;

use super::types::DatabaseError;

// ============================================================================
// Database
// ============================================================================

/// Handle to the follow graph store.
///
/// Cloning is cheap (the pool is reference counted), so scheduler workers
/// each hold their own clone and coordinate only through SQLite.
#[derive(Clone)]
pub struct Database {
    pub(crate) pool: SqlitePool,
}

impl Database {
    /// Open a database connection and run migrations.
    ///
    /// `location` may be a bare filesystem path, `:memory:`, or a full
    /// `sqlite:` URL as stored in the session file.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError::InstanceLocked` if another process holds a lock
    /// on the database (SQLITE_BUSY, SQLITE_LOCKED).
    /// Returns `DatabaseError::Migration` if the schema could not be created.
    pub async fn open(location: &str) -> Result<Self, DatabaseError> {
        let url = connection_url(location);

        // SEC-010: Pre-create the database file with user-only permissions so
        // there is no window where it exists with the default umask.
        #[cfg(unix)]
        if let Some(path) = file_path(location) {
            use std::os::unix::fs::OpenOptionsExt;
            let db_path = std::path::Path::new(path);
            if !db_path.exists() {
                if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    if let Err(e) = std::fs::create_dir_all(parent) {
                        tracing::warn!(path = %parent.display(), error = %e, "Failed to create database directory");
                    }
                }
                let _file = std::fs::OpenOptions::new()
                    .write(true)
                    .create_new(true)
                    .mode(0o600)
                    .open(db_path)
                    .ok(); // If creation fails, SQLite will report the error at connect_with.
            }
        }

        // busy_timeout=5000: SQLite waits up to 5 seconds for locks to release
        // before returning SQLITE_BUSY. Scheduler workers and interactive
        // commands may write concurrently.
        // foreign_keys is a per-connection setting, so it is set on the
        // options every pooled connection is created from.
        let options = SqliteConnectOptions::from_str(&url)
            .map_err(DatabaseError::from_sqlx)?
            .create_if_missing(true)
            .foreign_keys(true)
            .pragma("busy_timeout", "5000");
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        let db = Self { pool };
        db.migrate().await.map_err(|e| {
            let error_string = e.to_string().to_lowercase();
            if error_string.contains("database is locked")
                || error_string.contains("database table is locked")
            {
                DatabaseError::InstanceLocked
            } else {
                DatabaseError::Migration(e.to_string())
            }
        })?;
        tracing::debug!(location = %location, "Opened store");
        Ok(db)
    }

    /// Run database migrations atomically within a transaction.
    ///
    /// All migrations use `IF NOT EXISTS`, so re-running on an existing
    /// database is a no-op. If any step fails the whole migration rolls back.
    async fn migrate(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY,
                name TEXT UNIQUE NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS feeds (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                url TEXT UNIQUE NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                last_fetched_at INTEGER,
                user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS feed_follows (
                id INTEGER PRIMARY KEY,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                feed_id INTEGER NOT NULL REFERENCES feeds(id) ON DELETE CASCADE,
                UNIQUE(user_id, feed_id)
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        // Serves next_feed_to_fetch / claim_next_feed: ORDER BY last_fetched_at, id
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_feeds_last_fetched ON feeds(last_fetched_at, id)",
        )
        .execute(&mut *tx)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_feeds_user ON feeds(user_id)")
            .execute(&mut *tx)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_feed_follows_feed ON feed_follows(feed_id)")
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(())
    }
}

/// Build a sqlx connection URL from a session `db_url` value.
fn connection_url(location: &str) -> String {
    if location.starts_with("sqlite:") {
        location.to_string()
    } else {
        format!("sqlite:{}", location)
    }
}

/// The on-disk path behind a location, or `None` for in-memory databases.
#[cfg_attr(not(unix), allow(dead_code))]
fn file_path(location: &str) -> Option<&str> {
    let path = location
        .strip_prefix("sqlite://")
        .or_else(|| location.strip_prefix("sqlite:"))
        .unwrap_or(location);
    let path = path.split('?').next().unwrap_or(path);
    if path.is_empty() || path == ":memory:" {
        None
    } else {
        Some(path)
    }
}

/// Current time in Unix milliseconds, the resolution all store timestamps use.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
