use sqlx::SqliteConnection;

use super::follows::insert_follow;
use super::schema::{now_millis, Database};
use super::types::{DatabaseError, Feed, FeedFollow, FeedWithOwner};

const FEED_COLUMNS: &str = "id, name, url, created_at, updated_at, last_fetched_at, user_id";

impl Database {
    // ========================================================================
    // Feed Operations
    // ========================================================================

    /// Register a feed owned by `owner_id`.
    ///
    /// Feed URLs are unique: adding an existing URL is an error, not an upsert.
    ///
    /// # Errors
    ///
    /// - `DatabaseError::Duplicate` if a feed with this URL exists
    /// - `DatabaseError::NotFound` if the owner does not exist
    /// - `DatabaseError::Validation` for an empty name or URL
    pub async fn create_feed(
        &self,
        name: &str,
        url: &str,
        owner_id: i64,
    ) -> Result<Feed, DatabaseError> {
        let mut conn = self.pool.acquire().await?;
        insert_feed(&mut conn, name, url, owner_id, now_millis()).await
    }

    /// Register a feed and make its owner follow it, in one transaction.
    ///
    /// Either both rows are written or neither is.
    pub async fn create_feed_with_follow(
        &self,
        name: &str,
        url: &str,
        owner_id: i64,
    ) -> Result<(Feed, FeedFollow), DatabaseError> {
        let now = now_millis();
        let mut tx = self.pool.begin().await?;

        let feed = insert_feed(&mut tx, name, url, owner_id, now).await?;
        let follow = insert_follow(&mut tx, owner_id, feed.id, now).await?;

        tx.commit().await?;
        Ok((feed, follow))
    }

    /// Look up a feed by its canonical URL.
    pub async fn get_feed_by_url(&self, url: &str) -> Result<Feed, DatabaseError> {
        sqlx::query_as::<_, Feed>(&format!("SELECT {FEED_COLUMNS} FROM feeds WHERE url = ?"))
            .bind(url)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DatabaseError::not_found("feed", url))
    }

    /// Look up a feed by id.
    pub async fn get_feed(&self, feed_id: i64) -> Result<Feed, DatabaseError> {
        sqlx::query_as::<_, Feed>(&format!("SELECT {FEED_COLUMNS} FROM feeds WHERE id = ?"))
            .bind(feed_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DatabaseError::not_found("feed", feed_id))
    }

    /// All feeds with their owner's name, in creation order.
    pub async fn list_feeds(&self) -> Result<Vec<FeedWithOwner>, DatabaseError> {
        let feeds = sqlx::query_as::<_, FeedWithOwner>(
            r#"
                SELECT
                    f.id, f.name, f.url, f.created_at, f.updated_at,
                    f.last_fetched_at, f.user_id,
                    u.name AS owner_name
                FROM feeds f
                JOIN users u ON u.id = f.user_id
                ORDER BY f.created_at, f.id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(feeds)
    }

    /// Delete a feed. Follows referencing it are removed by ON DELETE CASCADE.
    pub async fn delete_feed(&self, feed_id: i64) -> Result<(), DatabaseError> {
        let result = sqlx::query("DELETE FROM feeds WHERE id = ?")
            .bind(feed_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DatabaseError::not_found("feed", feed_id));
        }
        Ok(())
    }

    // ========================================================================
    // Scheduling Operations
    // ========================================================================

    /// The feed whose last fetch is oldest.
    ///
    /// Never-fetched feeds (NULL) sort before any timestamp; ties fall back
    /// to the lowest id.
    ///
    /// # Errors
    ///
    /// `DatabaseError::NotFound` if the store has no feeds.
    pub async fn next_feed_to_fetch(&self) -> Result<Feed, DatabaseError> {
        sqlx::query_as::<_, Feed>(&format!(
            "SELECT {FEED_COLUMNS} FROM feeds ORDER BY last_fetched_at ASC, id ASC LIMIT 1"
        ))
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| DatabaseError::not_found("feed", "no feeds to fetch"))
    }

    /// Record a fetch of `feed_id` at `at` (Unix milliseconds).
    ///
    /// `last_fetched_at` never moves backwards: an older `at` leaves it as is
    /// but still bumps `updated_at`.
    ///
    /// # Errors
    ///
    /// `DatabaseError::NotFound` if the feed no longer exists.
    pub async fn mark_feed_fetched(&self, feed_id: i64, at: i64) -> Result<(), DatabaseError> {
        let result = sqlx::query(
            "UPDATE feeds
             SET last_fetched_at = MAX(COALESCE(last_fetched_at, ?), ?), updated_at = ?
             WHERE id = ?",
        )
        .bind(at)
        .bind(at)
        .bind(at)
        .bind(feed_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::not_found("feed", feed_id));
        }
        Ok(())
    }

    /// Atomically select the next feed to fetch and mark it fetched.
    ///
    /// This is `next_feed_to_fetch` + `mark_feed_fetched` as a single
    /// statement, so concurrent workers can never claim the same feed.
    /// The stamped time is `max(at, latest claim + 1ms)`: claim timestamps
    /// are strictly increasing, which keeps the oldest-first rotation fair
    /// even when several claims land in the same millisecond.
    ///
    /// Returns `None` when the store has no feeds.
    pub async fn claim_next_feed(&self, at: i64) -> Result<Option<Feed>, DatabaseError> {
        let feed = sqlx::query_as::<_, Feed>(&format!(
            r#"
                UPDATE feeds
                SET last_fetched_at = MAX(?, COALESCE((SELECT MAX(last_fetched_at) FROM feeds) + 1, ?)),
                    updated_at = ?
                WHERE id = (
                    SELECT id FROM feeds ORDER BY last_fetched_at ASC, id ASC LIMIT 1
                )
                RETURNING {FEED_COLUMNS}
            "#
        ))
        .bind(at)
        .bind(at)
        .bind(at)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        if let Some(feed) = &feed {
            tracing::debug!(feed_id = feed.id, url = %feed.url, "Claimed feed");
        }
        Ok(feed)
    }
}

/// Insert a feed row on an existing connection or transaction.
async fn insert_feed(
    conn: &mut SqliteConnection,
    name: &str,
    url: &str,
    owner_id: i64,
    now: i64,
) -> Result<Feed, DatabaseError> {
    let name = Database::sanitize_name("feed name", name)?;
    let url = url.trim();
    if url.is_empty() {
        return Err(DatabaseError::Validation {
            field: "feed url",
            reason: "cannot be empty".to_string(),
        });
    }

    sqlx::query_as::<_, Feed>(&format!(
        "INSERT INTO feeds (name, url, created_at, updated_at, user_id)
         VALUES (?, ?, ?, ?, ?)
         RETURNING {FEED_COLUMNS}"
    ))
    .bind(&name)
    .bind(url)
    .bind(now)
    .bind(now)
    .bind(owner_id)
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| {
        DatabaseError::from_write(e, ("feed", url.to_string()), ("user", owner_id.to_string()))
    })
}
