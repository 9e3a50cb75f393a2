use sqlx::SqliteConnection;

use super::schema::{now_millis, Database};
use super::types::{DatabaseError, FeedFollow, FollowedFeed};

impl Database {
    // ========================================================================
    // Follow Operations
    // ========================================================================

    /// Make `user_id` follow `feed_id`.
    ///
    /// Returns the follow joined with the user's and feed's names.
    ///
    /// # Errors
    ///
    /// - `DatabaseError::Duplicate` if the user already follows the feed
    /// - `DatabaseError::NotFound` if the user or the feed does not exist
    pub async fn create_follow(
        &self,
        user_id: i64,
        feed_id: i64,
    ) -> Result<FeedFollow, DatabaseError> {
        let mut tx = self.pool.begin().await?;
        let follow = insert_follow(&mut tx, user_id, feed_id, now_millis()).await?;
        tx.commit().await?;
        Ok(follow)
    }

    /// Remove the follow of `feed_id` by `user_id`.
    ///
    /// # Errors
    ///
    /// `DatabaseError::NotFound` if the user does not follow the feed.
    pub async fn delete_follow(&self, user_id: i64, feed_id: i64) -> Result<(), DatabaseError> {
        let result = sqlx::query("DELETE FROM feed_follows WHERE user_id = ? AND feed_id = ?")
            .bind(user_id)
            .bind(feed_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::not_found(
                "follow",
                follow_key(user_id, feed_id),
            ));
        }
        Ok(())
    }

    /// Feeds followed by `user_id`, in the order they were followed.
    pub async fn list_follows_for_user(
        &self,
        user_id: i64,
    ) -> Result<Vec<FollowedFeed>, DatabaseError> {
        let follows = sqlx::query_as::<_, FollowedFeed>(
            r#"
                SELECT
                    f.id AS feed_id,
                    f.name AS feed_name,
                    f.url AS feed_url,
                    ff.created_at AS followed_at
                FROM feed_follows ff
                JOIN feeds f ON f.id = ff.feed_id
                WHERE ff.user_id = ?
                ORDER BY ff.created_at, ff.id
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(follows)
    }
}

fn follow_key(user_id: i64, feed_id: i64) -> String {
    format!("user {} / feed {}", user_id, feed_id)
}

/// Insert a follow row and read it back joined with the display names.
///
/// SQLite's RETURNING cannot join, so the names are fetched by id on the
/// same connection (inside the caller's transaction).
pub(super) async fn insert_follow(
    conn: &mut SqliteConnection,
    user_id: i64,
    feed_id: i64,
    now: i64,
) -> Result<FeedFollow, DatabaseError> {
    let (id,): (i64,) = sqlx::query_as(
        "INSERT INTO feed_follows (created_at, updated_at, user_id, feed_id)
         VALUES (?, ?, ?, ?)
         RETURNING id",
    )
    .bind(now)
    .bind(now)
    .bind(user_id)
    .bind(feed_id)
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| {
        let key = follow_key(user_id, feed_id);
        DatabaseError::from_write(e, ("follow", key.clone()), ("user or feed", key))
    })?;

    let follow = sqlx::query_as::<_, FeedFollow>(
        r#"
            SELECT
                ff.id, ff.created_at, ff.updated_at, ff.user_id, ff.feed_id,
                u.name AS user_name,
                f.name AS feed_name
            FROM feed_follows ff
            JOIN users u ON u.id = ff.user_id
            JOIN feeds f ON f.id = ff.feed_id
            WHERE ff.id = ?
        "#,
    )
    .bind(id)
    .fetch_one(&mut *conn)
    .await?;

    Ok(follow)
}
