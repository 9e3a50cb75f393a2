use super::schema::{now_millis, Database};
use super::types::{DatabaseError, User};
use crate::util::strip_control_chars;

impl Database {
    // ========================================================================
    // User Operations
    // ========================================================================

    /// SEC-001: Sanitize and validate a display name.
    ///
    /// Strips control characters (ANSI escape injection prevention), trims
    /// whitespace, and rejects empty/whitespace-only names.
    pub(crate) fn sanitize_name(field: &'static str, name: &str) -> Result<String, DatabaseError> {
        let sanitized = strip_control_chars(name);
        let trimmed = sanitized.trim();
        if trimmed.is_empty() {
            return Err(DatabaseError::Validation {
                field,
                reason: "cannot be empty or whitespace-only".to_string(),
            });
        }
        Ok(trimmed.to_owned())
    }

    /// Register a new user.
    ///
    /// # Errors
    ///
    /// - `DatabaseError::Duplicate` if the name is taken
    /// - `DatabaseError::Validation` if the name is empty after sanitizing
    pub async fn create_user(&self, name: &str) -> Result<User, DatabaseError> {
        let name = Self::sanitize_name("user name", name)?;
        let now = now_millis();

        sqlx::query_as::<_, User>(
            "INSERT INTO users (name, created_at, updated_at) VALUES (?, ?, ?)
             RETURNING id, name, created_at, updated_at",
        )
        .bind(&name)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| DatabaseError::from_write(e, ("user", name.clone()), ("user", name.clone())))
    }

    /// Look up a user by display name.
    pub async fn get_user(&self, name: &str) -> Result<User, DatabaseError> {
        sqlx::query_as::<_, User>(
            "SELECT id, name, created_at, updated_at FROM users WHERE name = ?",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| DatabaseError::not_found("user", name))
    }

    /// Look up a user by id.
    pub async fn get_user_by_id(&self, id: i64) -> Result<User, DatabaseError> {
        sqlx::query_as::<_, User>("SELECT id, name, created_at, updated_at FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DatabaseError::not_found("user", id))
    }

    /// All users ordered by name.
    pub async fn list_users(&self) -> Result<Vec<User>, DatabaseError> {
        let users = sqlx::query_as::<_, User>(
            "SELECT id, name, created_at, updated_at FROM users ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(users)
    }

    /// Delete every user. Feeds and follows go with them (ON DELETE CASCADE).
    ///
    /// Runs in a transaction: on failure the store is left untouched.
    /// Returns the number of users removed.
    pub async fn delete_all_users(&self) -> Result<u64, DatabaseError> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query("DELETE FROM users").execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(result.rows_affected())
    }
}
