use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Store errors with user-friendly messages.
///
/// Constraint violations are classified into `Duplicate` and `NotFound` so the
/// command layer can render them without inspecting SQLite error codes.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Another process holds a lock on the database
    #[error("The gator database is locked by another process. Please try again.")]
    InstanceLocked,

    /// Migration failed
    #[error("Database migration failed: {0}")]
    Migration(String),

    /// Unique constraint violation (user name, feed URL, or follow pair)
    #[error("{entity} already exists: {key}")]
    Duplicate { entity: &'static str, key: String },

    /// Missing user/feed/follow, or a reference to one
    #[error("{entity} not found: {key}")]
    NotFound { entity: &'static str, key: String },

    /// Rejected input (empty names, empty URLs)
    #[error("Invalid {field}: {reason}")]
    Validation {
        field: &'static str,
        reason: String,
    },

    /// Generic database error
    #[error("Database error: {0}")]
    Other(#[from] sqlx::Error),
}

impl DatabaseError {
    /// Check if a sqlx error indicates database locking
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        let error_string = err.to_string().to_lowercase();

        // SQLITE_BUSY (5): database is locked
        // SQLITE_LOCKED (6): database table is locked
        if error_string.contains("database is locked")
            || error_string.contains("database table is locked")
            || error_string.contains("sqlite_busy")
            || error_string.contains("sqlite_locked")
        {
            return DatabaseError::InstanceLocked;
        }

        DatabaseError::Other(err)
    }

    /// Classify a write error against the constraint it tripped.
    ///
    /// `duplicate` describes the row being written (reported on a unique
    /// violation); `missing` names the referenced row reported when a foreign
    /// key is violated.
    pub(crate) fn from_write(
        err: sqlx::Error,
        duplicate: (&'static str, String),
        missing: (&'static str, String),
    ) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            if db_err.is_unique_violation() {
                return DatabaseError::Duplicate {
                    entity: duplicate.0,
                    key: duplicate.1,
                };
            }
            if db_err.is_foreign_key_violation() {
                return DatabaseError::NotFound {
                    entity: missing.0,
                    key: missing.1,
                };
            }
        }
        Self::from_sqlx(err)
    }

    pub(crate) fn not_found(entity: &'static str, key: impl ToString) -> Self {
        DatabaseError::NotFound {
            entity,
            key: key.to_string(),
        }
    }

    /// True for `NotFound`, which the scheduler treats as a benign skip.
    pub fn is_not_found(&self) -> bool {
        matches!(self, DatabaseError::NotFound { .. })
    }

    /// True for `Duplicate`.
    pub fn is_duplicate(&self) -> bool {
        matches!(self, DatabaseError::Duplicate { .. })
    }
}

// ============================================================================
// Data Structures
// ============================================================================

/// A registered user. Timestamps are Unix milliseconds (UTC).
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct User {
    pub id: i64,
    pub name: String,
    pub created_at: i64,
    pub updated_at: i64,
}

/// A feed tracked by the store.
///
/// `last_fetched_at` is `None` until the scheduler first claims the feed and
/// never moves backwards afterwards. `user_id` is the owner, i.e. the user who
/// added it; ownership is informational only.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct Feed {
    pub id: i64,
    pub name: String,
    pub url: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub last_fetched_at: Option<i64>,
    pub user_id: i64,
}

/// Feed row joined with its owner's display name (for `feeds`).
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct FeedWithOwner {
    #[sqlx(flatten)]
    pub feed: Feed,
    pub owner_name: String,
}

/// A follow row joined with the user and feed names for immediate display.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct FeedFollow {
    pub id: i64,
    pub created_at: i64,
    pub updated_at: i64,
    pub user_id: i64,
    pub feed_id: i64,
    pub user_name: String,
    pub feed_name: String,
}

/// One entry of a user's following list.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct FollowedFeed {
    pub feed_id: i64,
    pub feed_name: String,
    pub feed_url: String,
    pub followed_at: i64,
}
