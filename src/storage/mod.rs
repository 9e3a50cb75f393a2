mod feeds;
mod follows;
mod schema;
mod types;
mod users;

pub use schema::{now_millis, Database};
pub use types::{DatabaseError, Feed, FeedFollow, FeedWithOwner, FollowedFeed, User};
