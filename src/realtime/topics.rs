//! Topic names shared by publishers and subscribers.

use crate::types::session::UserId;

/// Table-wide change feed for the bookmarks table. Not filtered by owner;
/// receivers filter on `user_id`.
pub const CHANGE_FEED_TOPIC: &str = "public:bookmarks";

/// Per-user direct broadcast topic.
pub fn broadcast_topic(user: &UserId) -> String {
    format!("bookmarks-broadcast-{}", user)
}

/// Name of a session's change-feed subscription, used in logs.
pub fn change_feed_subscription(user: &UserId) -> String {
    format!("bookmarks-pg-{}", user)
}
