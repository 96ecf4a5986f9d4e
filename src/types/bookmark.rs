use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A saved bookmark as stored by the backend.
///
/// Records are immutable once created: the client only ever creates or
/// deletes them, so there is no update path anywhere in the crate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bookmark {
    pub id: String,
    pub user_id: String,
    pub url: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
}

/// Insert payload sent to the store. The store fills in `id` and `created_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewBookmark {
    pub user_id: String,
    pub url: String,
    pub title: String,
}

/// Identity-only payload, used for delete notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookmarkId {
    pub id: String,
}
