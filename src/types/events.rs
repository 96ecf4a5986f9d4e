//! Wire shapes for the two notification channels.
//!
//! The direct channel carries explicit `broadcast` messages published by a
//! session after its own write. The change feed carries row-level events
//! emitted for every durable insert or delete on the bookmarks table.

use serde::{Deserialize, Serialize};

use super::bookmark::{Bookmark, BookmarkId};
use super::session::SessionId;

/// Event name for a bookmark published after a successful create.
pub const BOOKMARK_ADDED: &str = "bookmark-added";
/// Event name for an id published after a successful delete.
pub const BOOKMARK_DELETED: &str = "bookmark-deleted";

/// A state change, independent of which path delivered it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BookmarkEvent {
    Added(Bookmark),
    Deleted(String),
}

impl BookmarkEvent {
    pub fn bookmark_id(&self) -> &str {
        match self {
            BookmarkEvent::Added(bookmark) => &bookmark.id,
            BookmarkEvent::Deleted(id) => id,
        }
    }
}

/// Where an event entered the reconciliation state from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventOrigin {
    /// The session's own optimistic update after a confirmed write.
    Local,
    /// Another session's explicit broadcast.
    Direct,
    /// Row-level change feed from the store.
    ChangeFeed,
}

/// `{"type":"broadcast","event":…,"payload":…}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload")]
pub enum BroadcastMessage {
    #[serde(rename = "bookmark-added")]
    BookmarkAdded(Bookmark),
    #[serde(rename = "bookmark-deleted")]
    BookmarkDeleted(BookmarkId),
}

impl BroadcastMessage {
    pub fn event_name(&self) -> &'static str {
        match self {
            BroadcastMessage::BookmarkAdded(_) => BOOKMARK_ADDED,
            BroadcastMessage::BookmarkDeleted(_) => BOOKMARK_DELETED,
        }
    }

    pub fn into_event(self) -> BookmarkEvent {
        match self {
            BroadcastMessage::BookmarkAdded(bookmark) => BookmarkEvent::Added(bookmark),
            BroadcastMessage::BookmarkDeleted(BookmarkId { id }) => BookmarkEvent::Deleted(id),
        }
    }
}

impl From<&BookmarkEvent> for BroadcastMessage {
    fn from(event: &BookmarkEvent) -> Self {
        match event {
            BookmarkEvent::Added(bookmark) => BroadcastMessage::BookmarkAdded(bookmark.clone()),
            BookmarkEvent::Deleted(id) => BroadcastMessage::BookmarkDeleted(BookmarkId { id: id.clone() }),
        }
    }
}

/// Row-level operation kind reported by the change feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Delete,
}

/// Old row image of a delete. Only the primary key is guaranteed; the owner
/// is present when the table keeps full replica identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OldRow {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

/// `{"schema":"public","table":"bookmarks","eventType":"INSERT",…}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeFeedEvent {
    pub schema: String,
    pub table: String,
    #[serde(rename = "eventType")]
    pub event_type: ChangeKind,
    #[serde(default)]
    pub new: Option<Bookmark>,
    #[serde(default)]
    pub old: Option<OldRow>,
}

impl ChangeFeedEvent {
    pub fn insert(bookmark: Bookmark) -> Self {
        Self {
            schema: "public".to_string(),
            table: "bookmarks".to_string(),
            event_type: ChangeKind::Insert,
            new: Some(bookmark),
            old: None,
        }
    }

    pub fn delete(id: &str, user_id: &str) -> Self {
        Self {
            schema: "public".to_string(),
            table: "bookmarks".to_string(),
            event_type: ChangeKind::Delete,
            new: None,
            old: Some(OldRow {
                id: id.to_string(),
                user_id: Some(user_id.to_string()),
            }),
        }
    }

    /// Converts to a state change if the row concerns `user_id`.
    ///
    /// Inserts for other owners are dropped. Deletes without an owner in the
    /// old row are kept: removing an id the session never held is a no-op.
    pub fn for_user(self, user_id: &str) -> Option<BookmarkEvent> {
        match self.event_type {
            ChangeKind::Insert => self
                .new
                .filter(|row| row.user_id == user_id)
                .map(BookmarkEvent::Added),
            ChangeKind::Delete => self
                .old
                .filter(|row| row.user_id.as_deref().map_or(true, |owner| owner == user_id))
                .map(|row| BookmarkEvent::Deleted(row.id)),
        }
    }
}

/// What travels on a topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelPayload {
    Broadcast(BroadcastMessage),
    PostgresChanges(ChangeFeedEvent),
    /// The transport joined the topic upstream, first time or after a
    /// reconnect. Anything published before that is lost to this receiver.
    Joined,
}

/// A payload plus the session that published it, if any.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub sender: Option<SessionId>,
    #[serde(flatten)]
    pub payload: ChannelPayload,
}
