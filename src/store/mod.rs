//! Bookmark stores.
//!
//! The store is the single source of truth. Every operation is scoped to the
//! caller's identity, is single-shot and reports failure to the caller; no
//! implementation retries on its own.

use async_trait::async_trait;

use crate::types::bookmark::Bookmark;
use crate::types::errors::StoreError;
use crate::types::session::UserId;

pub mod change_feed;
pub mod rest;
pub mod sqlite;

pub use change_feed::ChangeFeedStore;
pub use rest::RestStore;
pub use sqlite::SqliteStore;

/// User-scoped create/list/delete over the bookmarks collection.
#[async_trait]
pub trait BookmarkStore: Send + Sync {
    /// All bookmarks owned by `user`, newest first.
    async fn list(&self, user: &UserId) -> Result<Vec<Bookmark>, StoreError>;

    /// Inserts a bookmark owned by `user` and returns the stored record with
    /// its assigned id and timestamp.
    async fn create(&self, user: &UserId, url: &str, title: &str) -> Result<Bookmark, StoreError>;

    /// Deletes the bookmark `id` if `user` owns it; `StoreError::NotFound`
    /// otherwise.
    async fn delete(&self, user: &UserId, id: &str) -> Result<(), StoreError>;
}
