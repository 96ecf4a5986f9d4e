//! Embedded bookmark store backed by SQLite via `rusqlite`.
//!
//! Ownership is enforced in SQL: every statement filters on `user_id`, so a
//! caller can never see or delete another user's rows.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::params;
use tracing::debug;
use uuid::Uuid;

use super::BookmarkStore;
use crate::database::Database;
use crate::types::bookmark::Bookmark;
use crate::types::errors::StoreError;
use crate::types::session::UserId;

/// Bookmark store over the local database.
pub struct SqliteStore {
    db: Arc<Database>,
}

impl SqliteStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Timestamps are stored with microsecond precision and a `Z` suffix so
    /// that text order matches time order.
    fn encode_time(time: &DateTime<Utc>) -> String {
        time.to_rfc3339_opts(SecondsFormat::Micros, true)
    }

    fn decode_time(raw: &str) -> Result<DateTime<Utc>, StoreError> {
        DateTime::parse_from_rfc3339(raw)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| StoreError::DatabaseError(format!("bad created_at '{}': {}", raw, e)))
    }

    fn list_sync(&self, user: &UserId) -> Result<Vec<Bookmark>, StoreError> {
        let conn = self.db.connection();
        let mut stmt = conn.prepare(
            "SELECT id, user_id, url, title, created_at FROM bookmarks
             WHERE user_id = ?1 ORDER BY created_at DESC, rowid DESC",
        )?;
        let rows = stmt.query_map(params![user.as_str()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;

        let mut bookmarks = Vec::new();
        for row in rows {
            let (id, user_id, url, title, created_at) = row?;
            bookmarks.push(Bookmark {
                id,
                user_id,
                url,
                title,
                created_at: Self::decode_time(&created_at)?,
            });
        }
        Ok(bookmarks)
    }

    fn create_sync(&self, user: &UserId, url: &str, title: &str) -> Result<Bookmark, StoreError> {
        let bookmark = Bookmark {
            id: Uuid::new_v4().to_string(),
            user_id: user.as_str().to_string(),
            url: url.to_string(),
            title: title.to_string(),
            created_at: Utc::now(),
        };

        self.db.connection().execute(
            "INSERT INTO bookmarks (id, user_id, url, title, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                bookmark.id,
                bookmark.user_id,
                bookmark.url,
                bookmark.title,
                Self::encode_time(&bookmark.created_at)
            ],
        )?;

        // Return what a reader would get back, not the in-memory value.
        let stored_at = Self::decode_time(&Self::encode_time(&bookmark.created_at))?;
        Ok(Bookmark { created_at: stored_at, ..bookmark })
    }

    fn delete_sync(&self, user: &UserId, id: &str) -> Result<(), StoreError> {
        let affected = self.db.connection().execute(
            "DELETE FROM bookmarks WHERE id = ?1 AND user_id = ?2",
            params![id, user.as_str()],
        )?;

        if affected == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl BookmarkStore for SqliteStore {
    async fn list(&self, user: &UserId) -> Result<Vec<Bookmark>, StoreError> {
        let bookmarks = self.list_sync(user)?;
        debug!(user = %user, count = bookmarks.len(), "listed bookmarks");
        Ok(bookmarks)
    }

    async fn create(&self, user: &UserId, url: &str, title: &str) -> Result<Bookmark, StoreError> {
        let bookmark = self.create_sync(user, url, title)?;
        debug!(user = %user, id = %bookmark.id, "created bookmark");
        Ok(bookmark)
    }

    async fn delete(&self, user: &UserId, id: &str) -> Result<(), StoreError> {
        self.delete_sync(user, id)?;
        debug!(user = %user, id, "deleted bookmark");
        Ok(())
    }
}
