//! Change-data-capture for a bookmark store.
//!
//! Wraps any [`BookmarkStore`] and publishes a row-level event on the
//! table-wide change feed after each durable write. Failed writes publish
//! nothing. A missing audience is normal (no session open) and only logged.
//!
//! Only the embedded backend needs this; a hosted backend streams its own
//! table changes through [`crate::realtime::SocketTransport`].

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{trace, warn};

use super::BookmarkStore;
use crate::realtime::topics::CHANGE_FEED_TOPIC;
use crate::realtime::RealtimeTransport;
use crate::types::bookmark::Bookmark;
use crate::types::errors::{ChannelError, StoreError};
use crate::types::events::{ChangeFeedEvent, ChannelPayload, Envelope};
use crate::types::session::UserId;

pub struct ChangeFeedStore<S> {
    inner: S,
    transport: Arc<dyn RealtimeTransport>,
}

impl<S: BookmarkStore> ChangeFeedStore<S> {
    pub fn new(inner: S, transport: Arc<dyn RealtimeTransport>) -> Self {
        Self { inner, transport }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    fn emit(&self, event: ChangeFeedEvent) {
        let envelope = Envelope {
            sender: None,
            payload: ChannelPayload::PostgresChanges(event),
        };
        match self.transport.publish(CHANGE_FEED_TOPIC, envelope) {
            Ok(reached) => trace!(reached, "change feed event published"),
            Err(ChannelError::NoSubscribers(_)) => trace!("change feed has no subscribers"),
            Err(e) => warn!(error = %e, "change feed publish failed"),
        }
    }
}

#[async_trait]
impl<S: BookmarkStore> BookmarkStore for ChangeFeedStore<S> {
    async fn list(&self, user: &UserId) -> Result<Vec<Bookmark>, StoreError> {
        self.inner.list(user).await
    }

    async fn create(&self, user: &UserId, url: &str, title: &str) -> Result<Bookmark, StoreError> {
        let bookmark = self.inner.create(user, url, title).await?;
        self.emit(ChangeFeedEvent::insert(bookmark.clone()));
        Ok(bookmark)
    }

    async fn delete(&self, user: &UserId, id: &str) -> Result<(), StoreError> {
        self.inner.delete(user, id).await?;
        self.emit(ChangeFeedEvent::delete(id, user.as_str()));
        Ok(())
    }
}
