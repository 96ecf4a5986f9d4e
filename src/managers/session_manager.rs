//! Bookmark session: one open view of one user.
//!
//! Owns the reconciliation state and the two channel listeners feeding it.
//! User mutations go store first, then the local optimistic update, then a
//! direct-channel broadcast to the user's other sessions. Listeners apply
//! whatever arrives through the same idempotent operations, so no path needs
//! to know whether another one already delivered the change.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::managers::bookmark_state::{BookmarkState, BookmarkStateTrait, ListingMark};
use crate::realtime::topics::{broadcast_topic, change_feed_subscription, CHANGE_FEED_TOPIC};
use crate::realtime::{RealtimeTransport, ReconnectPolicy};
use crate::services::validation;
use crate::store::BookmarkStore;
use crate::types::bookmark::{Bookmark, BookmarkId};
use crate::types::errors::{ChannelError, SessionError, StoreError};
use crate::types::events::{BookmarkEvent, BroadcastMessage, ChannelPayload, Envelope, EventOrigin};
use crate::types::session::{SessionId, UserId};

/// State shared between the session handle and its listener tasks.
struct Shared {
    state: Mutex<BookmarkState>,
    revision: watch::Sender<u64>,
    loading: AtomicBool,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, BookmarkState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn apply(&self, origin: EventOrigin, event: BookmarkEvent) {
        let id = event.bookmark_id().to_string();
        let changed = self.state().apply(event);
        debug!(?origin, id = %id, changed, "applied bookmark event");
        if changed {
            self.bump();
        }
    }

    fn mark(&self) -> ListingMark {
        self.state().mark()
    }

    fn merge_listing(&self, mark: ListingMark, bookmarks: Vec<Bookmark>) {
        self.state().merge_listing(mark, bookmarks);
        self.bump();
    }

    fn bump(&self) {
        self.revision.send_modify(|rev| *rev += 1);
    }
}

/// Which of the two subscriptions a listener serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Channel {
    Direct,
    ChangeFeed,
}

impl Channel {
    fn origin(self) -> EventOrigin {
        match self {
            Channel::Direct => EventOrigin::Direct,
            Channel::ChangeFeed => EventOrigin::ChangeFeed,
        }
    }
}

/// Everything a listener task needs, cloned per task.
#[derive(Clone)]
struct ListenerContext {
    channel: Channel,
    topic: String,
    session_id: SessionId,
    user: UserId,
    store: Arc<dyn BookmarkStore>,
    transport: Arc<dyn RealtimeTransport>,
    shared: Arc<Shared>,
    policy: ReconnectPolicy,
}

impl ListenerContext {
    fn decode(&self, envelope: Envelope) -> Option<BookmarkEvent> {
        match (self.channel, envelope.payload) {
            (Channel::Direct, ChannelPayload::Broadcast(message)) => {
                if envelope.sender.as_ref() == Some(&self.session_id) {
                    return None;
                }
                Some(message.into_event())
            }
            (Channel::ChangeFeed, ChannelPayload::PostgresChanges(change)) => change.for_user(self.user.as_str()),
            (channel, payload) => {
                warn!(?channel, ?payload, "unexpected payload on channel");
                None
            }
        }
    }

    async fn resync(&self) {
        let mark = self.shared.mark();
        match self.store.list(&self.user).await {
            Ok(bookmarks) => {
                info!(channel = ?self.channel, count = bookmarks.len(), "resynced bookmarks");
                self.shared.merge_listing(mark, bookmarks);
            }
            Err(e) => warn!(channel = ?self.channel, error = %e, "resync failed; list may be stale"),
        }
    }

    async fn resubscribe(&self) -> Option<broadcast::Receiver<Envelope>> {
        for (attempt, delay) in self.policy.delays().enumerate() {
            tokio::time::sleep(delay).await;
            match self.transport.subscribe(&self.topic) {
                Ok(rx) => {
                    info!(channel = ?self.channel, attempt = attempt + 1, "resubscribed");
                    return Some(rx);
                }
                Err(e) => warn!(channel = ?self.channel, attempt = attempt + 1, error = %e, "resubscribe failed"),
            }
        }
        None
    }

    async fn run(self, mut rx: broadcast::Receiver<Envelope>) {
        loop {
            match rx.recv().await {
                Ok(Envelope { payload: ChannelPayload::Joined, .. }) => {
                    debug!(channel = ?self.channel, topic = %self.topic, "channel joined; refetching list");
                    self.resync().await;
                }
                Ok(envelope) => {
                    if let Some(event) = self.decode(envelope) {
                        self.shared.apply(self.channel.origin(), event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(channel = ?self.channel, missed, "channel lagged; refetching list");
                    self.resync().await;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    warn!(channel = ?self.channel, topic = %self.topic, "channel closed");
                    match self.resubscribe().await {
                        Some(new_rx) => {
                            rx = new_rx;
                            self.resync().await;
                        }
                        None => {
                            error!(channel = ?self.channel, "giving up on channel; updates from it are lost until reload");
                            return;
                        }
                    }
                }
            }
        }
    }
}

/// One user's live bookmark view.
pub struct BookmarkSession {
    session_id: SessionId,
    user: UserId,
    store: Arc<dyn BookmarkStore>,
    transport: Arc<dyn RealtimeTransport>,
    shared: Arc<Shared>,
    listeners: Mutex<Vec<JoinHandle<()>>>,
}

impl BookmarkSession {
    /// Opens both subscriptions for `user`. Must be called inside a Tokio
    /// runtime.
    ///
    /// Subscribing happens before any listing so that nothing written
    /// between the listing and the subscription is missed. Call
    /// [`refresh`](Self::refresh) afterwards to load the list.
    pub fn open(
        user: UserId,
        store: Arc<dyn BookmarkStore>,
        transport: Arc<dyn RealtimeTransport>,
        policy: ReconnectPolicy,
    ) -> Result<Self, ChannelError> {
        let session_id = SessionId::generate();
        let (revision, _) = watch::channel(0);
        let shared = Arc::new(Shared {
            state: Mutex::new(BookmarkState::new()),
            revision,
            loading: AtomicBool::new(true),
        });

        let direct_topic = broadcast_topic(&user);
        let direct_rx = transport.subscribe(&direct_topic)?;
        let feed_rx = transport.subscribe(CHANGE_FEED_TOPIC)?;

        let base = ListenerContext {
            channel: Channel::Direct,
            topic: direct_topic,
            session_id: session_id.clone(),
            user: user.clone(),
            store: store.clone(),
            transport: transport.clone(),
            shared: shared.clone(),
            policy,
        };
        let feed = ListenerContext {
            channel: Channel::ChangeFeed,
            topic: CHANGE_FEED_TOPIC.to_string(),
            ..base.clone()
        };

        let listeners = vec![
            tokio::spawn(base.run(direct_rx)),
            tokio::spawn(feed.run(feed_rx)),
        ];

        info!(
            session = %session_id,
            user = %user,
            feed = %change_feed_subscription(&user),
            "session opened"
        );

        Ok(Self {
            session_id,
            user,
            store,
            transport,
            shared,
            listeners: Mutex::new(listeners),
        })
    }

    pub fn id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn user(&self) -> &UserId {
        &self.user
    }

    /// True until the first listing attempt finishes, whether it succeeded or not.
    pub fn is_loading(&self) -> bool {
        self.shared.loading.load(Ordering::Acquire)
    }

    /// Current list, newest first.
    pub fn snapshot(&self) -> Vec<Bookmark> {
        self.shared.state().snapshot()
    }

    /// Revision counter bumped on every visible change, for re-rendering.
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.shared.revision.subscribe()
    }

    /// Replaces the list with a fresh listing from the store. Bookmarks that
    /// arrive while the listing is in flight are kept.
    pub async fn refresh(&self) -> Result<(), StoreError> {
        let mark = self.shared.mark();
        let result = self.store.list(&self.user).await;
        self.shared.loading.store(false, Ordering::Release);
        let bookmarks = result?;
        debug!(session = %self.session_id, count = bookmarks.len(), "loaded bookmarks");
        self.shared.merge_listing(mark, bookmarks);
        Ok(())
    }

    /// Validates, stores, applies locally and broadcasts a new bookmark.
    pub async fn add_bookmark(&self, url: &str, title: &str) -> Result<Bookmark, SessionError> {
        validation::ensure_valid(url, title)?;

        let bookmark = self.store.create(&self.user, url, title).await?;
        self.shared
            .apply(EventOrigin::Local, BookmarkEvent::Added(bookmark.clone()));
        self.publish(BroadcastMessage::BookmarkAdded(bookmark.clone()));
        Ok(bookmark)
    }

    /// Deletes a bookmark from the store, then locally, then broadcasts.
    ///
    /// A bookmark already deleted elsewhere is not an error: the store
    /// reports `NotFound`, the local row is dropped and nothing is broadcast.
    pub async fn delete_bookmark(&self, id: &str) -> Result<(), SessionError> {
        match self.store.delete(&self.user, id).await {
            Ok(()) => {
                self.shared
                    .apply(EventOrigin::Local, BookmarkEvent::Deleted(id.to_string()));
                self.publish(BroadcastMessage::BookmarkDeleted(BookmarkId { id: id.to_string() }));
                Ok(())
            }
            Err(StoreError::NotFound(_)) => {
                debug!(session = %self.session_id, id, "bookmark already deleted");
                self.shared
                    .apply(EventOrigin::Local, BookmarkEvent::Deleted(id.to_string()));
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Stops both listeners and releases the topics. Closing twice is a no-op.
    pub async fn close(&self) {
        let handles = std::mem::take(&mut *self.lock_listeners());
        if handles.is_empty() {
            return;
        }
        for handle in handles {
            handle.abort();
            let _ = handle.await;
        }
        self.transport.release(&broadcast_topic(&self.user));
        self.transport.release(CHANGE_FEED_TOPIC);
        info!(session = %self.session_id, "session closed");
    }

    fn lock_listeners(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.listeners.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // Best-effort: sessions that miss this still get the change feed event.
    fn publish(&self, message: BroadcastMessage) {
        let event = message.event_name();
        let envelope = Envelope {
            sender: Some(self.session_id.clone()),
            payload: ChannelPayload::Broadcast(message),
        };
        match self.transport.publish(&broadcast_topic(&self.user), envelope) {
            Ok(reached) => debug!(session = %self.session_id, event, reached, "broadcast sent"),
            Err(e) => warn!(session = %self.session_id, event, error = %e, "broadcast failed"),
        }
    }
}

impl Drop for BookmarkSession {
    fn drop(&mut self) {
        for handle in self.lock_listeners().iter() {
            handle.abort();
        }
    }
}
