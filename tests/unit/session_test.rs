//! End-to-end tests for bookmark sessions: two tabs of one user sharing a
//! hub and an embedded store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use marksync::database::Database;
use marksync::managers::session_manager::BookmarkSession;
use marksync::realtime::topics::{broadcast_topic, CHANGE_FEED_TOPIC};
use marksync::realtime::{LocalHub, RealtimeTransport, ReconnectPolicy};
use marksync::store::{BookmarkStore, ChangeFeedStore, SqliteStore};
use marksync::types::bookmark::Bookmark;
use marksync::types::errors::{SessionError, StoreError};
use marksync::types::session::UserId;
use marksync::types::validation::Field;

const WAIT: Duration = Duration::from_secs(2);

struct Fixture {
    hub: Arc<LocalHub>,
    db: Arc<Database>,
    store: Arc<dyn BookmarkStore>,
}

impl Fixture {
    fn new() -> Self {
        Self::with_capacity(64)
    }

    fn with_capacity(capacity: usize) -> Self {
        let hub = Arc::new(LocalHub::new(capacity));
        let db = Arc::new(Database::open_in_memory().unwrap());
        let transport: Arc<dyn RealtimeTransport> = hub.clone();
        let store: Arc<dyn BookmarkStore> = Arc::new(ChangeFeedStore::new(SqliteStore::new(db.clone()), transport));
        Self { hub, db, store }
    }

    /// Same database, no change feed.
    fn silent_store(&self) -> Arc<dyn BookmarkStore> {
        Arc::new(SqliteStore::new(self.db.clone()))
    }

    async fn open(&self, user: &str) -> BookmarkSession {
        self.open_with(user, self.store.clone()).await
    }

    async fn open_with(&self, user: &str, store: Arc<dyn BookmarkStore>) -> BookmarkSession {
        let session = BookmarkSession::open(UserId::new(user), store, self.hub.clone(), fast_policy()).unwrap();
        session.refresh().await.unwrap();
        session
    }
}

fn fast_policy() -> ReconnectPolicy {
    ReconnectPolicy {
        base: Duration::from_millis(5),
        max: Duration::from_millis(20),
        max_attempts: 3,
    }
}

async fn wait_for(session: &BookmarkSession, done: impl Fn(&[Bookmark]) -> bool) {
    let mut changes = session.changes();
    tokio::time::timeout(WAIT, async {
        while !done(&session.snapshot()) {
            changes.changed().await.expect("session state dropped");
        }
    })
    .await
    .expect("timed out waiting for session state");
}

fn count(list: &[Bookmark], id: &str) -> usize {
    list.iter().filter(|b| b.id == id).count()
}

#[tokio::test]
async fn test_add_shows_at_top_and_reaches_other_tab_once() {
    let fx = Fixture::new();
    let tab_a = fx.open("alice").await;
    let tab_b = fx.open("alice").await;

    tab_a.add_bookmark("https://example.com/older", "Older").await.unwrap();
    let docs = tab_a.add_bookmark("https://example.com/docs", "Docs").await.unwrap();
    assert!(!docs.id.is_empty());
    assert_eq!(tab_a.snapshot()[0].id, docs.id);

    wait_for(&tab_b, |list| count(list, &docs.id) == 1).await;
    // Let the slower of the two channels deliver its copy too.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(count(&tab_b.snapshot(), &docs.id), 1);
    assert_eq!(count(&tab_a.snapshot(), &docs.id), 1);
    assert_eq!(tab_b.snapshot().len(), 2);

    tab_a.close().await;
    tab_b.close().await;
}

#[tokio::test]
async fn test_delete_propagates_and_repeat_delete_is_ok() {
    let fx = Fixture::new();
    let tab_a = fx.open("alice").await;
    let tab_b = fx.open("alice").await;

    let bm = tab_a.add_bookmark("https://example.com", "Example").await.unwrap();
    wait_for(&tab_b, |list| count(list, &bm.id) == 1).await;

    tab_a.delete_bookmark(&bm.id).await.unwrap();
    assert!(tab_a.snapshot().is_empty());
    wait_for(&tab_b, |list| list.is_empty()).await;

    tab_b.delete_bookmark(&bm.id).await.unwrap();
    assert!(tab_b.snapshot().is_empty());

    tab_a.close().await;
    tab_b.close().await;
}

#[tokio::test]
async fn test_validation_failure_never_reaches_store() {
    let fx = Fixture::new();
    let tab = fx.open("alice").await;

    let err = tab.add_bookmark("not-a-url", "").await.unwrap_err();
    match err {
        SessionError::Validation(v) => {
            assert!(v.result.error(Field::Url).is_some());
            assert!(v.result.error(Field::Title).is_some());
        }
        other => panic!("expected validation error, got {:?}", other),
    }
    assert!(fx.store.list(&UserId::new("alice")).await.unwrap().is_empty());
    tab.close().await;
}

#[tokio::test]
async fn test_direct_channel_alone_delivers() {
    let fx = Fixture::new();
    let tab_a = fx.open_with("alice", fx.silent_store()).await;
    let tab_b = fx.open_with("alice", fx.silent_store()).await;

    let bm = tab_a.add_bookmark("https://example.com", "Direct").await.unwrap();
    wait_for(&tab_b, |list| count(list, &bm.id) == 1).await;

    tab_a.close().await;
    tab_b.close().await;
}

#[tokio::test]
async fn test_change_feed_reaches_sessions_of_owner_only() {
    let fx = Fixture::new();
    let alice = fx.open("alice").await;
    let bob = fx.open("bob").await;

    // A write by another client: change feed only, no broadcast.
    let bm = fx.store.create(&UserId::new("alice"), "https://example.com", "Feed").await.unwrap();
    wait_for(&alice, |list| count(list, &bm.id) == 1).await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(bob.snapshot().is_empty());

    alice.close().await;
    bob.close().await;
}

#[tokio::test]
async fn test_new_tab_loads_existing_list() {
    let fx = Fixture::new();
    let tab_a = fx.open("alice").await;
    let bm = tab_a.add_bookmark("https://example.com", "Existing").await.unwrap();

    let tab_b = fx.open("alice").await;
    assert!(!tab_b.is_loading());
    assert_eq!(tab_b.snapshot(), vec![bm]);

    tab_a.close().await;
    tab_b.close().await;
}

#[tokio::test]
async fn test_closed_channel_resubscribes_and_resyncs() {
    let fx = Fixture::new();
    let tab = fx.open("alice").await;

    // Written while nobody hears about it.
    let missed = fx
        .silent_store()
        .create(&UserId::new("alice"), "https://example.com/missed", "Missed")
        .await
        .unwrap();
    assert!(tab.snapshot().is_empty());

    fx.hub.shutdown_topic(&broadcast_topic(&UserId::new("alice")));
    wait_for(&tab, |list| count(list, &missed.id) == 1).await;

    // The new subscription is live.
    let tab_b = fx.open("alice").await;
    let bm = tab_b.add_bookmark("https://example.com/new", "New").await.unwrap();
    wait_for(&tab, |list| count(list, &bm.id) == 1).await;

    tab.close().await;
    tab_b.close().await;
}

#[tokio::test]
async fn test_close_releases_topics() {
    let fx = Fixture::new();
    let tab_a = fx.open("alice").await;
    let tab_b = fx.open("alice").await;
    let direct = broadcast_topic(&UserId::new("alice"));
    assert_eq!(fx.hub.subscriber_count(&direct), 2);
    assert_eq!(fx.hub.subscriber_count(CHANGE_FEED_TOPIC), 2);

    tab_a.close().await;
    assert_eq!(fx.hub.subscriber_count(&direct), 1);
    tab_a.close().await;

    tab_b.close().await;
    assert_eq!(fx.hub.topic_count(), 0);
}

struct FailingStore;

#[async_trait]
impl BookmarkStore for FailingStore {
    async fn list(&self, _user: &UserId) -> Result<Vec<Bookmark>, StoreError> {
        Err(StoreError::Connectivity("offline".into()))
    }

    async fn create(&self, _user: &UserId, _url: &str, _title: &str) -> Result<Bookmark, StoreError> {
        Err(StoreError::Constraint("rejected".into()))
    }

    async fn delete(&self, _user: &UserId, _id: &str) -> Result<(), StoreError> {
        Err(StoreError::Unauthorized("no".into()))
    }
}

#[tokio::test]
async fn test_store_failures_surface_without_local_change() {
    let fx = Fixture::new();
    let tab = BookmarkSession::open(UserId::new("alice"), Arc::new(FailingStore), fx.hub.clone(), fast_policy()).unwrap();
    assert!(tab.is_loading());

    let err = tab.refresh().await.unwrap_err();
    assert_eq!(err, StoreError::Connectivity("offline".into()));
    assert!(!tab.is_loading());

    let err = tab.add_bookmark("https://example.com", "Nope").await.unwrap_err();
    assert_eq!(err, SessionError::Store(StoreError::Constraint("rejected".into())));
    assert!(tab.snapshot().is_empty());

    let err = tab.delete_bookmark("x").await.unwrap_err();
    assert!(matches!(err, SessionError::Store(StoreError::Unauthorized(_))));
    tab.close().await;
}

/// Reads the rows, then holds the listing until released.
struct StallingList {
    inner: Arc<dyn BookmarkStore>,
    listed: Arc<Notify>,
    release: Arc<Notify>,
}

#[async_trait]
impl BookmarkStore for StallingList {
    async fn list(&self, user: &UserId) -> Result<Vec<Bookmark>, StoreError> {
        let rows = self.inner.list(user).await?;
        self.listed.notify_one();
        self.release.notified().await;
        Ok(rows)
    }

    async fn create(&self, user: &UserId, url: &str, title: &str) -> Result<Bookmark, StoreError> {
        self.inner.create(user, url, title).await
    }

    async fn delete(&self, user: &UserId, id: &str) -> Result<(), StoreError> {
        self.inner.delete(user, id).await
    }
}

#[tokio::test]
async fn test_slow_listing_keeps_bookmark_delivered_meanwhile() {
    let fx = Fixture::new();
    let tab_b = fx.open("alice").await;

    let listed = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let stalling: Arc<dyn BookmarkStore> = Arc::new(StallingList {
        inner: fx.store.clone(),
        listed: listed.clone(),
        release: release.clone(),
    });
    let tab_a = Arc::new(BookmarkSession::open(UserId::new("alice"), stalling, fx.hub.clone(), fast_policy()).unwrap());
    let loading = {
        let tab_a = tab_a.clone();
        tokio::spawn(async move { tab_a.refresh().await })
    };
    tokio::time::timeout(WAIT, listed.notified()).await.unwrap();

    let docs = tab_b.add_bookmark("https://example.com/docs", "Docs").await.unwrap();
    wait_for(&tab_a, |list| count(list, &docs.id) == 1).await;

    release.notify_one();
    loading.await.unwrap().unwrap();
    assert_eq!(count(&tab_a.snapshot(), &docs.id), 1);
    assert!(!tab_a.is_loading());

    tab_a.close().await;
    tab_b.close().await;
}

#[tokio::test]
async fn test_lagged_listener_resyncs_to_store_contents() {
    let fx = Fixture::with_capacity(1);
    let tab = fx.open("alice").await;

    // Written back to back without yielding: the feed keeps only the last one.
    let user = UserId::new("alice");
    for n in 0..10 {
        fx.store
            .create(&user, &format!("https://example.com/{}", n), &format!("Burst {}", n))
            .await
            .unwrap();
    }
    wait_for(&tab, |list| list.len() == 10).await;

    let mut expected: Vec<String> = fx.store.list(&user).await.unwrap().into_iter().map(|b| b.id).collect();
    let mut actual: Vec<String> = tab.snapshot().into_iter().map(|b| b.id).collect();
    expected.sort();
    actual.sort();
    assert_eq!(actual, expected);

    tab.close().await;
}
