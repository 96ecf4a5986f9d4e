//! Unit tests for the embedded store, its schema and its change feed.

use std::sync::Arc;

use marksync::database::migrations::{get_schema_version, CURRENT_SCHEMA_VERSION};
use marksync::database::Database;
use marksync::realtime::topics::CHANGE_FEED_TOPIC;
use marksync::realtime::{LocalHub, RealtimeTransport};
use marksync::store::{BookmarkStore, ChangeFeedStore, SqliteStore};
use marksync::types::errors::StoreError;
use marksync::types::events::{ChangeKind, ChannelPayload};
use marksync::types::session::UserId;
use tempfile::TempDir;

fn store() -> SqliteStore {
    SqliteStore::new(Arc::new(Database::open_in_memory().expect("in-memory db")))
}

fn alice() -> UserId {
    UserId::new("alice")
}

#[test]
fn test_migrations_reach_current_version() {
    let db = Database::open_in_memory().unwrap();
    assert_eq!(get_schema_version(&db.connection()), CURRENT_SCHEMA_VERSION);
}

#[test]
fn test_reopen_file_keeps_rows_and_version() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("marksync.db");
    let rt = tokio::runtime::Runtime::new().unwrap();

    let created = {
        let store = SqliteStore::new(Arc::new(Database::open(&path).unwrap()));
        rt.block_on(store.create(&alice(), "https://example.com", "Example")).unwrap()
    };

    let db = Database::open(&path).unwrap();
    assert_eq!(get_schema_version(&db.connection()), CURRENT_SCHEMA_VERSION);
    let listed = rt.block_on(SqliteStore::new(Arc::new(db)).list(&alice())).unwrap();
    assert_eq!(listed, vec![created]);
}

#[tokio::test]
async fn test_create_returns_populated_record() {
    let store = store();
    let bm = store.create(&alice(), "https://example.com/docs", "Docs").await.unwrap();
    assert!(!bm.id.is_empty());
    assert_eq!(bm.user_id, "alice");
    assert_eq!(bm.url, "https://example.com/docs");
    assert_eq!(bm.title, "Docs");
}

#[tokio::test]
async fn test_list_is_newest_first_and_scoped_to_owner() {
    let store = store();
    let first = store.create(&alice(), "https://a.example", "A").await.unwrap();
    let second = store.create(&alice(), "https://b.example", "B").await.unwrap();
    store.create(&UserId::new("bob"), "https://c.example", "C").await.unwrap();

    let listed = store.list(&alice()).await.unwrap();
    let ids: Vec<&str> = listed.iter().map(|b| b.id.as_str()).collect();
    assert_eq!(ids, vec![second.id.as_str(), first.id.as_str()]);
}

#[tokio::test]
async fn test_delete_requires_ownership() {
    let store = store();
    let bm = store.create(&alice(), "https://a.example", "A").await.unwrap();

    let err = store.delete(&UserId::new("bob"), &bm.id).await.unwrap_err();
    assert!(matches!(err, StoreError::NotFound(_)));
    assert_eq!(store.list(&alice()).await.unwrap().len(), 1);

    store.delete(&alice(), &bm.id).await.unwrap();
    assert!(store.list(&alice()).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_delete_missing_is_not_found() {
    let err = store().delete(&alice(), "no-such-id").await.unwrap_err();
    assert_eq!(err, StoreError::NotFound("no-such-id".to_string()));
}

#[tokio::test]
async fn test_blank_title_violates_constraint() {
    let err = store().create(&alice(), "https://a.example", "   ").await.unwrap_err();
    assert!(matches!(err, StoreError::Constraint(_)));
}

#[tokio::test]
async fn test_change_feed_follows_durable_writes() {
    let hub = Arc::new(LocalHub::new(16));
    let mut rx = hub.subscribe(CHANGE_FEED_TOPIC).unwrap();
    let transport: Arc<dyn RealtimeTransport> = hub.clone();
    let store = ChangeFeedStore::new(store(), transport);

    let bm = store.create(&alice(), "https://a.example", "A").await.unwrap();
    store.delete(&alice(), &bm.id).await.unwrap();
    // Failed writes publish nothing.
    assert!(store.delete(&alice(), &bm.id).await.is_err());
    assert!(store.create(&alice(), "https://a.example", "").await.is_err());

    let insert = rx.recv().await.unwrap();
    assert!(insert.sender.is_none());
    match insert.payload {
        ChannelPayload::PostgresChanges(change) => {
            assert_eq!(change.event_type, ChangeKind::Insert);
            assert_eq!(change.new.as_ref(), Some(&bm));
        }
        other => panic!("unexpected payload: {:?}", other),
    }

    match rx.recv().await.unwrap().payload {
        ChannelPayload::PostgresChanges(change) => {
            assert_eq!(change.event_type, ChangeKind::Delete);
            assert_eq!(change.old.unwrap().id, bm.id);
        }
        other => panic!("unexpected payload: {:?}", other),
    }

    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_change_feed_without_listeners_still_writes() {
    let transport: Arc<dyn RealtimeTransport> = Arc::new(LocalHub::default());
    let store = ChangeFeedStore::new(store(), transport);
    store.create(&alice(), "https://a.example", "A").await.unwrap();
    assert_eq!(store.inner().list(&alice()).await.unwrap().len(), 1);
}
