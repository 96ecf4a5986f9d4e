//! Unit tests for the in-process realtime hub and the channel wire shapes.

use chrono::{TimeZone, Utc};
use marksync::realtime::{LocalHub, RealtimeTransport, ReconnectPolicy};
use marksync::types::bookmark::{Bookmark, BookmarkId};
use marksync::types::errors::ChannelError;
use marksync::types::events::{
    BookmarkEvent, BroadcastMessage, ChangeFeedEvent, ChannelPayload, Envelope, BOOKMARK_ADDED,
    BOOKMARK_DELETED,
};
use marksync::types::session::SessionId;
use marksync::types::settings::RealtimeSettings;
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;

fn bookmark(id: &str, owner: &str) -> Bookmark {
    Bookmark {
        id: id.to_string(),
        user_id: owner.to_string(),
        url: "https://example.com".to_string(),
        title: "Example".to_string(),
        created_at: Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap(),
    }
}

fn deleted(id: &str) -> Envelope {
    Envelope {
        sender: None,
        payload: ChannelPayload::Broadcast(BroadcastMessage::BookmarkDeleted(BookmarkId { id: id.to_string() })),
    }
}

// ─── Hub ───

#[tokio::test]
async fn test_publish_reaches_every_subscriber() {
    let hub = LocalHub::new(8);
    let mut a = hub.subscribe("t").unwrap();
    let mut b = hub.subscribe("t").unwrap();
    assert_eq!(hub.subscriber_count("t"), 2);

    assert_eq!(hub.publish("t", deleted("x")).unwrap(), 2);
    assert_eq!(a.recv().await.unwrap(), deleted("x"));
    assert_eq!(b.recv().await.unwrap(), deleted("x"));
}

#[test]
fn test_publish_without_subscribers() {
    let hub = LocalHub::new(8);
    assert_eq!(hub.publish("nobody", deleted("x")), Err(ChannelError::NoSubscribers("nobody".into())));

    let rx = hub.subscribe("t").unwrap();
    drop(rx);
    assert!(matches!(hub.publish("t", deleted("x")), Err(ChannelError::NoSubscribers(_))));
}

#[test]
fn test_release_keeps_topic_while_listened() {
    let hub = LocalHub::new(8);
    let a = hub.subscribe("t").unwrap();
    let _b = hub.subscribe("t").unwrap();
    drop(a);
    hub.release("t");
    assert_eq!(hub.topic_count(), 1);
}

#[test]
fn test_release_drops_idle_topic() {
    let hub = LocalHub::new(8);
    drop(hub.subscribe("t").unwrap());
    hub.release("t");
    assert_eq!(hub.topic_count(), 0);
}

#[tokio::test]
async fn test_slow_receiver_lags() {
    let hub = LocalHub::new(2);
    let mut rx = hub.subscribe("t").unwrap();
    for i in 0..5 {
        hub.publish("t", deleted(&i.to_string())).unwrap();
    }
    assert!(matches!(rx.recv().await, Err(RecvError::Lagged(_))));
}

#[tokio::test]
async fn test_shutdown_closes_receivers() {
    let hub = LocalHub::new(4);
    let mut rx = hub.subscribe("t").unwrap();
    hub.shutdown_topic("t");
    assert!(matches!(rx.recv().await, Err(RecvError::Closed)));
    // A later subscribe opens a fresh topic.
    assert!(hub.subscribe("t").is_ok());
}

// ─── Wire shapes ───

#[test]
fn test_broadcast_wire_shape() {
    let envelope = Envelope {
        sender: Some(SessionId::new("s-1")),
        payload: ChannelPayload::Broadcast(BroadcastMessage::BookmarkDeleted(BookmarkId { id: "bm-1".into() })),
    };
    let value = serde_json::to_value(&envelope).unwrap();
    assert_eq!(
        value,
        json!({"sender": "s-1", "type": "broadcast", "event": "bookmark-deleted", "payload": {"id": "bm-1"}})
    );
    let back: Envelope = serde_json::from_value(value).unwrap();
    assert_eq!(back, envelope);
}

#[test]
fn test_change_feed_wire_shape_parses() {
    let raw = json!({
        "type": "postgres_changes",
        "schema": "public",
        "table": "bookmarks",
        "eventType": "DELETE",
        "old": {"id": "bm-1"}
    });
    let envelope: Envelope = serde_json::from_value(raw).unwrap();
    assert!(envelope.sender.is_none());
    match envelope.payload {
        ChannelPayload::PostgresChanges(change) => {
            assert_eq!(change.for_user("anyone"), Some(BookmarkEvent::Deleted("bm-1".into())));
        }
        other => panic!("unexpected payload: {:?}", other),
    }
}

#[test]
fn test_event_names() {
    let added = BroadcastMessage::from(&BookmarkEvent::Added(bookmark("a", "u")));
    assert_eq!(added.event_name(), BOOKMARK_ADDED);
    let removed = BroadcastMessage::from(&BookmarkEvent::Deleted("a".into()));
    assert_eq!(removed.event_name(), BOOKMARK_DELETED);
    assert_eq!(removed.into_event(), BookmarkEvent::Deleted("a".into()));
}

#[test]
fn test_change_feed_filters_other_owners() {
    assert_eq!(ChangeFeedEvent::insert(bookmark("a", "bob")).for_user("alice"), None);
    assert_eq!(
        ChangeFeedEvent::insert(bookmark("a", "alice")).for_user("alice"),
        Some(BookmarkEvent::Added(bookmark("a", "alice")))
    );
    assert_eq!(ChangeFeedEvent::delete("a", "bob").for_user("alice"), None);
}

// ─── Reconnect policy ───

#[test]
fn test_policy_from_settings() {
    let settings = RealtimeSettings::default();
    let policy = ReconnectPolicy::from(&settings);
    let delays: Vec<u128> = policy.delays().map(|d| d.as_millis()).collect();
    assert_eq!(delays.len(), settings.reconnect_max_attempts as usize);
    assert_eq!(delays[0], settings.reconnect_base_ms as u128);
    assert!(delays.iter().all(|d| *d <= settings.reconnect_max_ms as u128));
    assert!(delays.windows(2).all(|w| w[0] <= w[1]));
}
