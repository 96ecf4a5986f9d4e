//! Tests for the hosted realtime transport against a local websocket server
//! that answers joins and heartbeats and pushes whatever the test asks it to.

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

use marksync::database::Database;
use marksync::managers::session_manager::BookmarkSession;
use marksync::realtime::socket::realtime_endpoint;
use marksync::realtime::topics::{broadcast_topic, CHANGE_FEED_TOPIC};
use marksync::realtime::{RealtimeTransport, ReconnectPolicy, SocketConfig, SocketTransport};
use marksync::services::auth::AccessToken;
use marksync::store::{BookmarkStore, SqliteStore};
use marksync::types::bookmark::{Bookmark, BookmarkId};
use marksync::types::errors::ChannelError;
use marksync::types::events::{BookmarkEvent, BroadcastMessage, ChannelPayload, Envelope};
use marksync::types::session::{SessionId, UserId};

const WAIT: Duration = Duration::from_secs(3);

enum Control {
    Push(Value),
    Disconnect,
}

struct FakeRealtime {
    base_url: String,
    frames: UnboundedReceiver<Value>,
    control: UnboundedSender<Control>,
}

impl FakeRealtime {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());
        let (frames_tx, frames) = mpsc::unbounded_channel();
        let (control, mut control_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let Ok(ws) = accept_async(stream).await else { continue };
                let (mut sink, mut source) = ws.split();
                loop {
                    tokio::select! {
                        control = control_rx.recv() => match control {
                            Some(Control::Push(frame)) => {
                                let _ = sink.send(Message::Text(frame.to_string())).await;
                            }
                            Some(Control::Disconnect) => {
                                let _ = sink.close().await;
                                break;
                            }
                            None => return,
                        },
                        message = source.next() => match message {
                            Some(Ok(Message::Text(text))) => {
                                let frame: Value = serde_json::from_str(&text).unwrap();
                                if frame["event"] == "phx_join" || frame["event"] == "heartbeat" {
                                    let reply = json!({
                                        "topic": frame["topic"],
                                        "event": "phx_reply",
                                        "payload": {"status": "ok", "response": {}},
                                        "ref": frame["ref"],
                                        "join_ref": frame["join_ref"],
                                    });
                                    let _ = sink.send(Message::Text(reply.to_string())).await;
                                }
                                let _ = frames_tx.send(frame);
                            }
                            Some(Ok(_)) => {}
                            _ => break,
                        },
                    }
                }
            }
        });

        Self { base_url, frames, control }
    }

    fn push(&self, frame: Value) {
        self.control.send(Control::Push(frame)).unwrap();
    }

    fn disconnect(&self) {
        self.control.send(Control::Disconnect).unwrap();
    }

    /// Next frame the client sent with this event name.
    async fn expect(&mut self, event: &str) -> Value {
        tokio::time::timeout(WAIT, async {
            loop {
                let frame = self.frames.recv().await.expect("server stopped");
                if frame["event"] == event {
                    return frame;
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("no {} frame", event))
    }

    fn transport(&self, user: &str) -> SocketTransport {
        let config = SocketConfig {
            endpoint: realtime_endpoint(&self.base_url, "anon").unwrap(),
            access_token: AccessToken::new("a.b.c"),
            heartbeat: Duration::from_secs(30),
            policy: ReconnectPolicy {
                base: Duration::from_millis(10),
                max: Duration::from_millis(40),
                max_attempts: 3,
            },
            capacity: 16,
        };
        SocketTransport::connect(config, UserId::new(user))
    }
}

fn bookmark(id: &str, owner: &str) -> Bookmark {
    Bookmark {
        id: id.to_string(),
        user_id: owner.to_string(),
        url: "https://example.com".to_string(),
        title: "Example".to_string(),
        created_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
    }
}

fn insert_frame(row: &Bookmark) -> Value {
    json!({
        "topic": format!("realtime:bookmarks-pg-{}", row.user_id),
        "event": "postgres_changes",
        "payload": {"ids": [1], "data": {
            "schema": "public",
            "table": "bookmarks",
            "commit_timestamp": "2024-05-01T12:00:00Z",
            "eventType": "INSERT",
            "new": row,
            "old": {},
            "errors": null
        }},
        "ref": null
    })
}

async fn recv(rx: &mut broadcast::Receiver<Envelope>) -> Envelope {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for envelope")
        .expect("topic closed")
}

async fn expect_joined(rx: &mut broadcast::Receiver<Envelope>) {
    let envelope = recv(rx).await;
    assert_eq!(envelope.payload, ChannelPayload::Joined);
}

#[tokio::test]
async fn test_joins_both_channels_and_delivers_table_changes() {
    let mut server = FakeRealtime::start().await;
    let transport = server.transport("alice");
    let direct = broadcast_topic(&UserId::new("alice"));
    let mut feed_rx = transport.subscribe(CHANGE_FEED_TOPIC).unwrap();
    let mut direct_rx = transport.subscribe(&direct).unwrap();

    let mut joins = vec![server.expect("phx_join").await, server.expect("phx_join").await];
    joins.sort_by_key(|f| f["topic"].as_str().unwrap_or_default().to_string());
    assert_eq!(joins[0]["topic"], "realtime:bookmarks-broadcast-alice");
    assert_eq!(joins[1]["topic"], "realtime:bookmarks-pg-alice");
    assert_eq!(joins[1]["payload"]["config"]["postgres_changes"][0]["table"], "bookmarks");
    assert_eq!(joins[1]["payload"]["access_token"], "a.b.c");
    expect_joined(&mut feed_rx).await;
    expect_joined(&mut direct_rx).await;

    let row = bookmark("bm-1", "alice");
    server.push(insert_frame(&row));
    match recv(&mut feed_rx).await.payload {
        ChannelPayload::PostgresChanges(change) => {
            assert_eq!(change.for_user("alice"), Some(BookmarkEvent::Added(row)));
        }
        other => panic!("unexpected payload: {:?}", other),
    }

    server.push(json!({
        "topic": "realtime:bookmarks-broadcast-alice",
        "event": "broadcast",
        "payload": {"type": "broadcast", "event": "bookmark-deleted", "payload": {"id": "bm-1"}},
        "ref": null
    }));
    let envelope = recv(&mut direct_rx).await;
    assert!(envelope.sender.is_none());
    assert_eq!(
        envelope.payload,
        ChannelPayload::Broadcast(BroadcastMessage::BookmarkDeleted(BookmarkId { id: "bm-1".into() }))
    );
}

#[tokio::test]
async fn test_publish_reaches_siblings_and_server() {
    let mut server = FakeRealtime::start().await;
    let transport = server.transport("alice");
    let direct = broadcast_topic(&UserId::new("alice"));
    let mut rx_a = transport.subscribe(&direct).unwrap();
    let mut rx_b = transport.subscribe(&direct).unwrap();
    server.expect("phx_join").await;
    expect_joined(&mut rx_a).await;
    expect_joined(&mut rx_b).await;

    let sender = SessionId::generate();
    let envelope = Envelope {
        sender: Some(sender.clone()),
        payload: ChannelPayload::Broadcast(BroadcastMessage::BookmarkAdded(bookmark("bm-2", "alice"))),
    };
    assert_eq!(transport.publish(&direct, envelope).unwrap(), 2);
    assert_eq!(recv(&mut rx_b).await.sender, Some(sender));

    let sent = server.expect("broadcast").await;
    assert_eq!(sent["topic"], "realtime:bookmarks-broadcast-alice");
    assert_eq!(sent["payload"]["type"], "broadcast");
    assert_eq!(sent["payload"]["event"], "bookmark-added");
    assert_eq!(sent["payload"]["payload"]["id"], "bm-2");

    let not_a_broadcast = Envelope {
        sender: None,
        payload: ChannelPayload::Joined,
    };
    assert!(matches!(transport.publish(&direct, not_a_broadcast), Err(ChannelError::Unsupported(_))));
    let unheld = Envelope {
        sender: None,
        payload: ChannelPayload::Broadcast(BroadcastMessage::BookmarkDeleted(BookmarkId { id: "bm-2".into() })),
    };
    assert_eq!(
        transport.publish("bookmarks-broadcast-bob", unheld),
        Err(ChannelError::NoSubscribers("bookmarks-broadcast-bob".into()))
    );
}

#[tokio::test]
async fn test_dropped_connection_rejoins_and_announces() {
    let mut server = FakeRealtime::start().await;
    let transport = server.transport("alice");
    let mut feed_rx = transport.subscribe(CHANGE_FEED_TOPIC).unwrap();
    server.expect("phx_join").await;
    expect_joined(&mut feed_rx).await;

    server.disconnect();
    let rejoin = server.expect("phx_join").await;
    assert_eq!(rejoin["topic"], "realtime:bookmarks-pg-alice");
    expect_joined(&mut feed_rx).await;

    // The new connection delivers.
    let row = bookmark("bm-3", "alice");
    server.push(insert_frame(&row));
    assert!(matches!(recv(&mut feed_rx).await.payload, ChannelPayload::PostgresChanges(_)));
}

#[tokio::test]
async fn test_release_leaves_channel_upstream() {
    let mut server = FakeRealtime::start().await;
    let transport = server.transport("alice");
    let direct = broadcast_topic(&UserId::new("alice"));
    let mut rx = transport.subscribe(&direct).unwrap();
    server.expect("phx_join").await;
    expect_joined(&mut rx).await;
    assert_eq!(transport.subscriber_count(&direct), 1);

    drop(rx);
    transport.release(&direct);
    let leave = server.expect("phx_leave").await;
    assert_eq!(leave["topic"], "realtime:bookmarks-broadcast-alice");
    assert_eq!(transport.subscriber_count(&direct), 0);
}

#[tokio::test]
async fn test_session_sees_rows_written_by_another_device() {
    let mut server = FakeRealtime::start().await;
    let db = Arc::new(Database::open_in_memory().unwrap());
    let store: Arc<dyn BookmarkStore> = Arc::new(SqliteStore::new(db));
    let transport: Arc<dyn RealtimeTransport> = Arc::new(server.transport("alice"));
    let policy = ReconnectPolicy {
        base: Duration::from_millis(10),
        max: Duration::from_millis(40),
        max_attempts: 3,
    };
    let session = BookmarkSession::open(UserId::new("alice"), store.clone(), transport, policy).unwrap();
    session.refresh().await.unwrap();
    server.expect("phx_join").await;
    server.expect("phx_join").await;

    // Another device writes; only the backend's change feed tells us.
    let row = store.create(&UserId::new("alice"), "https://example.com/elsewhere", "Elsewhere").await.unwrap();
    server.push(insert_frame(&row));
    server.push(insert_frame(&bookmark("not-mine", "bob")));

    let mut changes = session.changes();
    tokio::time::timeout(WAIT, async {
        while !session.snapshot().iter().any(|b| b.id == row.id) {
            changes.changed().await.unwrap();
        }
    })
    .await
    .expect("row from another device never arrived");
    assert_eq!(session.snapshot().len(), 1);

    session.close().await;
}
