//! Hosted realtime transport.
//!
//! One websocket per signed-in user to the backend's realtime endpoint,
//! speaking the Phoenix channel protocol with JSON frames
//! (`{"topic","event","payload","ref","join_ref"}`). Each local topic is
//! joined upstream once, however many sessions of this process subscribe to
//! it; frames coming back are fanned out to them through a
//! `tokio::sync::broadcast` channel, the same way [`LocalHub`] does.
//!
//! The direct topic joins `realtime:bookmarks-broadcast-<user>` with
//! `self: false`, so the server never echoes our own broadcasts and sibling
//! sessions of this process are served locally. The change feed joins
//! `realtime:bookmarks-pg-<user>` with a `postgres_changes` subscription on
//! `public.bookmarks`: rows written by any device arrive here.
//!
//! A dropped socket is reopened with the [`ReconnectPolicy`] delays (the last
//! one repeating) and every held topic is joined again. Each acknowledged
//! join is announced to subscribers as [`ChannelPayload::Joined`] so they
//! refetch what they may have missed.
//!
//! [`LocalHub`]: super::LocalHub

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace, warn};
use url::Url;

use super::topics::{change_feed_subscription, CHANGE_FEED_TOPIC};
use super::{RealtimeTransport, ReconnectPolicy};
use crate::services::auth::AccessToken;
use crate::types::bookmark::Bookmark;
use crate::types::errors::ChannelError;
use crate::types::events::{BroadcastMessage, ChangeFeedEvent, ChangeKind, ChannelPayload, Envelope, OldRow};
use crate::types::session::UserId;
use crate::types::settings::RealtimeSettings;

const PHOENIX_TOPIC: &str = "phoenix";
const PROTOCOL_VERSION: &str = "1.0.0";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

/// Builds the websocket URL for a backend base URL such as
/// `https://x.supabase.co`.
pub fn realtime_endpoint(base_url: &str, anon_key: &str) -> Result<Url, ChannelError> {
    let mut url =
        Url::parse(base_url).map_err(|e| ChannelError::Disconnected(format!("bad realtime url '{}': {}", base_url, e)))?;
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    let mut url = url
        .join("realtime/v1/websocket")
        .map_err(|e| ChannelError::Disconnected(e.to_string()))?;
    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => return Err(ChannelError::Disconnected(format!("unsupported realtime scheme: {}", other))),
    };
    url.set_scheme(scheme)
        .map_err(|_| ChannelError::Disconnected(format!("cannot switch {} to {}", base_url, scheme)))?;
    url.query_pairs_mut()
        .clear()
        .append_pair("apikey", anon_key)
        .append_pair("vsn", PROTOCOL_VERSION);
    Ok(url)
}

/// Upstream channel name for a local topic.
pub fn phoenix_topic(topic: &str, user: &UserId) -> String {
    if topic == CHANGE_FEED_TOPIC {
        format!("realtime:{}", change_feed_subscription(user))
    } else {
        format!("realtime:{}", topic)
    }
}

/// `phx_join` payload for a local topic.
pub fn join_payload(topic: &str, token: &AccessToken) -> Value {
    let postgres_changes = if topic == CHANGE_FEED_TOPIC {
        json!([{"event": "*", "schema": "public", "table": "bookmarks"}])
    } else {
        json!([])
    };
    json!({
        "config": {
            "broadcast": {"ack": false, "self": false},
            "presence": {"key": ""},
            "postgres_changes": postgres_changes,
            "private": false,
        },
        "access_token": token.expose(),
    })
}

/// One protocol frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub topic: String,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(rename = "ref", default)]
    pub reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_ref: Option<String>,
}

/// What an incoming frame means to the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Something to hand to the topic's subscribers.
    Payload(ChannelPayload),
    /// Reply to one of our pushes, matched by `ref`.
    Reply { ok: bool },
    /// The server closed or errored the channel.
    ChannelDown,
    Ignored,
}

/// Row image inside a `postgres_changes` frame. The side that does not
/// apply is `{}`, so both are kept loose until the kind is known.
#[derive(Deserialize)]
struct RawChange {
    schema: String,
    table: String,
    #[serde(rename = "eventType")]
    event_type: String,
    #[serde(default)]
    new: Value,
    #[serde(default)]
    old: Value,
}

impl RawChange {
    fn into_event(self) -> Result<Option<ChangeFeedEvent>, ChannelError> {
        let (event_type, new, old) = match self.event_type.as_str() {
            "INSERT" => {
                let row: Bookmark = serde_json::from_value(self.new)
                    .map_err(|e| ChannelError::Malformed(format!("insert row: {}", e)))?;
                (ChangeKind::Insert, Some(row), None)
            }
            "DELETE" => {
                let row: OldRow = serde_json::from_value(self.old)
                    .map_err(|e| ChannelError::Malformed(format!("delete row: {}", e)))?;
                (ChangeKind::Delete, None, Some(row))
            }
            // Rows are never updated by this client.
            _ => return Ok(None),
        };
        Ok(Some(ChangeFeedEvent {
            schema: self.schema,
            table: self.table,
            event_type,
            new,
            old,
        }))
    }
}

/// Interprets a frame addressed to one of our channels.
pub fn decode_frame(frame: &Frame) -> Result<Inbound, ChannelError> {
    match frame.event.as_str() {
        "broadcast" => {
            let message: BroadcastMessage = serde_json::from_value(frame.payload.clone())
                .map_err(|e| ChannelError::Malformed(format!("broadcast: {}", e)))?;
            Ok(Inbound::Payload(ChannelPayload::Broadcast(message)))
        }
        "postgres_changes" => {
            let data = frame
                .payload
                .get("data")
                .cloned()
                .ok_or_else(|| ChannelError::Malformed("postgres_changes without data".into()))?;
            let raw: RawChange =
                serde_json::from_value(data).map_err(|e| ChannelError::Malformed(format!("postgres_changes: {}", e)))?;
            Ok(raw
                .into_event()?
                .map_or(Inbound::Ignored, |change| Inbound::Payload(ChannelPayload::PostgresChanges(change))))
        }
        "phx_reply" => {
            let ok = frame.payload.get("status").and_then(Value::as_str) == Some("ok");
            Ok(Inbound::Reply { ok })
        }
        "phx_close" | "phx_error" => Ok(Inbound::ChannelDown),
        _ => Ok(Inbound::Ignored),
    }
}

/// Connection parameters for [`SocketTransport::connect`].
#[derive(Clone)]
pub struct SocketConfig {
    pub endpoint: Url,
    pub access_token: AccessToken,
    pub heartbeat: Duration,
    pub policy: ReconnectPolicy,
    pub capacity: usize,
}

impl SocketConfig {
    pub fn new(endpoint: Url, access_token: AccessToken, settings: &RealtimeSettings) -> Self {
        Self {
            endpoint,
            access_token,
            heartbeat: Duration::from_secs(settings.heartbeat_secs.max(1)),
            policy: ReconnectPolicy::from(settings),
            capacity: settings.channel_capacity.max(1),
        }
    }
}

enum Command {
    Join(String),
    Leave(String),
    Send { topic: String, message: BroadcastMessage },
}

/// Topics held by local subscribers.
struct Registry {
    user: UserId,
    capacity: usize,
    topics: Mutex<HashMap<String, broadcast::Sender<Envelope>>>,
}

impl Registry {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, broadcast::Sender<Envelope>>> {
        self.topics.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn names(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    fn holds(&self, topic: &str) -> bool {
        self.lock().contains_key(topic)
    }

    fn deliver(&self, topic: &str, payload: ChannelPayload) {
        if let Some(sender) = self.lock().get(topic) {
            let reached = sender.send(Envelope { sender: None, payload }).unwrap_or(0);
            trace!(topic, reached, "delivered realtime frame");
        }
    }
}

/// Realtime transport over the backend's websocket. Create it inside a
/// Tokio runtime; dropping it closes the socket.
pub struct SocketTransport {
    registry: Arc<Registry>,
    commands: mpsc::UnboundedSender<Command>,
}

impl SocketTransport {
    /// Starts the connection task for `user`. Returns immediately; topics
    /// subscribed before the socket is up are joined once it is.
    pub fn connect(config: SocketConfig, user: UserId) -> Self {
        let registry = Arc::new(Registry {
            user,
            capacity: config.capacity,
            topics: Mutex::new(HashMap::new()),
        });
        let (commands, rx) = mpsc::unbounded_channel();
        tokio::spawn(run(registry.clone(), config, rx));
        Self { registry, commands }
    }

    /// Number of local subscriptions on `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.registry
            .lock()
            .get(topic)
            .map_or(0, broadcast::Sender::receiver_count)
    }
}

impl RealtimeTransport for SocketTransport {
    fn subscribe(&self, topic: &str) -> Result<broadcast::Receiver<Envelope>, ChannelError> {
        let mut topics = self.registry.lock();
        if let Some(sender) = topics.get(topic) {
            return Ok(sender.subscribe());
        }
        self.commands
            .send(Command::Join(topic.to_string()))
            .map_err(|_| ChannelError::Closed(topic.to_string()))?;
        let (sender, rx) = broadcast::channel(self.registry.capacity);
        topics.insert(topic.to_string(), sender);
        debug!(topic, "realtime topic requested");
        Ok(rx)
    }

    fn publish(&self, topic: &str, envelope: Envelope) -> Result<usize, ChannelError> {
        let message = match &envelope.payload {
            ChannelPayload::Broadcast(message) => message.clone(),
            _ => return Err(ChannelError::Unsupported(format!("only broadcasts can be sent on {}", topic))),
        };
        let reached = {
            let topics = self.registry.lock();
            let sender = topics
                .get(topic)
                .ok_or_else(|| ChannelError::NoSubscribers(topic.to_string()))?;
            // Siblings in this process; the server skips our own socket.
            sender.send(envelope).unwrap_or(0)
        };
        self.commands
            .send(Command::Send {
                topic: topic.to_string(),
                message,
            })
            .map_err(|_| ChannelError::Closed(topic.to_string()))?;
        Ok(reached)
    }

    fn release(&self, topic: &str) {
        let mut topics = self.registry.lock();
        if topics.get(topic).is_some_and(|s| s.receiver_count() == 0) {
            topics.remove(topic);
            let _ = self.commands.send(Command::Leave(topic.to_string()));
            debug!(topic, "realtime topic released");
        }
    }
}

enum Exit {
    Shutdown,
    Dropped(ChannelError),
}

async fn run(registry: Arc<Registry>, config: SocketConfig, mut commands: mpsc::UnboundedReceiver<Command>) {
    let mut attempt: u32 = 0;
    loop {
        match connect_async(config.endpoint.as_str()).await {
            Ok((stream, _)) => {
                info!(attempt, "realtime connected");
                attempt = 0;
                let connection = Connection {
                    registry: registry.clone(),
                    token: config.access_token.clone(),
                    next_ref: 0,
                    joined: HashMap::new(),
                    pending_joins: HashMap::new(),
                    heartbeat_ref: None,
                };
                match connection.drive(stream, &mut commands, config.heartbeat).await {
                    Exit::Shutdown => {
                        info!("realtime transport shut down");
                        return;
                    }
                    Exit::Dropped(e) => warn!(error = %e, "realtime connection dropped"),
                }
            }
            Err(e) => warn!(attempt, error = %e, "realtime connect failed"),
        }

        let delay = config.policy.delay(attempt.min(config.policy.max_attempts.saturating_sub(1)));
        attempt = attempt.saturating_add(1);
        if !wait_disconnected(delay, &mut commands).await {
            return;
        }
    }
}

/// Sleeps through a reconnect delay. Joins and leaves are picked up from the
/// registry on reconnect; broadcasts have nowhere to go. Returns false once
/// the transport is gone.
async fn wait_disconnected(delay: Duration, commands: &mut mpsc::UnboundedReceiver<Command>) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return true,
            command = commands.recv() => match command {
                None => return false,
                Some(Command::Send { topic, message }) => {
                    debug!(topic = %topic, event = message.event_name(), "realtime offline; broadcast dropped");
                }
                Some(_) => {}
            },
        }
    }
}

struct Connection {
    registry: Arc<Registry>,
    token: AccessToken,
    next_ref: u64,
    /// Upstream channel name → (local topic, join ref).
    joined: HashMap<String, (String, String)>,
    /// Join ref → local topic, until the server replies.
    pending_joins: HashMap<String, String>,
    heartbeat_ref: Option<String>,
}

impl Connection {
    async fn drive(
        mut self,
        stream: WsStream,
        commands: &mut mpsc::UnboundedReceiver<Command>,
        heartbeat_every: Duration,
    ) -> Exit {
        let (mut sink, mut source) = stream.split();
        for topic in self.registry.names() {
            if let Err(e) = self.join(&mut sink, &topic).await {
                return Exit::Dropped(e);
            }
        }

        let mut heartbeat = tokio::time::interval(heartbeat_every);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        heartbeat.tick().await;

        loop {
            let step = tokio::select! {
                _ = heartbeat.tick() => self.heartbeat(&mut sink).await,
                command = commands.recv() => match command {
                    None => {
                        let _ = sink.send(Message::Close(None)).await;
                        return Exit::Shutdown;
                    }
                    Some(command) => self.command(&mut sink, command).await,
                },
                message = source.next() => match message {
                    Some(Ok(Message::Text(text))) => self.receive(&text),
                    Some(Ok(Message::Ping(data))) => send_raw(&mut sink, Message::Pong(data)).await,
                    Some(Ok(Message::Close(_))) | None => Err(ChannelError::Disconnected("closed by server".into())),
                    Some(Ok(_)) => Ok(()),
                    Some(Err(e)) => Err(ChannelError::Disconnected(e.to_string())),
                },
            };
            if let Err(e) = step {
                return Exit::Dropped(e);
            }
        }
    }

    fn next_ref(&mut self) -> String {
        self.next_ref += 1;
        self.next_ref.to_string()
    }

    async fn heartbeat(&mut self, sink: &mut WsSink) -> Result<(), ChannelError> {
        if self.heartbeat_ref.is_some() {
            return Err(ChannelError::Disconnected("heartbeat timed out".into()));
        }
        let reference = self.next_ref();
        self.heartbeat_ref = Some(reference.clone());
        let frame = Frame {
            topic: PHOENIX_TOPIC.to_string(),
            event: "heartbeat".to_string(),
            payload: json!({}),
            reference: Some(reference),
            join_ref: None,
        };
        send_frame(sink, &frame).await
    }

    async fn command(&mut self, sink: &mut WsSink, command: Command) -> Result<(), ChannelError> {
        match command {
            Command::Join(topic) => {
                let upstream = phoenix_topic(&topic, &self.registry.user);
                if self.joined.contains_key(&upstream) || !self.registry.holds(&topic) {
                    return Ok(());
                }
                self.join(sink, &topic).await
            }
            Command::Leave(topic) => {
                if self.registry.holds(&topic) {
                    return Ok(());
                }
                let upstream = phoenix_topic(&topic, &self.registry.user);
                let Some((_, join_ref)) = self.joined.remove(&upstream) else {
                    return Ok(());
                };
                let frame = Frame {
                    topic: upstream,
                    event: "phx_leave".to_string(),
                    payload: json!({}),
                    reference: Some(self.next_ref()),
                    join_ref: Some(join_ref),
                };
                send_frame(sink, &frame).await
            }
            Command::Send { topic, message } => {
                let upstream = phoenix_topic(&topic, &self.registry.user);
                let Some((_, join_ref)) = self.joined.get(&upstream).cloned() else {
                    debug!(topic = %topic, "broadcast before join; dropped");
                    return Ok(());
                };
                let mut payload =
                    serde_json::to_value(&message).map_err(|e| ChannelError::Malformed(e.to_string()))?;
                payload["type"] = json!("broadcast");
                let frame = Frame {
                    topic: upstream,
                    event: "broadcast".to_string(),
                    payload,
                    reference: Some(self.next_ref()),
                    join_ref: Some(join_ref),
                };
                send_frame(sink, &frame).await
            }
        }
    }

    async fn join(&mut self, sink: &mut WsSink, topic: &str) -> Result<(), ChannelError> {
        let upstream = phoenix_topic(topic, &self.registry.user);
        let reference = self.next_ref();
        self.joined
            .insert(upstream.clone(), (topic.to_string(), reference.clone()));
        self.pending_joins.insert(reference.clone(), topic.to_string());
        let frame = Frame {
            topic: upstream,
            event: "phx_join".to_string(),
            payload: join_payload(topic, &self.token),
            reference: Some(reference.clone()),
            join_ref: Some(reference),
        };
        debug!(topic, "joining realtime channel");
        send_frame(sink, &frame).await
    }

    fn receive(&mut self, text: &str) -> Result<(), ChannelError> {
        let frame: Frame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "unreadable realtime frame");
                return Ok(());
            }
        };

        if frame.topic == PHOENIX_TOPIC {
            if frame.reference.is_some() && frame.reference == self.heartbeat_ref {
                self.heartbeat_ref = None;
            }
            return Ok(());
        }

        let Some((topic, _)) = self.joined.get(&frame.topic).cloned() else {
            trace!(topic = %frame.topic, event = %frame.event, "frame for a channel we left");
            return Ok(());
        };

        match decode_frame(&frame) {
            Ok(Inbound::Payload(payload)) => self.registry.deliver(&topic, payload),
            Ok(Inbound::Reply { ok }) => {
                let Some(joined) = frame.reference.as_ref().and_then(|r| self.pending_joins.remove(r)) else {
                    return Ok(());
                };
                if ok {
                    info!(topic = %joined, "realtime channel joined");
                    self.registry.deliver(&joined, ChannelPayload::Joined);
                } else {
                    warn!(topic = %joined, reply = %frame.payload, "realtime join rejected");
                }
            }
            Ok(Inbound::ChannelDown) => {
                return Err(ChannelError::Disconnected(format!("{} on {}", frame.event, frame.topic)));
            }
            Ok(Inbound::Ignored) => trace!(topic = %frame.topic, event = %frame.event, "ignored realtime frame"),
            Err(e) => warn!(topic = %topic, error = %e, "undecodable realtime frame"),
        }
        Ok(())
    }
}

async fn send_frame(sink: &mut WsSink, frame: &Frame) -> Result<(), ChannelError> {
    let text = serde_json::to_string(frame).map_err(|e| ChannelError::Malformed(e.to_string()))?;
    send_raw(sink, Message::Text(text)).await
}

async fn send_raw(sink: &mut WsSink, message: Message) -> Result<(), ChannelError> {
    sink.send(message)
        .await
        .map_err(|e| ChannelError::Disconnected(e.to_string()))
}
