//! RPC method handler for the marksync JSON-RPC protocol.
//!
//! Kept apart from `rpc_server.rs` so it can be unit-tested without stdio.
//! [`RpcContext::handle_method`] dispatches one call; sessions opened through
//! it push a `bookmarks.changed` notification on the context's notification
//! channel whenever their list changes.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::app::App;
use crate::managers::session_manager::BookmarkSession;
use crate::services::auth::{AccessToken, SIGN_IN_PATH};
use crate::services::settings_engine::SettingsEngineTrait;
use crate::types::errors::{AuthError, SessionError, SessionOpenError, SettingsError, StoreError};
use crate::types::session::UserId;
use crate::types::validation::Field;
use crate::view::{delete_failure_message, ListView};

/// Event name of the list push notification.
pub const BOOKMARKS_CHANGED: &str = "bookmarks.changed";

/// Error result of an RPC call, serialized as the `error` member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcError {
    /// Missing or malformed parameters, unknown method or session.
    BadRequest(String),
    /// Field-level validation messages.
    Validation(BTreeMap<Field, String>),
    /// A single user-visible store message.
    Store(String),
    /// No usable identity; the view goes to the sign-in page.
    Unauthenticated,
    /// Identity provider or channel failure.
    Internal(String),
}

impl RpcError {
    pub fn to_value(&self) -> Value {
        match self {
            RpcError::BadRequest(msg) => json!({"kind": "bad_request", "message": msg}),
            RpcError::Validation(fields) => json!({"kind": "validation", "fields": fields}),
            RpcError::Store(msg) => json!({"kind": "store", "message": msg}),
            RpcError::Unauthenticated => json!({"kind": "unauthenticated", "redirect": SIGN_IN_PATH}),
            RpcError::Internal(msg) => json!({"kind": "internal", "message": msg}),
        }
    }
}

impl From<AuthError> for RpcError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Unauthenticated => RpcError::Unauthenticated,
            other => RpcError::Internal(other.to_string()),
        }
    }
}

impl From<StoreError> for RpcError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unauthorized(_) => RpcError::Unauthenticated,
            other => RpcError::Store(other.to_string()),
        }
    }
}

impl From<SessionError> for RpcError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::Validation(v) => RpcError::Validation(v.result.errors),
            SessionError::Store(e) => e.into(),
        }
    }
}

impl From<SettingsError> for RpcError {
    fn from(err: SettingsError) -> Self {
        match err {
            SettingsError::InvalidKey(_) | SettingsError::InvalidValue(_) => RpcError::BadRequest(err.to_string()),
            other => RpcError::Internal(other.to_string()),
        }
    }
}

impl From<SessionOpenError> for RpcError {
    fn from(err: SessionOpenError) -> Self {
        match err {
            SessionOpenError::Auth(e) => e.into(),
            SessionOpenError::Channel(e) => RpcError::Internal(e.to_string()),
        }
    }
}

/// An open session plus the task forwarding its list changes.
struct HostedSession {
    session: Arc<BookmarkSession>,
    forwarder: JoinHandle<()>,
}

/// Everything the RPC methods operate on.
pub struct RpcContext {
    app: tokio::sync::Mutex<App>,
    sessions: Mutex<HashMap<String, HostedSession>>,
    notifications: mpsc::UnboundedSender<Value>,
}

impl RpcContext {
    /// Wraps `app`. Push notifications are delivered on the returned receiver.
    pub fn new(app: App) -> (Self, mpsc::UnboundedReceiver<Value>) {
        let (notifications, rx) = mpsc::unbounded_channel();
        let ctx = Self {
            app: tokio::sync::Mutex::new(app),
            sessions: Mutex::new(HashMap::new()),
            notifications,
        };
        (ctx, rx)
    }

    /// Whether a call may run alongside others. Bookmark calls only touch
    /// their own session; auth, settings and session lifecycle calls keep
    /// request order.
    pub fn runs_concurrently(method: &str) -> bool {
        method.starts_with("bookmark.")
    }

    pub fn session_count(&self) -> usize {
        self.lock_sessions().len()
    }

    /// Dispatch a JSON-RPC method call to the appropriate handler.
    pub async fn handle_method(&self, method: &str, params: &Value) -> Result<Value, RpcError> {
        debug!(method, "rpc call");
        match method {
            "ping" => Ok(json!({"pong": true})),

            // ─── Auth ───
            "auth.sign_in_url" => {
                let provider = str_param(params, "provider").unwrap_or("google");
                let redirect_to = required(params, "redirect_to")?;
                let app = self.app.lock().await;
                let url = app.sign_in_url(provider, redirect_to)?;
                Ok(json!({"url": url}))
            }
            "auth.sign_in" => {
                let mut app = self.app.lock().await;
                let previous = app.current_user().ok();
                let user = if let Some(token) = str_param(params, "access_token") {
                    app.sign_in_with_token(AccessToken::new(token)).await?
                } else {
                    let user = UserId::new(required(params, "user_id")?);
                    app.sign_in_local(user.clone())?;
                    user
                };
                drop(app);
                // Sessions belong to the identity that opened them.
                if previous.is_some_and(|p| p != user) {
                    self.close_all().await;
                }
                Ok(json!({"user_id": user}))
            }
            "auth.sign_out" => {
                self.close_all().await;
                let mut app = self.app.lock().await;
                app.sign_out().await?;
                Ok(json!({"ok": true, "redirect": SIGN_IN_PATH}))
            }

            // ─── Settings ───
            // Backend and realtime changes apply on the next start.
            "settings.get" => {
                let app = self.app.lock().await;
                serde_json::to_value(app.settings.get_settings()).map_err(|e| RpcError::Internal(e.to_string()))
            }
            "settings.set" => {
                let key = required(params, "key")?;
                let value = params
                    .get("value")
                    .cloned()
                    .ok_or_else(|| RpcError::BadRequest("missing value".into()))?;
                let mut app = self.app.lock().await;
                app.settings.set_value(key, value)?;
                info!(key, "setting updated");
                Ok(json!({"ok": true}))
            }
            "settings.reset" => {
                let mut app = self.app.lock().await;
                app.settings.reset()?;
                Ok(json!({"ok": true}))
            }

            // ─── Sessions ───
            "session.open" => {
                let app = self.app.lock().await;
                let (session, load_error) = app.open_session().await?;
                drop(app);

                let session = Arc::new(session);
                let id = session.id().to_string();
                let mut result = json!(ListView::of(&session));
                result["session"] = json!(id);
                result["error"] = json!(load_error);
                let forwarder = self.spawn_forwarder(session.clone());
                self.lock_sessions()
                    .insert(id.clone(), HostedSession { session, forwarder });
                info!(session = %id, "rpc session opened");
                Ok(result)
            }
            "session.close" => {
                let id = required(params, "session")?;
                let hosted = self
                    .lock_sessions()
                    .remove(id)
                    .ok_or_else(|| RpcError::BadRequest(format!("unknown session: {}", id)))?;
                close_hosted(hosted).await;
                Ok(json!({"ok": true}))
            }

            // ─── Bookmarks ───
            "bookmark.list" => {
                let session = self.session(params)?;
                Ok(json!(ListView::of(&session)))
            }
            "bookmark.refresh" => {
                let session = self.session(params)?;
                session.refresh().await?;
                Ok(json!(ListView::of(&session)))
            }
            "bookmark.add" => {
                let session = self.session(params)?;
                let url = str_param(params, "url").unwrap_or("");
                let title = str_param(params, "title").unwrap_or("");
                let bookmark = session.add_bookmark(url, title).await?;
                Ok(json!(bookmark))
            }
            "bookmark.delete" => {
                let session = self.session(params)?;
                let id = required(params, "id")?;
                match session.delete_bookmark(id).await {
                    Ok(()) => Ok(json!({"ok": true})),
                    Err(SessionError::Store(StoreError::Unauthorized(_))) => Err(RpcError::Unauthenticated),
                    Err(SessionError::Store(e)) => Err(RpcError::Store(delete_failure_message(&e))),
                    Err(e) => Err(e.into()),
                }
            }

            _ => Err(RpcError::BadRequest(format!("unknown method: {}", method))),
        }
    }

    /// Closes every hosted session.
    pub async fn close_all(&self) {
        let hosted: Vec<HostedSession> = self.lock_sessions().drain().map(|(_, h)| h).collect();
        for h in hosted {
            close_hosted(h).await;
        }
    }

    fn session(&self, params: &Value) -> Result<Arc<BookmarkSession>, RpcError> {
        let id = required(params, "session")?;
        self.lock_sessions()
            .get(id)
            .map(|h| h.session.clone())
            .ok_or_else(|| RpcError::BadRequest(format!("unknown session: {}", id)))
    }

    fn spawn_forwarder(&self, session: Arc<BookmarkSession>) -> JoinHandle<()> {
        let notifications = self.notifications.clone();
        let mut changes = session.changes();
        tokio::spawn(async move {
            while changes.changed().await.is_ok() {
                let mut push = json!(ListView::of(&session));
                push["event"] = json!(BOOKMARKS_CHANGED);
                push["session"] = json!(session.id());
                if notifications.send(push).is_err() {
                    warn!(session = %session.id(), "notification receiver gone");
                    break;
                }
            }
        })
    }

    fn lock_sessions(&self) -> MutexGuard<'_, HashMap<String, HostedSession>> {
        self.sessions.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

async fn close_hosted(hosted: HostedSession) {
    hosted.forwarder.abort();
    let _ = hosted.forwarder.await;
    hosted.session.close().await;
}

fn str_param<'a>(params: &'a Value, key: &str) -> Option<&'a str> {
    params.get(key).and_then(|v| v.as_str())
}

fn required<'a>(params: &'a Value, key: &str) -> Result<&'a str, RpcError> {
    str_param(params, key).ok_or_else(|| RpcError::BadRequest(format!("missing {}", key)))
}
