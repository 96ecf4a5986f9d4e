//! App core for marksync.
//!
//! Holds the settings, the identity of whoever is signed in, and the store
//! and realtime transport bound to that identity. Sessions are opened from
//! here so that every one of them in this process shares one transport: the
//! in-process hub for the embedded backend, one websocket per signed-in user
//! for the hosted one.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::database::Database;
use crate::managers::session_manager::BookmarkSession;
use crate::realtime::socket::realtime_endpoint;
use crate::realtime::{LocalHub, RealtimeTransport, ReconnectPolicy, SocketConfig, SocketTransport};
use crate::services::auth::{AccessToken, AuthClient, IdentityProvider, StaticIdentity, TokenIdentity};
use crate::services::settings_engine::{SettingsEngine, SettingsEngineTrait};
use crate::store::{BookmarkStore, ChangeFeedStore, RestStore, SqliteStore};
use crate::types::errors::{AuthError, SessionOpenError};
use crate::types::session::UserId;
use crate::types::settings::{BackendMode, SyncSettings};

/// Storage backend selected by `backend.mode`.
enum Backend {
    /// Embedded database; one store serves every user.
    Local { store: Arc<dyn BookmarkStore> },
    /// Hosted backend; store and socket are bound to the signed-in user's token.
    Rest {
        auth: AuthClient,
        bound: Option<HostedBinding>,
    },
}

struct HostedBinding {
    store: Arc<dyn BookmarkStore>,
    transport: Arc<dyn RealtimeTransport>,
}

/// Central application struct.
pub struct App {
    pub settings: SettingsEngine,
    pub hub: Arc<LocalHub>,
    backend: Backend,
    identity: Box<dyn IdentityProvider>,
}

impl App {
    /// Builds the app from already-loaded settings.
    pub fn new(settings: SettingsEngine) -> Result<Self, Box<dyn std::error::Error>> {
        let config = settings.get_settings().clone();
        let hub = Arc::new(LocalHub::new(config.realtime.channel_capacity));

        let backend = match config.backend.mode {
            BackendMode::Local => {
                let path = settings.database_path();
                if let Some(parent) = std::path::Path::new(&path).parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let db = Arc::new(Database::open(&path)?);
                info!(path = %path, "using embedded bookmark store");
                Self::local_backend(db, hub.clone())
            }
            BackendMode::Rest => {
                let auth = AuthClient::new(
                    &config.backend.url,
                    &config.backend.anon_key,
                    Duration::from_secs(config.backend.request_timeout_secs),
                )?;
                info!(url = %config.backend.url, "using hosted bookmark store");
                Backend::Rest { auth, bound: None }
            }
        };

        Ok(Self {
            settings,
            hub,
            backend,
            identity: Box::new(StaticIdentity::signed_out()),
        })
    }

    /// App over an in-memory embedded store, for tests and the demo.
    pub fn in_memory(settings: SettingsEngine) -> Result<Self, Box<dyn std::error::Error>> {
        let hub = Arc::new(LocalHub::new(settings.get_settings().realtime.channel_capacity));
        let db = Arc::new(Database::open_in_memory()?);
        Ok(Self {
            settings,
            backend: Self::local_backend(db, hub.clone()),
            hub,
            identity: Box::new(StaticIdentity::signed_out()),
        })
    }

    fn local_backend(db: Arc<Database>, hub: Arc<LocalHub>) -> Backend {
        let transport: Arc<dyn RealtimeTransport> = hub;
        let store = ChangeFeedStore::new(SqliteStore::new(db), transport);
        Backend::Local { store: Arc::new(store) }
    }

    pub fn config(&self) -> &SyncSettings {
        self.settings.get_settings()
    }

    pub fn is_local(&self) -> bool {
        matches!(self.backend, Backend::Local { .. })
    }

    /// Browser URL for starting OAuth sign-in. Only meaningful for the hosted
    /// backend; the embedded backend signs in by user id.
    pub fn sign_in_url(&self, provider: &str, redirect_to: &str) -> Result<String, AuthError> {
        match &self.backend {
            Backend::Rest { auth, .. } => Ok(auth.authorize_url(provider, redirect_to)?.to_string()),
            Backend::Local { .. } => Err(AuthError::Provider("embedded backend has no OAuth provider".into())),
        }
    }

    /// Signs in against the embedded backend as `user`.
    pub fn sign_in_local(&mut self, user: UserId) -> Result<(), AuthError> {
        if !self.is_local() {
            return Err(AuthError::Provider("hosted backend requires an access token".into()));
        }
        info!(user = %user, "signed in");
        self.identity = Box::new(StaticIdentity::signed_in(user));
        Ok(())
    }

    /// Signs in with an access token obtained from the OAuth callback.
    ///
    /// The token is checked with the identity provider before it is used.
    pub async fn sign_in_with_token(&mut self, token: AccessToken) -> Result<UserId, AuthError> {
        let timeout = Duration::from_secs(self.config().backend.request_timeout_secs);
        let url = self.config().backend.url.clone();
        let anon_key = self.config().backend.anon_key.clone();
        let realtime = self.config().realtime.clone();

        match &mut self.backend {
            Backend::Rest { auth, bound } => {
                let user = auth.fetch_user(&token).await?;
                let identity = TokenIdentity::new(token.clone())?;
                if identity.claims().subject != user.id {
                    return Err(AuthError::InvalidToken("token subject does not match user".into()));
                }
                let user_id = UserId::new(user.id);
                let endpoint = realtime_endpoint(&url, &anon_key).map_err(|e| AuthError::Provider(e.to_string()))?;
                let socket = SocketConfig::new(endpoint, token.clone(), &realtime);
                let rest = RestStore::new(&url, &anon_key, token, timeout)
                    .map_err(|e| AuthError::Provider(e.to_string()))?;
                *bound = Some(HostedBinding {
                    store: Arc::new(rest),
                    transport: Arc::new(SocketTransport::connect(socket, user_id.clone())),
                });
                self.identity = Box::new(identity);
                info!(user = %user_id, "signed in");
                Ok(user_id)
            }
            Backend::Local { .. } => {
                let identity = TokenIdentity::new(token)?;
                let user_id = identity.current_user()?;
                self.identity = Box::new(identity);
                info!(user = %user_id, "signed in");
                Ok(user_id)
            }
        }
    }

    /// Drops the identity and, for the hosted backend, revokes the token.
    pub async fn sign_out(&mut self) -> Result<(), AuthError> {
        let previous = std::mem::replace(&mut self.identity, Box::new(StaticIdentity::signed_out()));
        if let Backend::Rest { auth, bound } = &mut self.backend {
            *bound = None;
            if let Some(token) = previous.access_token() {
                auth.sign_out(token).await?;
            }
        }
        info!("signed out");
        Ok(())
    }

    /// The signed-in user, or `Unauthenticated`.
    pub fn current_user(&self) -> Result<UserId, AuthError> {
        self.identity.current_user()
    }

    /// Store bound to the current identity.
    pub fn store(&self) -> Result<Arc<dyn BookmarkStore>, AuthError> {
        match &self.backend {
            Backend::Local { store } => Ok(store.clone()),
            Backend::Rest { bound, .. } => bound
                .as_ref()
                .map(|b| b.store.clone())
                .ok_or(AuthError::Unauthenticated),
        }
    }

    /// Realtime transport sessions of the current identity subscribe through.
    pub fn transport(&self) -> Result<Arc<dyn RealtimeTransport>, AuthError> {
        match &self.backend {
            Backend::Local { .. } => {
                let hub: Arc<dyn RealtimeTransport> = self.hub.clone();
                Ok(hub)
            }
            Backend::Rest { bound, .. } => bound
                .as_ref()
                .map(|b| b.transport.clone())
                .ok_or(AuthError::Unauthenticated),
        }
    }

    /// Opens a new session for the signed-in user and loads its list.
    ///
    /// A failed initial listing does not fail the open: the session is
    /// returned together with the error message for the view to show.
    pub async fn open_session(&self) -> Result<(BookmarkSession, Option<String>), SessionOpenError> {
        let user = self.current_user().map_err(SessionOpenError::Auth)?;
        let store = self.store().map_err(SessionOpenError::Auth)?;
        let policy = ReconnectPolicy::from(&self.config().realtime);
        let transport = self.transport().map_err(SessionOpenError::Auth)?;

        let session = BookmarkSession::open(user, store, transport, policy).map_err(SessionOpenError::Channel)?;
        let load_error = session.refresh().await.err().map(|e| e.to_string());
        Ok((session, load_error))
    }
}
