use std::fmt;

use super::validation::ValidationResult;

// === ValidationError ===

/// A submission rejected before any network call.
///
/// Carries the field-keyed messages so the view can show them inline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub result: ValidationResult,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let messages: Vec<&str> = self.result.errors.values().map(String::as_str).collect();
        write!(f, "Invalid bookmark: {}", messages.join("; "))
    }
}

impl std::error::Error for ValidationError {}

// === StoreError ===

/// Errors reported by a bookmark store. Operations are single-shot; none of
/// these are retried automatically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The backend could not be reached or timed out.
    Connectivity(String),
    /// The caller's credentials were rejected.
    Unauthorized(String),
    /// No row with the given id is owned by the caller.
    NotFound(String),
    /// The write violated a table constraint.
    Constraint(String),
    /// Any other backend failure, with the backend's message.
    Backend(String),
    /// Embedded database operation failed.
    DatabaseError(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Connectivity(msg) => write!(f, "Could not reach bookmark store: {}", msg),
            StoreError::Unauthorized(msg) => write!(f, "Not authorized: {}", msg),
            StoreError::NotFound(id) => write!(f, "Bookmark not found: {}", id),
            StoreError::Constraint(msg) => write!(f, "Bookmark rejected: {}", msg),
            StoreError::Backend(msg) => write!(f, "Bookmark store error: {}", msg),
            StoreError::DatabaseError(msg) => write!(f, "Bookmark database error: {}", msg),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::SqliteFailure(code, msg)
                if code.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                StoreError::Constraint(msg.unwrap_or_else(|| code.to_string()))
            }
            other => StoreError::DatabaseError(other.to_string()),
        }
    }
}

// === SessionError ===

/// Failure of a user-initiated mutation, split the way the view shows it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Field-level messages, shown next to the form inputs.
    Validation(ValidationError),
    /// A single user-visible message from the store.
    Store(StoreError),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::Validation(err) => err.fmt(f),
            SessionError::Store(err) => err.fmt(f),
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SessionError::Validation(err) => Some(err),
            SessionError::Store(err) => Some(err),
        }
    }
}

impl From<ValidationError> for SessionError {
    fn from(err: ValidationError) -> Self {
        SessionError::Validation(err)
    }
}

impl From<StoreError> for SessionError {
    fn from(err: StoreError) -> Self {
        SessionError::Store(err)
    }
}

// === SessionOpenError ===

/// Why a session could not be opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOpenError {
    /// Nobody is signed in, or the identity is unusable.
    Auth(AuthError),
    /// The notification channels could not be subscribed.
    Channel(ChannelError),
}

impl fmt::Display for SessionOpenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionOpenError::Auth(err) => err.fmt(f),
            SessionOpenError::Channel(err) => err.fmt(f),
        }
    }
}

impl std::error::Error for SessionOpenError {}

// === ChannelError ===

/// Errors related to notification channel subscriptions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// The topic has been shut down and accepts no more subscribers.
    Closed(String),
    /// Nobody is listening on the topic. Publishing is best-effort.
    NoSubscribers(String),
    /// A payload could not be encoded or decoded.
    Malformed(String),
    /// The realtime connection dropped or could not be opened.
    Disconnected(String),
    /// The transport does not accept this operation on the topic.
    Unsupported(String),
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelError::Closed(topic) => write!(f, "Channel closed: {}", topic),
            ChannelError::NoSubscribers(topic) => write!(f, "No subscribers on channel: {}", topic),
            ChannelError::Malformed(msg) => write!(f, "Malformed channel message: {}", msg),
            ChannelError::Disconnected(msg) => write!(f, "Realtime connection lost: {}", msg),
            ChannelError::Unsupported(msg) => write!(f, "Unsupported channel operation: {}", msg),
        }
    }
}

impl std::error::Error for ChannelError {}

// === AuthError ===

/// Errors at the identity provider boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// No usable identity. The view redirects to sign-in.
    Unauthenticated,
    /// The access token could not be parsed.
    InvalidToken(String),
    /// The identity provider could not be reached.
    Network(String),
    /// The identity provider rejected the request.
    Provider(String),
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthError::Unauthenticated => write!(f, "Not signed in"),
            AuthError::InvalidToken(msg) => write!(f, "Invalid access token: {}", msg),
            AuthError::Network(msg) => write!(f, "Identity provider unreachable: {}", msg),
            AuthError::Provider(msg) => write!(f, "Identity provider error: {}", msg),
        }
    }
}

impl std::error::Error for AuthError {}

// === SettingsError ===

/// Errors related to settings management.
#[derive(Debug)]
pub enum SettingsError {
    /// An I/O error occurred while reading or writing settings.
    IoError(String),
    /// Failed to serialize or deserialize settings.
    SerializationError(String),
    /// The provided settings key is invalid.
    InvalidKey(String),
    /// The provided settings value is invalid.
    InvalidValue(String),
}

impl fmt::Display for SettingsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SettingsError::IoError(msg) => write!(f, "Settings I/O error: {}", msg),
            SettingsError::SerializationError(msg) => {
                write!(f, "Settings serialization error: {}", msg)
            }
            SettingsError::InvalidKey(key) => write!(f, "Invalid settings key: {}", key),
            SettingsError::InvalidValue(msg) => {
                write!(f, "Invalid settings value: {}", msg)
            }
        }
    }
}

impl std::error::Error for SettingsError {}
