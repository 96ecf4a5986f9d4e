use serde::{Deserialize, Serialize};

/// Top-level settings container, persisted as `settings.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SyncSettings {
    #[serde(default)]
    pub backend: BackendSettings,
    #[serde(default)]
    pub realtime: RealtimeSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Which store implementation a process talks to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendMode {
    /// Embedded SQLite database in the data directory.
    Local,
    /// Hosted REST backend at `backend.url`.
    Rest,
}

/// Storage and identity backend settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BackendSettings {
    pub mode: BackendMode,
    pub url: String,
    pub anon_key: String,
    /// Overrides `<data dir>/marksync.db` for the local backend.
    pub database_path: Option<String>,
    pub request_timeout_secs: u64,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            mode: BackendMode::Local,
            url: "http://localhost:54321".to_string(),
            anon_key: String::new(),
            database_path: None,
            request_timeout_secs: 15,
        }
    }
}

/// Notification channel tuning and reconnect policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RealtimeSettings {
    pub channel_capacity: usize,
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,
    pub reconnect_max_attempts: u32,
    /// Keepalive period of the hosted realtime socket.
    pub heartbeat_secs: u64,
}

impl Default for RealtimeSettings {
    fn default() -> Self {
        Self {
            channel_capacity: 256,
            reconnect_base_ms: 250,
            reconnect_max_ms: 8_000,
            reconnect_max_attempts: 8,
            heartbeat_secs: 25,
        }
    }
}

/// Log filter in `tracing_subscriber::EnvFilter` syntax.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingSettings {
    pub filter: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            filter: "marksync=info".to_string(),
        }
    }
}
