use chrono::{NaiveDateTime, Utc};
use serde::Serialize;

/// Lifecycle of the EventSub connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Disconnected,
    Connecting,
    /// Welcome received, session id known.
    Welcomed,
    Subscribing,
    Live,
    Reconnecting,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Welcomed => "welcomed",
            SessionState::Subscribing => "subscribing",
            SessionState::Live => "live",
            SessionState::Reconnecting => "reconnecting",
        };
        f.write_str(name)
    }
}

/// One server-assigned session. Replaced on every welcome, never patched.
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub id: String,
    pub keepalive_timeout_seconds: Option<u64>,
    pub established_at: NaiveDateTime,
}

impl Session {
    pub fn new(id: String, keepalive_timeout_seconds: Option<u64>) -> Self {
        Self {
            id,
            keepalive_timeout_seconds,
            established_at: Utc::now().naive_utc(),
        }
    }
}

/// Bot and channel ids resolved once before the first connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelIdentity {
    pub bot_user_id: String,
    pub bot_login: String,
    pub channel_id: String,
}
