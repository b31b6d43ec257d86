//! Session state types

use super::turn::{Turn, TurnId};
use crate::transport::Style;
use serde::Serialize;
use std::fmt;
use std::time::{Duration, Instant};

/// Reason shown when an open connection goes away abnormally
pub const CONNECTION_DROPPED: &str = "connection dropped";

/// Reply detail of a streaming turn whose connection closed under it
pub const CONNECTION_LOST_DETAIL: &str = "connection closed before the reply completed";

/// Streaming connection state, one per session
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Errored(String),
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// Connected or on the way there
    pub fn is_live(&self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Connecting)
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            ConnectionState::Errored(reason) => Some(reason),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => f.write_str("disconnected"),
            ConnectionState::Connecting => f.write_str("connecting"),
            ConnectionState::Connected => f.write_str("connected"),
            ConnectionState::Errored(reason) => write!(f, "error: {reason}"),
        }
    }
}

/// Transport a turn was dispatched on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Synchronous,
    /// Dispatched on the connection opened by attempt `epoch`
    Streaming { epoch: u64 },
}

/// The single in-flight turn
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveTurn {
    pub turn: Turn,
    pub route: Route,
}

impl ActiveTurn {
    pub fn id(&self) -> TurnId {
        self.turn.id
    }
}

/// State owned by the session controller
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SessionState {
    pub connection: ConnectionState,
    pub streaming_enabled: bool,
    pub style: Style,
    pub active: Option<ActiveTurn>,
    /// Bumped on every connection attempt and every deliberate close;
    /// connection events tagged with an older epoch are stale.
    pub epoch: u64,
    pub last_connect_attempt: Option<Instant>,
}

impl SessionState {
    pub fn new(style: Style) -> Self {
        Self {
            style,
            ..Self::default()
        }
    }

    pub fn is_busy(&self) -> bool {
        self.active.is_some()
    }
}

/// Immutable inputs to transitions
#[derive(Debug, Clone)]
pub struct SessionContext {
    /// Attached to every outbound request
    pub session_id: String,
    /// Minimum spacing between `reconnect` attempts
    pub reconnect_min_interval: Duration,
}

impl SessionContext {
    pub fn new(session_id: impl Into<String>, reconnect_min_interval: Duration) -> Self {
        Self {
            session_id: session_id.into(),
            reconnect_min_interval,
        }
    }
}
