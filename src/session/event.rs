//! Events that drive the session state machine

use super::turn::TurnId;
use crate::transport::{ChatResponse, CloseInfo, StreamMessage, Style, TransportErrorKind};
use chrono::{DateTime, Utc};
use std::time::Instant;

/// Events that trigger state transitions
#[derive(Debug, Clone)]
pub enum Event {
    // User commands
    Submit {
        turn_id: TurnId,
        text: String,
        style: Style,
        at: DateTime<Utc>,
    },
    SetStyle {
        style: Style,
    },
    SetStreamingEnabled {
        enabled: bool,
        at: Instant,
    },
    Reconnect {
        at: Instant,
    },

    // Connection events
    ConnectionOpened {
        epoch: u64,
    },
    ConnectionFailed {
        epoch: u64,
        reason: String,
    },
    ConnectionClosed {
        epoch: u64,
        close: CloseInfo,
    },
    StreamMessage {
        epoch: u64,
        message: StreamMessage,
    },

    // Dispatch outcomes
    SyncCompleted {
        turn_id: TurnId,
        response: ChatResponse,
    },
    /// The synchronous request failed, or a streaming send was rejected
    DispatchFailed {
        turn_id: TurnId,
        kind: TransportErrorKind,
        message: String,
    },
}

impl Event {
    /// Variant name, for logging
    pub fn name(&self) -> &'static str {
        match self {
            Event::Submit { .. } => "submit",
            Event::SetStyle { .. } => "set_style",
            Event::SetStreamingEnabled { .. } => "set_streaming_enabled",
            Event::Reconnect { .. } => "reconnect",
            Event::ConnectionOpened { .. } => "connection_opened",
            Event::ConnectionFailed { .. } => "connection_failed",
            Event::ConnectionClosed { .. } => "connection_closed",
            Event::StreamMessage { .. } => "stream_message",
            Event::SyncCompleted { .. } => "sync_completed",
            Event::DispatchFailed { .. } => "dispatch_failed",
        }
    }
}
