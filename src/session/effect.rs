//! Effects produced by state transitions

use super::state::ConnectionState;
use super::turn::{Turn, TurnId};
use crate::transport::{ChatRequest, Style};

/// Effects to be executed by the controller after a transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Append the turn to history, or replace the entry with the same id
    RecordTurn(Turn),

    /// Publish a connection state change
    ConnectionChanged(ConnectionState),

    /// Publish a settings change
    SettingsChanged {
        style: Style,
        streaming_enabled: bool,
    },

    /// Start a connection attempt in the background
    OpenConnection { epoch: u64 },

    /// Make the connection opened by attempt `epoch` the live one
    AdoptConnection { epoch: u64 },

    /// Close a connection that opened after its attempt was superseded
    DiscardConnection { epoch: u64 },

    /// Close the live connection with the normal close code
    CloseConnection,

    /// Send the request on the live connection
    SendStreaming {
        turn_id: TurnId,
        request: ChatRequest,
    },

    /// Issue the request on the synchronous transport
    SendSync {
        turn_id: TurnId,
        request: ChatRequest,
    },
}

impl Effect {
    pub fn settings_changed(style: Style, streaming_enabled: bool) -> Self {
        Effect::SettingsChanged {
            style,
            streaming_enabled,
        }
    }

    pub fn is_dispatch(&self) -> bool {
        matches!(self, Effect::SendStreaming { .. } | Effect::SendSync { .. })
    }
}
