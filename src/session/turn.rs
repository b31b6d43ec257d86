//! Turn data model

use crate::transport::{Style, TransportErrorKind};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use uuid::Uuid;

/// Shown in place of the corrected sentence when a turn fails
pub const ERROR_PLACEHOLDER: &str = "An error occurred.";

/// Client-generated identifier of a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct TurnId(Uuid);

impl TurnId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TurnId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TurnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Why a turn failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "source", content = "kind", rename_all = "snake_case")]
pub enum FailureKind {
    /// The backend sent an `error` event
    Backend,
    /// The request never produced a response
    Transport(TransportErrorKind),
    /// The streaming connection went away before a terminal event
    ConnectionLost,
}

/// How a turn ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TurnOutcome {
    Completed,
    Failed { kind: FailureKind },
}

/// One user submission plus its correction and reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Turn {
    pub id: TurnId,
    pub original_text: String,
    pub refined_text: String,
    pub reply_text: String,
    pub style: Style,
    pub created_at: DateTime<Utc>,
    /// True from submission until the turn has an outcome
    pub loading: bool,
    /// True only while reply chunks are being appended
    pub streaming_reply: bool,
    pub outcome: Option<TurnOutcome>,
}

impl Turn {
    pub fn new(
        id: TurnId,
        original_text: impl Into<String>,
        style: Style,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            original_text: original_text.into(),
            refined_text: String::new(),
            reply_text: String::new(),
            style,
            created_at,
            loading: true,
            streaming_reply: false,
            outcome: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.outcome.is_some()
    }

    pub(crate) fn complete(&mut self) {
        self.loading = false;
        self.streaming_reply = false;
        self.outcome = Some(TurnOutcome::Completed);
    }

    pub(crate) fn fail(&mut self, kind: FailureKind, detail: impl Into<String>) {
        self.loading = false;
        self.streaming_reply = false;
        self.refined_text = ERROR_PLACEHOLDER.to_string();
        self.reply_text = detail.into();
        self.outcome = Some(TurnOutcome::Failed { kind });
    }
}
