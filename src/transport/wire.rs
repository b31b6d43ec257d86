//! Wire format shared by the synchronous and streaming transports

use super::TransportError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Register the backend should correct towards
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Style {
    #[default]
    Formal,
    Casual,
}

impl Style {
    pub fn as_str(self) -> &'static str {
        match self {
            Style::Formal => "formal",
            Style::Casual => "casual",
        }
    }
}

impl fmt::Display for Style {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown style {0:?} (expected \"formal\" or \"casual\")")]
pub struct ParseStyleError(pub String);

impl FromStr for Style {
    type Err = ParseStyleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "formal" => Ok(Style::Formal),
            "casual" => Ok(Style::Casual),
            _ => Err(ParseStyleError(s.to_string())),
        }
    }
}

/// Outbound request, identical on both transports
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default)]
    pub style: Style,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// Response of the synchronous `POST /api/chat` endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatResponse {
    pub refined_text: String,
    pub reply_text: String,
    pub session_id: String,
}

/// Discriminant of a streaming frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamEventKind {
    Refined,
    ReplyStart,
    ReplyChunk,
    ReplyComplete,
    Done,
    Error,
    /// Any type this client does not understand
    #[serde(other)]
    Unknown,
}

/// One inbound frame on the streaming transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamMessage {
    #[serde(rename = "type")]
    pub kind: StreamEventKind,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub session_id: String,
}

impl StreamMessage {
    pub fn new(kind: StreamEventKind, content: impl Into<String>) -> Self {
        Self {
            kind,
            content: content.into(),
            session_id: String::new(),
        }
    }

    pub fn parse(text: &str) -> Result<Self, TransportError> {
        serde_json::from_str(text)
            .map_err(|e| TransportError::codec(format!("invalid stream frame: {e}")))
    }
}

/// A turn as persisted by the backend (`GET /api/chat/history/{session_id}`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    #[serde(default)]
    pub id: Option<i64>,
    pub session_id: String,
    pub original_text: String,
    pub refined_text: String,
    pub reply_text: String,
    #[serde(default)]
    pub created_at: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct HistoryResponse {
    pub history: Vec<HistoryEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct HealthResponse {
    pub status: String,
}

/// Error body the backend attaches to non-success statuses
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ErrorBody {
    pub detail: String,
}
