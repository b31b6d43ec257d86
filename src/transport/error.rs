//! Transport error types

use serde::Serialize;
use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Transport error with classification
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Network, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Timeout, message)
    }

    pub fn status(code: u16, message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Status(code), message)
    }

    pub fn codec(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Codec, message)
    }

    pub fn not_connected() -> Self {
        Self::new(
            TransportErrorKind::NotConnected,
            "streaming connection is not open",
        )
    }

    pub fn closed(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Closed, message)
    }
}

/// Error classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportErrorKind {
    /// Connection refused, DNS, reset
    Network,
    /// Request or connect exceeded its deadline
    Timeout,
    /// Backend answered with a non-success HTTP status
    Status(u16),
    /// Body or frame could not be encoded/decoded
    Codec,
    /// Streaming send attempted without an open connection
    NotConnected,
    /// Connection closed while in use
    Closed,
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::timeout(format!("request timed out: {err}"))
        } else if err.is_decode() {
            Self::codec(format!("invalid response body: {err}"))
        } else if let Some(status) = err.status() {
            Self::status(status.as_u16(), err.to_string())
        } else {
            Self::network(err.to_string())
        }
    }
}

impl From<tungstenite::Error> for TransportError {
    fn from(err: tungstenite::Error) -> Self {
        match err {
            tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
                Self::closed(err.to_string())
            }
            other => Self::network(other.to_string()),
        }
    }
}
