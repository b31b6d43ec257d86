//! Transport adapters
//!
//! Two ways of carrying a turn to the backend: a one-shot HTTP request
//! and a persistent WebSocket delivering typed events. The session
//! controller only sees the traits below, so tests swap in mocks.

mod error;
mod http;
mod wire;
mod ws;


pub use error::{TransportError, TransportErrorKind};
pub use http::HttpTransport;
pub use wire::{
    ChatRequest, ChatResponse, HistoryEntry, ParseStyleError, StreamEventKind, StreamMessage,
    Style,
};
pub use ws::WsConnector;

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Close code of an intentional, clean shutdown
pub const NORMAL_CLOSE: u16 = 1000;

/// Synchronous request/response transport
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Send one request and wait for the full response
    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, TransportError>;
}

/// Opens streaming connections
#[async_trait]
pub trait StreamConnector: Send + Sync {
    /// Open a new duplex connection
    async fn connect(&self) -> Result<StreamLink, TransportError>;
}

/// Write half of an open streaming connection
#[async_trait]
pub trait StreamSender: Send {
    /// Send a request; fails fast when the connection is not open
    async fn send(&mut self, request: &ChatRequest) -> Result<(), TransportError>;

    /// Close with the normal close code
    async fn close(&mut self);
}

/// An established streaming connection
pub struct StreamLink {
    pub sender: Box<dyn StreamSender>,
    /// Decoded frames followed by exactly one `Inbound::Closed`
    pub inbound: mpsc::Receiver<Inbound>,
}

impl std::fmt::Debug for StreamLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamLink").finish_non_exhaustive()
    }
}

/// Something read from a streaming connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Message(StreamMessage),
    Closed(CloseInfo),
}

/// How a streaming connection ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    /// `None` when the connection ended without a close frame
    pub code: Option<u16>,
    pub reason: String,
}

impl CloseInfo {
    pub fn normal() -> Self {
        Self {
            code: Some(NORMAL_CLOSE),
            reason: String::new(),
        }
    }

    pub fn with_code(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            reason: reason.into(),
        }
    }

    pub fn abnormal(reason: impl Into<String>) -> Self {
        Self {
            code: None,
            reason: reason.into(),
        }
    }

    pub fn is_normal(&self) -> bool {
        self.code == Some(NORMAL_CLOSE)
    }
}

// ============================================================================
// Arc implementations for trait objects
// ============================================================================

#[async_trait]
impl<T: ChatClient + ?Sized> ChatClient for Arc<T> {
    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, TransportError> {
        (**self).chat(request).await
    }
}

#[async_trait]
impl<T: StreamConnector + ?Sized> StreamConnector for Arc<T> {
    async fn connect(&self) -> Result<StreamLink, TransportError> {
        (**self).connect().await
    }
}
