//! Streaming WebSocket transport
//!
//! `connect` opens the socket and spawns a reader task that decodes
//! frames into [`Inbound`] items. The reader always finishes with exactly
//! one `Inbound::Closed`. There is no retry loop here; reconnecting is
//! the session controller's decision.

use super::{
    ChatRequest, CloseInfo, Inbound, StreamConnector, StreamLink, StreamMessage, StreamSender,
    TransportError,
};
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const INBOUND_BUFFER: usize = 64;

/// Opens WebSocket connections to the backend's `/api/ws/chat`
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
    connect_timeout: Duration,
}

impl WsConnector {
    pub fn new(url: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            connect_timeout,
        }
    }
}

#[async_trait]
impl StreamConnector for WsConnector {
    async fn connect(&self) -> Result<StreamLink, TransportError> {
        let (stream, _response) =
            tokio::time::timeout(self.connect_timeout, connect_async(self.url.as_str()))
                .await
                .map_err(|_| {
                    TransportError::timeout(format!(
                        "connecting to {} timed out after {:?}",
                        self.url, self.connect_timeout
                    ))
                })??;
        tracing::debug!(url = %self.url, "websocket connected");

        let (writer, reader) = stream.split();
        let open = Arc::new(AtomicBool::new(true));
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_BUFFER);
        tokio::spawn(read_frames(reader, inbound_tx, Arc::clone(&open)));

        Ok(StreamLink {
            sender: Box::new(WsSender { writer, open }),
            inbound: inbound_rx,
        })
    }
}

struct WsSender {
    writer: SplitSink<WsStream, Message>,
    /// Cleared by the reader once the socket is gone, or by `close`
    open: Arc<AtomicBool>,
}

#[async_trait]
impl StreamSender for WsSender {
    async fn send(&mut self, request: &ChatRequest) -> Result<(), TransportError> {
        if !self.open.load(Ordering::Acquire) {
            return Err(TransportError::not_connected());
        }
        let text = serde_json::to_string(request)
            .map_err(|e| TransportError::codec(format!("failed to encode request: {e}")))?;
        self.writer.send(Message::Text(text)).await?;
        Ok(())
    }

    async fn close(&mut self) {
        if !self.open.swap(false, Ordering::AcqRel) {
            return;
        }
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: "".into(),
        };
        if let Err(e) = self.writer.send(Message::Close(Some(frame))).await {
            tracing::debug!(error = %e, "close frame not delivered");
        }
    }
}

async fn read_frames(
    mut reader: SplitStream<WsStream>,
    inbound_tx: mpsc::Sender<Inbound>,
    open: Arc<AtomicBool>,
) {
    let close = loop {
        match reader.next().await {
            Some(Ok(Message::Text(text))) => match StreamMessage::parse(&text) {
                Ok(message) => {
                    if inbound_tx.send(Inbound::Message(message)).await.is_err() {
                        // Link dropped by its owner
                        open.store(false, Ordering::Release);
                        return;
                    }
                }
                Err(e) => tracing::warn!(error = %e, "discarding undecodable frame"),
            },
            Some(Ok(Message::Close(frame))) => {
                break match frame {
                    Some(frame) => CloseInfo::with_code(u16::from(frame.code), frame.reason),
                    None => CloseInfo::abnormal("close frame without status"),
                };
            }
            // Ping/pong are answered by tungstenite; binary frames are not part of the protocol
            Some(Ok(_)) => {}
            Some(Err(e)) => break CloseInfo::abnormal(e.to_string()),
            None => break CloseInfo::abnormal("connection ended without a close frame"),
        }
    };

    open.store(false, Ordering::Release);
    tracing::debug!(code = ?close.code, reason = %close.reason, "websocket closed");
    let _ = inbound_tx.send(Inbound::Closed(close)).await;
}
