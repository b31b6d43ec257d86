//! Mock transports for testing the session controller
//!
//! The mocks stand in for the HTTP and WebSocket adapters so controller
//! behavior can be driven step by step without a backend.

use super::controller::{SessionController, SessionHandle, SessionSettings, SessionSnapshot};
use crate::transport::{
    ChatClient, ChatRequest, ChatResponse, CloseInfo, Inbound, StreamConnector, StreamEventKind,
    StreamLink, StreamMessage, StreamSender, Style, TransportError,
};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};

const WAIT: Duration = Duration::from_secs(2);

// ============================================================================
// Mock Chat Client
// ============================================================================

/// Synchronous transport returning queued responses
pub struct MockChatClient {
    responses: Mutex<VecDeque<Result<ChatResponse, TransportError>>>,
    /// Record of all requests made
    pub requests: Mutex<Vec<ChatRequest>>,
    held: AtomicBool,
    gate: Semaphore,
}

impl MockChatClient {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            held: AtomicBool::new(false),
            gate: Semaphore::new(0),
        }
    }

    pub fn queue_response(&self, refined: &str, reply: &str) {
        self.responses.lock().unwrap().push_back(Ok(ChatResponse {
            refined_text: refined.to_string(),
            reply_text: reply.to_string(),
            session_id: String::new(),
        }));
    }

    pub fn queue_error(&self, error: TransportError) {
        self.responses.lock().unwrap().push_back(Err(error));
    }

    /// Make calls block until `release`
    pub fn hold(&self) {
        self.held.store(true, Ordering::SeqCst);
    }

    /// Let one held call through
    pub fn release(&self) {
        self.gate.add_permits(1);
    }

    pub fn recorded_requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatClient for MockChatClient {
    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, TransportError> {
        self.requests.lock().unwrap().push(request.clone());
        if self.held.load(Ordering::SeqCst) {
            self.gate.acquire().await.unwrap().forget();
        }
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(TransportError::network("No mock response queued")))
    }
}

// ============================================================================
// Mock Stream Connector
// ============================================================================

/// Connector whose connections are driven by the test through
/// [`MockServer`]s
pub struct MockConnector {
    failures: Mutex<VecDeque<TransportError>>,
    attempts: AtomicUsize,
    servers_tx: mpsc::UnboundedSender<MockServer>,
    servers_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<MockServer>>,
}

impl MockConnector {
    pub fn new() -> Self {
        let (servers_tx, servers_rx) = mpsc::unbounded_channel();
        Self {
            failures: Mutex::new(VecDeque::new()),
            attempts: AtomicUsize::new(0),
            servers_tx,
            servers_rx: tokio::sync::Mutex::new(servers_rx),
        }
    }

    /// Fail the next connection attempt
    pub fn fail_next(&self, reason: &str) {
        self.failures
            .lock()
            .unwrap()
            .push_back(TransportError::network(reason));
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Server side of the next successful connection
    pub async fn next_server(&self) -> MockServer {
        let mut servers = self.servers_rx.lock().await;
        tokio::time::timeout(WAIT, servers.recv())
            .await
            .expect("timed out waiting for a connection")
            .expect("connector dropped")
    }
}

#[async_trait]
impl StreamConnector for MockConnector {
    async fn connect(&self) -> Result<StreamLink, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.failures.lock().unwrap().pop_front() {
            return Err(error);
        }

        let (inbound_tx, inbound_rx) = mpsc::channel(64);
        let sent = Arc::new(Mutex::new(Vec::new()));
        let open = Arc::new(AtomicBool::new(true));
        let _ = self.servers_tx.send(MockServer {
            inbound: inbound_tx,
            sent: Arc::clone(&sent),
            open: Arc::clone(&open),
        });
        Ok(StreamLink {
            sender: Box::new(MockSender { sent, open }),
            inbound: inbound_rx,
        })
    }
}

struct MockSender {
    sent: Arc<Mutex<Vec<ChatRequest>>>,
    open: Arc<AtomicBool>,
}

#[async_trait]
impl StreamSender for MockSender {
    async fn send(&mut self, request: &ChatRequest) -> Result<(), TransportError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(TransportError::not_connected());
        }
        self.sent.lock().unwrap().push(request.clone());
        Ok(())
    }

    async fn close(&mut self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

/// The backend end of a mock connection
pub struct MockServer {
    inbound: mpsc::Sender<Inbound>,
    sent: Arc<Mutex<Vec<ChatRequest>>>,
    open: Arc<AtomicBool>,
}

impl MockServer {
    pub async fn emit(&self, kind: StreamEventKind, content: &str) {
        let _ = self
            .inbound
            .send(Inbound::Message(StreamMessage::new(kind, content)))
            .await;
    }

    pub async fn close(&self, code: u16) {
        self.open.store(false, Ordering::SeqCst);
        let _ = self
            .inbound
            .send(Inbound::Closed(CloseInfo::with_code(code, "")))
            .await;
    }

    /// False once either side closed the connection
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        self.sent.lock().unwrap().clone()
    }

    /// Wait until the client has sent `count` requests
    pub async fn wait_for_requests(&self, count: usize) -> Vec<ChatRequest> {
        tokio::time::timeout(WAIT, async {
            loop {
                let requests = self.requests();
                if requests.len() >= count {
                    return requests;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("timed out waiting for a request")
    }
}

// ============================================================================
// Harness
// ============================================================================

pub struct TestSession {
    pub handle: SessionHandle,
    pub chat: Arc<MockChatClient>,
    pub connector: Arc<MockConnector>,
}

impl TestSession {
    pub fn start(streaming_enabled: bool) -> Self {
        let chat = Arc::new(MockChatClient::new());
        let connector = Arc::new(MockConnector::new());
        let settings = SessionSettings {
            session_id: Some("test-session".to_string()),
            streaming_enabled,
            reconnect_min_interval: Duration::ZERO,
            ..SessionSettings::default()
        };
        let handle =
            SessionController::spawn(settings, Arc::clone(&chat), Arc::clone(&connector));
        Self {
            handle,
            chat,
            connector,
        }
    }

    /// Start with streaming on and wait for the connection
    pub async fn connected() -> (Self, MockServer) {
        let session = Self::start(true);
        let server = session.connector.next_server().await;
        session.wait_for(|s| s.connection.is_connected()).await;
        (session, server)
    }

    pub async fn wait_for(&self, predicate: impl Fn(&SessionSnapshot) -> bool) -> SessionSnapshot {
        wait_for(&self.handle, predicate).await
    }

    /// Wait for the single turn to finish
    pub async fn finished_turn(&self) -> SessionSnapshot {
        self.wait_for(|s| s.history.last().is_some_and(|t| !t.loading))
            .await
    }

    /// Wait until every command sent so far has been processed
    pub async fn flush(&self) {
        // Commands apply in order, so a visible style flip means everything
        // queued before it has been handled
        let style = self.handle.style();
        let other = match style {
            Style::Formal => Style::Casual,
            Style::Casual => Style::Formal,
        };
        self.handle.set_style(other).await.unwrap();
        self.wait_for(|s| s.style == other).await;
        self.handle.set_style(style).await.unwrap();
        self.wait_for(|s| s.style == style).await;
    }
}

pub async fn wait_for(
    handle: &SessionHandle,
    predicate: impl Fn(&SessionSnapshot) -> bool,
) -> SessionSnapshot {
    let mut snapshots = handle.watch();
    tokio::time::timeout(WAIT, async {
        loop {
            {
                let snapshot = snapshots.borrow_and_update();
                if predicate(&snapshot) {
                    return snapshot.clone();
                }
            }
            snapshots.changed().await.expect("controller stopped");
        }
    })
    .await
    .expect("timed out waiting for session state")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::state::{CONNECTION_DROPPED, CONNECTION_LOST_DETAIL};
    use crate::session::{
        ConnectionState, FailureKind, SessionClosed, SessionUpdate, TurnOutcome, ERROR_PLACEHOLDER,
    };
    use crate::transport::{test_server, HttpTransport, TransportErrorKind, WsConnector};

    #[tokio::test]
    async fn sync_turn_round_trip() {
        let session = TestSession::start(false);
        session
            .chat
            .queue_response("안녕하세요", "안녕하세요! 반갑습니다.");

        session.handle.submit("안녕", Style::Formal).await.unwrap();
        let snapshot = session.finished_turn().await;

        assert_eq!(snapshot.history.len(), 1);
        let turn = &snapshot.history[0];
        assert_eq!(turn.original_text, "안녕");
        assert_eq!(turn.refined_text, "안녕하세요");
        assert_eq!(turn.reply_text, "안녕하세요! 반갑습니다.");
        assert_eq!(turn.outcome, Some(TurnOutcome::Completed));

        let requests = session.chat.recorded_requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].style, Style::Formal);
        assert_eq!(requests[0].session_id.as_deref(), Some("test-session"));
        assert_eq!(session.connector.attempts(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn submit_current_uses_style_set_just_before() {
        for _ in 0..20 {
            let session = TestSession::start(false);
            session.chat.queue_response("안녕", "응, 안녕!");

            session.handle.set_style(Style::Casual).await.unwrap();
            session.handle.submit_current("안녕").await.unwrap();
            let snapshot = session.finished_turn().await;

            assert_eq!(snapshot.style, Style::Casual);
            assert_eq!(snapshot.history[0].style, Style::Casual);
            assert_eq!(session.chat.recorded_requests()[0].style, Style::Casual);
        }
    }

    #[tokio::test]
    async fn submit_while_loading_is_ignored() {
        let session = TestSession::start(false);
        session.chat.hold();
        session.chat.queue_response("first", "one");

        session.handle.submit("first", Style::Formal).await.unwrap();
        session.wait_for(|s| s.is_busy()).await;
        session.handle.submit("second", Style::Formal).await.unwrap();
        session.handle.submit("   ", Style::Formal).await.unwrap();
        session.flush().await;

        assert_eq!(session.handle.history().len(), 1);
        assert_eq!(session.chat.recorded_requests().len(), 1);

        session.chat.release();
        let snapshot = session.finished_turn().await;
        assert_eq!(snapshot.history[0].reply_text, "one");
    }

    #[tokio::test]
    async fn sync_failure_marks_turn_failed() {
        let session = TestSession::start(false);
        session
            .chat
            .queue_error(TransportError::timeout("request timed out"));

        session.handle.submit("hello", Style::Casual).await.unwrap();
        let snapshot = session.finished_turn().await;

        let turn = &snapshot.history[0];
        assert_eq!(turn.refined_text, ERROR_PLACEHOLDER);
        assert_eq!(turn.reply_text, "request timed out");
        assert_eq!(
            turn.outcome,
            Some(TurnOutcome::Failed {
                kind: FailureKind::Transport(TransportErrorKind::Timeout)
            })
        );
        assert_eq!(snapshot.connection, ConnectionState::Disconnected);

        // The session stays usable
        session.chat.queue_response("hello!", "hi");
        session.handle.submit("hello", Style::Casual).await.unwrap();
        let snapshot = session
            .wait_for(|s| s.history.len() == 2 && !s.is_busy())
            .await;
        assert_eq!(snapshot.history[1].reply_text, "hi");
    }

    #[tokio::test]
    async fn streaming_reply_is_concatenated() {
        let (session, server) = TestSession::connected().await;

        session.handle.submit("안녕", Style::Casual).await.unwrap();
        let requests = server.wait_for_requests(1).await;
        assert_eq!(requests[0].message, "안녕");
        assert_eq!(requests[0].style, Style::Casual);
        assert_eq!(requests[0].session_id.as_deref(), Some("test-session"));

        server.emit(StreamEventKind::Refined, "안녕하세요").await;
        server.emit(StreamEventKind::ReplyStart, "").await;
        server.emit(StreamEventKind::ReplyChunk, "a").await;
        server.emit(StreamEventKind::ReplyChunk, "b").await;
        server.emit(StreamEventKind::ReplyComplete, "ab").await;
        server.emit(StreamEventKind::Done, "완료").await;

        let snapshot = session.finished_turn().await;
        let turn = &snapshot.history[0];
        assert_eq!(turn.refined_text, "안녕하세요");
        assert_eq!(turn.reply_text, "ab");
        assert!(!turn.streaming_reply);
        assert_eq!(turn.outcome, Some(TurnOutcome::Completed));
        assert!(session.chat.recorded_requests().is_empty());
    }

    #[tokio::test]
    async fn listeners_see_every_change_in_order() {
        let (session, server) = TestSession::connected().await;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        session
            .handle
            .on_update(move |update| sink.lock().unwrap().push(update.clone()))
            .await
            .unwrap();

        session.handle.submit("hi", Style::Formal).await.unwrap();
        server.wait_for_requests(1).await;
        server.emit(StreamEventKind::ReplyStart, "").await;
        server.emit(StreamEventKind::ReplyChunk, "x").await;
        server.emit(StreamEventKind::ReplyChunk, "y").await;
        server.emit(StreamEventKind::Done, "").await;
        session.finished_turn().await;

        let replies: Vec<(String, bool)> = seen
            .lock()
            .unwrap()
            .iter()
            .filter_map(|update| match update {
                SessionUpdate::TurnAdded(turn) | SessionUpdate::TurnUpdated(turn) => {
                    Some((turn.reply_text.clone(), turn.loading))
                }
                _ => None,
            })
            .collect();
        assert_eq!(
            replies,
            vec![
                (String::new(), true),
                (String::new(), true),
                ("x".to_string(), true),
                ("xy".to_string(), true),
                ("xy".to_string(), false),
            ]
        );
        assert!(matches!(
            seen.lock().unwrap().first(),
            Some(SessionUpdate::TurnAdded(_))
        ));
    }

    #[tokio::test]
    async fn broadcast_subscribers_see_toggle_sequence() {
        let session = TestSession::start(false);
        let mut updates = session.handle.subscribe();

        session.handle.set_streaming_enabled(false).await.unwrap();
        session.handle.set_streaming_enabled(true).await.unwrap();
        let _server = session.connector.next_server().await;
        session.wait_for(|s| s.connection.is_connected()).await;

        let mut connection_changes = Vec::new();
        while let Ok(update) = updates.try_recv() {
            if let SessionUpdate::ConnectionChanged(state) = update {
                connection_changes.push(state);
            }
        }
        assert_eq!(
            connection_changes,
            vec![ConnectionState::Connecting, ConnectionState::Connected]
        );
        assert!(session.handle.streaming_enabled());
    }

    #[tokio::test]
    async fn failed_connect_falls_back_to_sync() {
        let session = TestSession::start(false);
        session.connector.fail_next("connection refused");
        session.handle.set_streaming_enabled(true).await.unwrap();

        let snapshot = session
            .wait_for(|s| matches!(s.connection, ConnectionState::Errored(_)))
            .await;
        assert!(snapshot
            .connection
            .error()
            .is_some_and(|reason| reason.contains("connection refused")));

        session.chat.queue_response("refined", "reply");
        session.handle.submit("text", Style::Formal).await.unwrap();
        session.finished_turn().await;
        assert_eq!(session.chat.recorded_requests().len(), 1);

        session.handle.reconnect().await.unwrap();
        let _server = session.connector.next_server().await;
        session.wait_for(|s| s.connection.is_connected()).await;
        assert_eq!(session.connector.attempts(), 2);
    }

    #[tokio::test]
    async fn reconnect_while_connected_is_ignored() {
        let (session, _server) = TestSession::connected().await;

        session.handle.reconnect().await.unwrap();
        session.handle.reconnect().await.unwrap();
        session.flush().await;

        assert_eq!(session.connector.attempts(), 1);
        assert_eq!(session.handle.connection_state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn abnormal_close_surfaces_error_and_fails_turn() {
        let (session, server) = TestSession::connected().await;
        session.handle.submit("hello", Style::Formal).await.unwrap();
        server.wait_for_requests(1).await;
        server.emit(StreamEventKind::ReplyStart, "").await;

        server.close(1011).await;
        let snapshot = session.finished_turn().await;
        assert_eq!(
            snapshot.connection,
            ConnectionState::Errored(CONNECTION_DROPPED.to_string())
        );
        assert_eq!(
            snapshot.history[0].outcome,
            Some(TurnOutcome::Failed {
                kind: FailureKind::ConnectionLost
            })
        );

        session.handle.reconnect().await.unwrap();
        let _server = session.connector.next_server().await;
        session.wait_for(|s| s.connection.is_connected()).await;
    }

    #[tokio::test]
    async fn normal_close_disconnects_quietly() {
        let (session, server) = TestSession::connected().await;
        server.close(1000).await;
        session
            .wait_for(|s| s.connection == ConnectionState::Disconnected)
            .await;
        assert!(session.handle.streaming_enabled());
    }

    #[tokio::test]
    async fn toggling_off_closes_connection_and_fails_streaming_turn() {
        let (session, server) = TestSession::connected().await;
        session.handle.submit("hello", Style::Formal).await.unwrap();
        server.wait_for_requests(1).await;

        session.handle.set_streaming_enabled(false).await.unwrap();
        let snapshot = session.finished_turn().await;

        assert!(!server.is_open());
        assert_eq!(snapshot.connection, ConnectionState::Disconnected);
        assert!(!snapshot.streaming_enabled);
        let turn = &snapshot.history[0];
        assert_eq!(turn.refined_text, ERROR_PLACEHOLDER);
        assert_eq!(turn.reply_text, CONNECTION_LOST_DETAIL);

        // Late frames from the old connection go nowhere
        server.emit(StreamEventKind::ReplyChunk, "late").await;
        session.flush().await;
        assert_eq!(session.handle.history()[0].reply_text, CONNECTION_LOST_DETAIL);
    }

    #[tokio::test]
    async fn shutdown_stops_the_controller() {
        let (session, server) = TestSession::connected().await;

        session.handle.shutdown().await.unwrap();
        assert!(!server.is_open());
        assert_eq!(
            session.handle.submit("hello", Style::Formal).await,
            Err(SessionClosed)
        );
    }

    #[tokio::test]
    async fn end_to_end_against_backend() {
        let server = test_server::spawn().await;
        let http = HttpTransport::new(server.base_url(), Duration::from_secs(5)).unwrap();
        let ws = WsConnector::new(server.ws_url(), Duration::from_secs(5));
        let settings = SessionSettings {
            session_id: Some("e2e".to_string()),
            reconnect_min_interval: Duration::ZERO,
            ..SessionSettings::default()
        };
        let handle = SessionController::spawn(settings, http, ws);

        wait_for(&handle, |s| s.connection.is_connected()).await;
        handle.submit("안녕", Style::Formal).await.unwrap();
        let snapshot = wait_for(&handle, |s| {
            s.history.last().is_some_and(|t| !t.loading)
        })
        .await;
        assert_eq!(snapshot.history[0].refined_text, "안녕하세요");
        assert_eq!(snapshot.history[0].reply_text, "안녕하세요! 반갑습니다.");

        // Same sentence over the synchronous path
        handle.set_streaming_enabled(false).await.unwrap();
        handle.submit("안녕", Style::Casual).await.unwrap();
        let snapshot = wait_for(&handle, |s| s.history.len() == 2 && !s.is_busy()).await;
        assert_eq!(snapshot.history[1].refined_text, "안녕하세요");
        assert_eq!(snapshot.history[1].reply_text, "안녕하세요! 반갑습니다.");
        assert_eq!(snapshot.connection, ConnectionState::Disconnected);

        handle.shutdown().await.unwrap();
    }
}
