//! Session controller runtime
//!
//! The controller is one tokio task. Commands from [`SessionHandle`]s,
//! outcomes of background transport calls, and frames from the live
//! connection are processed one at a time, so state needs no locking and
//! events apply in arrival order.

use super::effect::Effect;
use super::event::Event;
use super::state::{ConnectionState, SessionContext, SessionState};
use super::transition::transition;
use super::turn::{Turn, TurnId};
use crate::config::ClientConfig;
use crate::transport::{
    ChatClient, ChatRequest, CloseInfo, Inbound, StreamConnector, StreamEventKind, StreamLink,
    StreamSender, Style, TransportError,
};
use chrono::Utc;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

const COMMAND_BUFFER: usize = 32;
const UPDATE_BUFFER: usize = 256;

/// Initial settings of a session
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Fixed session id; a random one is generated when absent
    pub session_id: Option<String>,
    pub style: Style,
    pub streaming_enabled: bool,
    pub reconnect_min_interval: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            session_id: None,
            style: Style::default(),
            streaming_enabled: true,
            reconnect_min_interval: Duration::from_secs(1),
        }
    }
}

impl From<&ClientConfig> for SessionSettings {
    fn from(config: &ClientConfig) -> Self {
        Self {
            session_id: config.session_id.clone(),
            style: config.style,
            streaming_enabled: config.streaming,
            reconnect_min_interval: config.reconnect_min_interval,
        }
    }
}

/// Read-only view of the session, as seen by the presentation layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    /// Every turn of the session, oldest first
    pub history: Vec<Turn>,
    pub connection: ConnectionState,
    pub style: Style,
    pub streaming_enabled: bool,
}

impl SessionSnapshot {
    /// The turn still waiting for its outcome, if any
    pub fn active_turn(&self) -> Option<&Turn> {
        self.history.last().filter(|turn| turn.loading)
    }

    pub fn is_busy(&self) -> bool {
        self.active_turn().is_some()
    }
}

/// Change notification, delivered in mutation order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionUpdate {
    TurnAdded(Turn),
    TurnUpdated(Turn),
    ConnectionChanged(ConnectionState),
    SettingsChanged {
        style: Style,
        streaming_enabled: bool,
    },
}

/// Callback registered with [`SessionHandle::on_update`]. Runs on the
/// controller task.
pub type UpdateListener = Box<dyn Fn(&SessionUpdate) + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("session controller has stopped")]
pub struct SessionClosed;

enum Command {
    Submit {
        text: String,
        /// `None` submits with the style current when the command is handled
        style: Option<Style>,
    },
    SetStyle(Style),
    SetStreamingEnabled(bool),
    Reconnect,
    OnUpdate(UpdateListener),
    Shutdown(oneshot::Sender<()>),
}

/// Results of work the controller spawned
enum Outcome {
    Event(Event),
    LinkOpened { epoch: u64, link: StreamLink },
}

struct LiveLink {
    epoch: u64,
    sender: Box<dyn StreamSender>,
    inbound: mpsc::Receiver<Inbound>,
}

/// Cloneable command surface of a running controller
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
    updates: broadcast::Sender<SessionUpdate>,
    snapshot: watch::Receiver<SessionSnapshot>,
}

impl SessionHandle {
    /// Submit a sentence. Ignored when blank or while a turn is in flight.
    pub async fn submit(&self, text: impl Into<String>, style: Style) -> Result<(), SessionClosed> {
        self.send(Command::Submit {
            text: text.into(),
            style: Some(style),
        })
        .await
    }

    /// Submit with whatever style is current once earlier commands have
    /// been applied, so a preceding `set_style` is honored
    pub async fn submit_current(&self, text: impl Into<String>) -> Result<(), SessionClosed> {
        self.send(Command::Submit {
            text: text.into(),
            style: None,
        })
        .await
    }

    pub async fn set_style(&self, style: Style) -> Result<(), SessionClosed> {
        self.send(Command::SetStyle(style)).await
    }

    pub async fn set_streaming_enabled(&self, enabled: bool) -> Result<(), SessionClosed> {
        self.send(Command::SetStreamingEnabled(enabled)).await
    }

    /// Start a fresh connection attempt if streaming is enabled and the
    /// connection is down. Otherwise a no-op.
    pub async fn reconnect(&self) -> Result<(), SessionClosed> {
        self.send(Command::Reconnect).await
    }

    /// Register a callback invoked after every history, connection, or
    /// settings change
    pub async fn on_update<F>(&self, listener: F) -> Result<(), SessionClosed>
    where
        F: Fn(&SessionUpdate) + Send + 'static,
    {
        self.send(Command::OnUpdate(Box::new(listener))).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionUpdate> {
        self.updates.subscribe()
    }

    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.clone()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn history(&self) -> Vec<Turn> {
        self.snapshot.borrow().history.clone()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.snapshot.borrow().connection.clone()
    }

    pub fn style(&self) -> Style {
        self.snapshot.borrow().style
    }

    pub fn streaming_enabled(&self) -> bool {
        self.snapshot.borrow().streaming_enabled
    }

    pub fn session_id(&self) -> String {
        self.snapshot.borrow().session_id.clone()
    }

    /// Close the connection and stop the controller
    pub async fn shutdown(&self) -> Result<(), SessionClosed> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.send(Command::Shutdown(ack_tx)).await?;
        ack_rx.await.map_err(|_| SessionClosed)
    }

    async fn send(&self, command: Command) -> Result<(), SessionClosed> {
        self.commands.send(command).await.map_err(|_| SessionClosed)
    }
}

/// Owns the session state, the live connection, and the listeners
pub struct SessionController<C, S>
where
    C: ChatClient + 'static,
    S: StreamConnector + 'static,
{
    context: SessionContext,
    state: SessionState,
    chat_client: Arc<C>,
    connector: Arc<S>,
    live_link: Option<LiveLink>,
    /// Opened link awaiting its `ConnectionOpened` transition
    pending_link: Option<(u64, StreamLink)>,
    commands_rx: mpsc::Receiver<Command>,
    outcomes_tx: mpsc::UnboundedSender<Outcome>,
    outcomes_rx: mpsc::UnboundedReceiver<Outcome>,
    listeners: Vec<UpdateListener>,
    updates_tx: broadcast::Sender<SessionUpdate>,
    snapshot_tx: watch::Sender<SessionSnapshot>,
}

impl<C, S> SessionController<C, S>
where
    C: ChatClient + 'static,
    S: StreamConnector + 'static,
{
    pub fn new(settings: SessionSettings, chat_client: C, connector: S) -> (Self, SessionHandle) {
        let session_id = settings
            .session_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let context = SessionContext::new(session_id.clone(), settings.reconnect_min_interval);
        let mut state = SessionState::new(settings.style);
        state.streaming_enabled = settings.streaming_enabled;

        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER);
        let (outcomes_tx, outcomes_rx) = mpsc::unbounded_channel();
        let (updates_tx, _) = broadcast::channel(UPDATE_BUFFER);
        let (snapshot_tx, snapshot_rx) = watch::channel(SessionSnapshot {
            session_id,
            history: Vec::new(),
            connection: state.connection.clone(),
            style: state.style,
            streaming_enabled: state.streaming_enabled,
        });

        let handle = SessionHandle {
            commands: commands_tx,
            updates: updates_tx.clone(),
            snapshot: snapshot_rx,
        };
        let controller = Self {
            context,
            state,
            chat_client: Arc::new(chat_client),
            connector: Arc::new(connector),
            live_link: None,
            pending_link: None,
            commands_rx,
            outcomes_tx,
            outcomes_rx,
            listeners: Vec::new(),
            updates_tx,
            snapshot_tx,
        };
        (controller, handle)
    }

    /// Create a controller and run it on a new task
    pub fn spawn(settings: SessionSettings, chat_client: C, connector: S) -> SessionHandle {
        let (controller, handle) = Self::new(settings, chat_client, connector);
        tokio::spawn(controller.run());
        handle
    }

    pub async fn run(mut self) {
        tracing::info!(session_id = %self.context.session_id, "Starting session controller");

        if self.state.streaming_enabled {
            self.process_event(Event::SetStreamingEnabled {
                enabled: true,
                at: Instant::now(),
            })
            .await;
        }

        let mut shutdown_ack = None;
        loop {
            tokio::select! {
                command = self.commands_rx.recv() => match command {
                    Some(Command::Shutdown(ack)) => {
                        shutdown_ack = Some(ack);
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    // Every handle is gone
                    None => break,
                },
                Some(outcome) = self.outcomes_rx.recv() => self.handle_outcome(outcome).await,
                (epoch, inbound) = next_inbound(&mut self.live_link) => {
                    self.handle_inbound(epoch, inbound).await;
                }
            }
        }

        self.close_live_link().await;
        self.commands_rx.close();
        if let Some(ack) = shutdown_ack {
            let _ = ack.send(());
        }
        tracing::info!(session_id = %self.context.session_id, "Session controller stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        let event = match command {
            Command::Submit { text, style } => Event::Submit {
                turn_id: TurnId::new(),
                text,
                style: style.unwrap_or(self.state.style),
                at: Utc::now(),
            },
            Command::SetStyle(style) => Event::SetStyle { style },
            Command::SetStreamingEnabled(enabled) => Event::SetStreamingEnabled {
                enabled,
                at: Instant::now(),
            },
            Command::Reconnect => Event::Reconnect { at: Instant::now() },
            Command::OnUpdate(listener) => {
                self.listeners.push(listener);
                return;
            }
            // Handled by the run loop
            Command::Shutdown(_) => return,
        };
        self.process_event(event).await;
    }

    async fn handle_outcome(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Event(event) => self.process_event(event).await,
            Outcome::LinkOpened { epoch, link } => {
                if let Some((stale_epoch, mut stale)) = self.pending_link.replace((epoch, link)) {
                    tracing::debug!(epoch = stale_epoch, "Closing unclaimed connection");
                    stale.sender.close().await;
                }
                self.process_event(Event::ConnectionOpened { epoch }).await;
            }
        }
    }

    async fn handle_inbound(&mut self, epoch: u64, inbound: Inbound) {
        let event = match inbound {
            Inbound::Message(message) => {
                if message.kind == StreamEventKind::Unknown {
                    tracing::warn!(epoch, "Ignoring stream event of unknown type");
                }
                Event::StreamMessage { epoch, message }
            }
            Inbound::Closed(close) => {
                // Nothing more will arrive on this link
                self.live_link = None;
                if close.is_normal() {
                    tracing::info!(epoch, "Connection closed");
                } else {
                    tracing::warn!(epoch, code = ?close.code, reason = %close.reason, "Connection dropped");
                }
                Event::ConnectionClosed { epoch, close }
            }
        };
        self.process_event(event).await;
    }

    async fn process_event(&mut self, event: Event) {
        // Effects may produce follow-up events; handle them in order
        let mut events_to_process = VecDeque::from([event]);

        while let Some(current_event) = events_to_process.pop_front() {
            let name = current_event.name();
            let result = match transition(&self.state, &self.context, current_event) {
                Ok(result) => result,
                Err(e) => {
                    tracing::debug!(error = %e, "Submission ignored");
                    continue;
                }
            };
            if result.effects.is_empty() {
                tracing::debug!(event = name, "Event had no effect");
            }

            self.state = result.new_state;

            for effect in result.effects {
                if let Some(follow_up) = self.execute_effect(effect).await {
                    events_to_process.push_back(follow_up);
                }
            }
        }
    }

    async fn execute_effect(&mut self, effect: Effect) -> Option<Event> {
        match effect {
            Effect::RecordTurn(turn) => {
                self.record_turn(turn);
                None
            }
            Effect::ConnectionChanged(connection) => {
                tracing::info!(connection = %connection, "Connection state changed");
                self.snapshot_tx
                    .send_modify(|snapshot| snapshot.connection = connection.clone());
                self.publish(SessionUpdate::ConnectionChanged(connection));
                None
            }
            Effect::SettingsChanged {
                style,
                streaming_enabled,
            } => {
                self.snapshot_tx.send_modify(|snapshot| {
                    snapshot.style = style;
                    snapshot.streaming_enabled = streaming_enabled;
                });
                self.publish(SessionUpdate::SettingsChanged {
                    style,
                    streaming_enabled,
                });
                None
            }
            Effect::OpenConnection { epoch } => {
                self.open_connection(epoch);
                None
            }
            Effect::AdoptConnection { epoch } => {
                match self.pending_link.take() {
                    Some((pending_epoch, link)) if pending_epoch == epoch => {
                        self.live_link = Some(LiveLink {
                            epoch,
                            sender: link.sender,
                            inbound: link.inbound,
                        });
                    }
                    Some((pending_epoch, mut link)) => {
                        tracing::warn!(epoch, pending_epoch, "Pending connection does not match");
                        link.sender.close().await;
                    }
                    None => tracing::warn!(epoch, "No pending connection to adopt"),
                }
                None
            }
            Effect::DiscardConnection { epoch } => {
                if let Some((_, mut link)) = self.pending_link.take() {
                    tracing::debug!(epoch, "Discarding superseded connection");
                    link.sender.close().await;
                }
                None
            }
            Effect::CloseConnection => {
                self.close_live_link().await;
                None
            }
            Effect::SendStreaming { turn_id, request } => {
                self.send_streaming(turn_id, &request).await
            }
            Effect::SendSync { turn_id, request } => {
                self.send_sync(turn_id, request);
                None
            }
        }
    }

    fn record_turn(&mut self, turn: Turn) {
        let mut added = false;
        self.snapshot_tx.send_modify(|snapshot| {
            match snapshot.history.iter_mut().rev().find(|t| t.id == turn.id) {
                Some(existing) => existing.clone_from(&turn),
                None => {
                    snapshot.history.push(turn.clone());
                    added = true;
                }
            }
        });

        if turn.is_terminal() {
            tracing::info!(turn_id = %turn.id, outcome = ?turn.outcome, "Turn finished");
        }
        self.publish(if added {
            SessionUpdate::TurnAdded(turn)
        } else {
            SessionUpdate::TurnUpdated(turn)
        });
    }

    fn publish(&self, update: SessionUpdate) {
        for listener in &self.listeners {
            listener(&update);
        }
        // No subscribers is fine
        let _ = self.updates_tx.send(update);
    }

    fn open_connection(&self, epoch: u64) {
        tracing::debug!(epoch, "Opening streaming connection");
        let connector = Arc::clone(&self.connector);
        let outcomes = self.outcomes_tx.clone();
        tokio::spawn(async move {
            let outcome = match connector.connect().await {
                Ok(link) => Outcome::LinkOpened { epoch, link },
                Err(e) => {
                    tracing::warn!(epoch, error = %e, "Connection attempt failed");
                    Outcome::Event(Event::ConnectionFailed {
                        epoch,
                        reason: e.message,
                    })
                }
            };
            let _ = outcomes.send(outcome);
        });
    }

    async fn close_live_link(&mut self) {
        if let Some(mut link) = self.live_link.take() {
            tracing::debug!(epoch = link.epoch, "Closing streaming connection");
            link.sender.close().await;
        }
    }

    async fn send_streaming(&mut self, turn_id: TurnId, request: &ChatRequest) -> Option<Event> {
        let result = match self.live_link.as_mut() {
            Some(link) => link.sender.send(request).await,
            None => Err(TransportError::not_connected()),
        };
        match result {
            Ok(()) => {
                tracing::debug!(turn_id = %turn_id, "Turn dispatched on stream");
                None
            }
            Err(e) => {
                tracing::warn!(turn_id = %turn_id, error = %e, "Streaming dispatch failed");
                Some(Event::DispatchFailed {
                    turn_id,
                    kind: e.kind,
                    message: e.message,
                })
            }
        }
    }

    fn send_sync(&self, turn_id: TurnId, request: ChatRequest) {
        tracing::debug!(turn_id = %turn_id, "Turn dispatched on synchronous transport");
        let client = Arc::clone(&self.chat_client);
        let outcomes = self.outcomes_tx.clone();
        tokio::spawn(async move {
            let event = match client.chat(&request).await {
                Ok(response) => Event::SyncCompleted { turn_id, response },
                Err(e) => Event::DispatchFailed {
                    turn_id,
                    kind: e.kind,
                    message: e.message,
                },
            };
            let _ = outcomes.send(Outcome::Event(event));
        });
    }
}

/// Next item from the live connection; pends forever when there is none
async fn next_inbound(link: &mut Option<LiveLink>) -> (u64, Inbound) {
    match link {
        Some(link) => {
            let inbound = link
                .inbound
                .recv()
                .await
                .unwrap_or_else(|| Inbound::Closed(CloseInfo::abnormal("reader stopped")));
            (link.epoch, inbound)
        }
        None => std::future::pending().await,
    }
}
