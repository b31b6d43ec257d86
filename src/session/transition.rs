//! Pure state transition function
//!
//! Given the same state, context and event this always produces the same
//! new state and effects. All I/O lives in the controller.

use super::effect::Effect;
use super::event::Event;
use super::state::{
    ActiveTurn, ConnectionState, Route, SessionContext, SessionState, CONNECTION_DROPPED,
    CONNECTION_LOST_DETAIL,
};
use super::turn::{FailureKind, Turn, TurnId};
use crate::transport::{
    ChatRequest, ChatResponse, CloseInfo, StreamEventKind, StreamMessage, Style,
    TransportErrorKind,
};
use chrono::{DateTime, Utc};
use std::time::Instant;
use thiserror::Error;

/// Result of a state transition
#[derive(Debug)]
pub struct TransitionResult {
    pub new_state: SessionState,
    pub effects: Vec<Effect>,
}

impl TransitionResult {
    pub fn new(state: SessionState) -> Self {
        Self {
            new_state: state,
            effects: vec![],
        }
    }

    /// The event is ignored
    pub fn unchanged(state: &SessionState) -> Self {
        Self::new(state.clone())
    }

    pub fn with_effect(mut self, effect: Effect) -> Self {
        self.effects.push(effect);
        self
    }

    pub fn with_effects(mut self, effects: impl IntoIterator<Item = Effect>) -> Self {
        self.effects.extend(effects);
        self
    }
}

/// Submissions the controller refuses. Never surfaced to the user.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("message is empty")]
    EmptyMessage,
    #[error("a turn is already in flight")]
    TurnInFlight,
}

pub fn transition(
    state: &SessionState,
    context: &SessionContext,
    event: Event,
) -> Result<TransitionResult, TransitionError> {
    match event {
        Event::Submit {
            turn_id,
            text,
            style,
            at,
        } => submit(state, context, turn_id, &text, style, at),
        Event::SetStyle { style } => Ok(set_style(state, style)),
        Event::SetStreamingEnabled { enabled: true, at } => Ok(enable_streaming(state, at)),
        Event::SetStreamingEnabled { enabled: false, .. } => Ok(disable_streaming(state)),
        Event::Reconnect { at } => Ok(reconnect(state, context, at)),
        Event::ConnectionOpened { epoch } => Ok(connection_opened(state, epoch)),
        Event::ConnectionFailed { epoch, reason } => Ok(connection_failed(state, epoch, &reason)),
        Event::ConnectionClosed { epoch, close } => Ok(connection_closed(state, epoch, &close)),
        Event::StreamMessage { epoch, message } => Ok(stream_message(state, epoch, message)),
        Event::SyncCompleted { turn_id, response } => Ok(sync_completed(state, turn_id, response)),
        Event::DispatchFailed {
            turn_id,
            kind,
            message,
        } => Ok(dispatch_failed(state, turn_id, kind, message)),
    }
}

// ============================================================
// User commands
// ============================================================

fn submit(
    state: &SessionState,
    context: &SessionContext,
    turn_id: TurnId,
    text: &str,
    style: Style,
    at: DateTime<Utc>,
) -> Result<TransitionResult, TransitionError> {
    let text = text.trim();
    if text.is_empty() {
        return Err(TransitionError::EmptyMessage);
    }
    if state.is_busy() {
        return Err(TransitionError::TurnInFlight);
    }

    let turn = Turn::new(turn_id, text, style, at);
    let request = ChatRequest {
        message: text.to_string(),
        style,
        session_id: Some(context.session_id.clone()),
    };
    // Re-evaluated on every submission
    let (route, dispatch) = if state.streaming_enabled && state.connection.is_connected() {
        (
            Route::Streaming { epoch: state.epoch },
            Effect::SendStreaming { turn_id, request },
        )
    } else {
        (Route::Synchronous, Effect::SendSync { turn_id, request })
    };

    let mut next = state.clone();
    next.style = style;
    next.active = Some(ActiveTurn {
        turn: turn.clone(),
        route,
    });

    let mut result = TransitionResult::new(next).with_effect(Effect::RecordTurn(turn));
    if style != state.style {
        result = result.with_effect(Effect::settings_changed(style, state.streaming_enabled));
    }
    Ok(result.with_effect(dispatch))
}

fn set_style(state: &SessionState, style: Style) -> TransitionResult {
    if style == state.style {
        return TransitionResult::unchanged(state);
    }
    let mut next = state.clone();
    next.style = style;
    TransitionResult::new(next)
        .with_effect(Effect::settings_changed(style, state.streaming_enabled))
}

fn enable_streaming(state: &SessionState, at: Instant) -> TransitionResult {
    let mut next = state.clone();
    next.streaming_enabled = true;

    let mut effects = vec![];
    if !state.streaming_enabled {
        effects.push(Effect::settings_changed(state.style, true));
    }
    if !state.connection.is_live() {
        effects.extend(begin_connect(&mut next, at));
    }
    TransitionResult::new(next).with_effects(effects)
}

fn disable_streaming(state: &SessionState) -> TransitionResult {
    let mut next = state.clone();
    next.streaming_enabled = false;

    let mut effects = vec![];
    if state.streaming_enabled {
        effects.push(Effect::settings_changed(state.style, false));
    }
    if state.connection.is_connected() {
        effects.push(Effect::CloseConnection);
    }
    if state.connection.is_live() {
        // Anything still in flight for the old connection is now stale
        next.epoch += 1;
    }
    if state.connection != ConnectionState::Disconnected {
        next.connection = ConnectionState::Disconnected;
        effects.push(Effect::ConnectionChanged(ConnectionState::Disconnected));
    }
    effects.extend(abandon_streaming_turn(&mut next, state.epoch));
    TransitionResult::new(next).with_effects(effects)
}

fn reconnect(state: &SessionState, context: &SessionContext, at: Instant) -> TransitionResult {
    if !state.streaming_enabled || state.connection.is_live() {
        return TransitionResult::unchanged(state);
    }
    if let Some(last) = state.last_connect_attempt {
        if at.saturating_duration_since(last) < context.reconnect_min_interval {
            return TransitionResult::unchanged(state);
        }
    }
    let mut next = state.clone();
    let effects = begin_connect(&mut next, at);
    TransitionResult::new(next).with_effects(effects)
}

fn begin_connect(next: &mut SessionState, at: Instant) -> [Effect; 2] {
    next.epoch += 1;
    next.connection = ConnectionState::Connecting;
    next.last_connect_attempt = Some(at);
    [
        Effect::ConnectionChanged(ConnectionState::Connecting),
        Effect::OpenConnection { epoch: next.epoch },
    ]
}

// ============================================================
// Connection lifecycle
// ============================================================

fn connection_opened(state: &SessionState, epoch: u64) -> TransitionResult {
    if epoch != state.epoch || state.connection != ConnectionState::Connecting {
        return TransitionResult::unchanged(state).with_effect(Effect::DiscardConnection { epoch });
    }
    let mut next = state.clone();
    next.connection = ConnectionState::Connected;
    TransitionResult::new(next)
        .with_effect(Effect::AdoptConnection { epoch })
        .with_effect(Effect::ConnectionChanged(ConnectionState::Connected))
}

fn connection_failed(state: &SessionState, epoch: u64, reason: &str) -> TransitionResult {
    if epoch != state.epoch || state.connection != ConnectionState::Connecting {
        return TransitionResult::unchanged(state);
    }
    let connection = ConnectionState::Errored(format!("connection failed: {reason}"));
    let mut next = state.clone();
    next.connection = connection.clone();
    TransitionResult::new(next).with_effect(Effect::ConnectionChanged(connection))
}

fn connection_closed(state: &SessionState, epoch: u64, close: &CloseInfo) -> TransitionResult {
    if epoch != state.epoch || !state.connection.is_connected() {
        return TransitionResult::unchanged(state);
    }
    let connection = if close.is_normal() {
        ConnectionState::Disconnected
    } else {
        ConnectionState::Errored(CONNECTION_DROPPED.to_string())
    };
    let mut next = state.clone();
    next.connection = connection.clone();
    let abandoned = abandon_streaming_turn(&mut next, epoch);
    TransitionResult::new(next)
        .with_effect(Effect::ConnectionChanged(connection))
        .with_effects(abandoned)
}

/// Fail the active turn if it was waiting on the connection of `epoch`
fn abandon_streaming_turn(next: &mut SessionState, epoch: u64) -> Option<Effect> {
    if !matches!(&next.active, Some(active) if active.route == Route::Streaming { epoch }) {
        return None;
    }
    let mut active = next.active.take()?;
    active
        .turn
        .fail(FailureKind::ConnectionLost, CONNECTION_LOST_DETAIL);
    Some(Effect::RecordTurn(active.turn))
}

// ============================================================
// Turn reconstruction
// ============================================================

fn stream_message(state: &SessionState, epoch: u64, message: StreamMessage) -> TransitionResult {
    let addressed = epoch == state.epoch
        && matches!(&state.active, Some(active) if active.route == Route::Streaming { epoch });
    if !addressed {
        // Stale or duplicate signal; nothing is waiting for it
        return TransitionResult::unchanged(state);
    }

    let mut next = state.clone();
    let Some(mut active) = next.active.take() else {
        return TransitionResult::unchanged(state);
    };
    let turn = &mut active.turn;
    match message.kind {
        StreamEventKind::Refined => turn.refined_text = message.content,
        StreamEventKind::ReplyStart => {
            turn.streaming_reply = true;
            turn.reply_text.clear();
        }
        StreamEventKind::ReplyChunk => turn.reply_text.push_str(&message.content),
        StreamEventKind::ReplyComplete | StreamEventKind::Done => turn.complete(),
        StreamEventKind::Error => turn.fail(FailureKind::Backend, message.content),
        StreamEventKind::Unknown => return TransitionResult::unchanged(state),
    }

    let record = Effect::RecordTurn(active.turn.clone());
    if !active.turn.is_terminal() {
        next.active = Some(active);
    }
    TransitionResult::new(next).with_effect(record)
}

fn sync_completed(state: &SessionState, turn_id: TurnId, response: ChatResponse) -> TransitionResult {
    if !matches!(&state.active, Some(active) if active.id() == turn_id && active.route == Route::Synchronous)
    {
        return TransitionResult::unchanged(state);
    }
    let mut next = state.clone();
    let Some(mut active) = next.active.take() else {
        return TransitionResult::unchanged(state);
    };
    active.turn.refined_text = response.refined_text;
    active.turn.reply_text = response.reply_text;
    active.turn.complete();
    TransitionResult::new(next).with_effect(Effect::RecordTurn(active.turn))
}

fn dispatch_failed(
    state: &SessionState,
    turn_id: TurnId,
    kind: TransportErrorKind,
    message: String,
) -> TransitionResult {
    if !matches!(&state.active, Some(active) if active.id() == turn_id) {
        return TransitionResult::unchanged(state);
    }
    let mut next = state.clone();
    let Some(mut active) = next.active.take() else {
        return TransitionResult::unchanged(state);
    };
    active.turn.fail(FailureKind::Transport(kind), message);
    TransitionResult::new(next).with_effect(Effect::RecordTurn(active.turn))
}
