//! Streaming session controller
//!
//! Elm-style split: [`transition`] is a pure function from
//! `(state, event)` to `(state, effects)`, and [`SessionController`] is the
//! task that feeds it events and executes the effects against the
//! transports.

mod controller;
mod effect;
mod event;
mod state;
mod transition;
pub mod turn;

#[cfg(test)]
pub(crate) mod testing;

pub use controller::{
    SessionClosed, SessionController, SessionHandle, SessionSettings, SessionSnapshot,
    SessionUpdate, UpdateListener,
};
pub use effect::Effect;
pub use event::Event;
pub use state::{
    ActiveTurn, ConnectionState, Route, SessionContext, SessionState, CONNECTION_DROPPED,
    CONNECTION_LOST_DETAIL,
};
pub use transition::{transition, TransitionError, TransitionResult};
pub use turn::{FailureKind, Turn, TurnId, TurnOutcome, ERROR_PLACEHOLDER};
