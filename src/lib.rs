//! Refine Chat client
//!
//! Client-side session controller for a sentence correction and reply
//! backend. A turn is sent either over a persistent WebSocket, which
//! streams the corrected sentence and the reply in pieces, or over a
//! one-shot HTTP request. The controller owns the turn history and the
//! connection state and publishes every change to its observers.

pub mod config;
pub mod session;
pub mod transport;
