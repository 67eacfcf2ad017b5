//! Client for a Socket.IO-style chat-room protocol over WebSocket.
//!
//! The crate is layered bottom-up:
//!
//! - [`websocket`]: frame codec, incremental frame parser and the HTTP
//!   Upgrade handshake (draft protocol version 8).
//! - [`transport`]: one WebSocket connection driven by a spawned task,
//!   including the close handshake and drop detection.
//! - [`session`]: one logical chat client. Turns commands into
//!   length-prefixed JSON envelopes, correlates responses, republishes
//!   server pushes as [`BotEvent`]s and moves between chat servers when a
//!   room lives elsewhere.

#![warn(clippy::dbg_macro, clippy::print_stdout)]
#![warn(missing_docs)]

pub mod session;
pub mod transport;
pub mod websocket;

#[cfg(test)]
mod test_support;

pub use session::{
    Api, BotEvent, Command, Credentials, Endpoint, EventStream, PendingResponse, Profile, Session,
    SessionConfig, SessionError, SessionStatus, VoteDirection,
};
pub use transport::{Transport, TransportError, TransportEvent, TransportState};
