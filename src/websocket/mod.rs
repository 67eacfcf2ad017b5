//! Client-side WebSocket framing (RFC 6455, hybi draft 8).
//!
//! This module provides incremental frame parsing, masked frame encoding, the
//! opening handshake, and async reader/writer halves over tokio streams.

mod frame;
mod handshake;
mod parser;
mod stream;

pub use frame::{Frame, MAX_CONTROL_PAYLOAD, Opcode, apply_mask, close_code, parse_close_payload};
pub use handshake::{
    ClientHandshake, HandshakeError, PROTOCOL_VERSION, WEBSOCKET_GUID, accept_key, generate_key,
};
pub use parser::{ControlFrame, Decoded, FrameParser, ProtocolViolation};
pub use stream::{FrameReader, FrameWriter};
